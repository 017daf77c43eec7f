mod common;

use crate::common::{
    start_server, start_server_with, Broken, LengthEmbedder, ScriptedReranker, ServerOptions,
};
use anyhow::Result;
use serde_json::{json, Value};

#[tokio::test]
async fn test_ready() -> Result<()> {
    let url = start_server(LengthEmbedder::default(), ScriptedReranker::new(&[])).await?;

    let res = reqwest::get(format!("{url}/.well-known/ready")).await?;
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await?, "Ready");

    Ok(())
}

#[tokio::test]
async fn test_meta() -> Result<()> {
    let url = start_server(LengthEmbedder::default(), ScriptedReranker::new(&[])).await?;

    let res = reqwest::get(format!("{url}/meta")).await?;
    assert_eq!(res.status(), 200);

    let body = res.json::<Value>().await?;
    insta::assert_json_snapshot!(body, @r###"
    {
      "status": "Ready"
    }
    "###);

    Ok(())
}

#[tokio::test]
async fn test_static_routes_ignore_backend_health() -> Result<()> {
    let url = start_server(Broken::new("down"), Broken::new("down")).await?;

    let res = reqwest::get(format!("{url}/.well-known/ready")).await?;
    assert_eq!(res.status(), 200);
    let res = reqwest::get(format!("{url}/meta")).await?;
    assert_eq!(res.status(), 200);

    Ok(())
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let url = start_server(LengthEmbedder::default(), ScriptedReranker::new(&[])).await?;
    let res = reqwest::get(format!("{url}/health")).await?;
    assert_eq!(res.status(), 200);

    let url = start_server(Broken::new("down"), ScriptedReranker::new(&[])).await?;
    let res = reqwest::get(format!("{url}/health")).await?;
    assert_eq!(res.status(), 503);
    assert_eq!(res.json::<Value>().await?, json!({"error": "unhealthy"}));

    Ok(())
}

#[tokio::test]
async fn test_info() -> Result<()> {
    let url = start_server(LengthEmbedder::default(), ScriptedReranker::new(&[])).await?;

    let res = reqwest::get(format!("{url}/info")).await?;
    assert_eq!(res.status(), 200);

    let info = res.json::<Value>().await?;
    assert_eq!(info["backend"], "custom");
    assert_eq!(info["max_concurrent_requests"], 4);
    assert_eq!(info["max_client_batch_size"], Value::Null);

    Ok(())
}

#[tokio::test]
async fn test_openapi_document() -> Result<()> {
    let url = start_server(LengthEmbedder::default(), ScriptedReranker::new(&[])).await?;

    let res = reqwest::get(format!("{url}/api-doc/openapi.json")).await?;
    assert_eq!(res.status(), 200);

    let doc = res.json::<Value>().await?;
    for path in ["/vectors", "/rerank", "/meta", "/.well-known/ready"] {
        assert!(doc["paths"].get(path).is_some(), "missing {path}");
    }

    Ok(())
}

#[tokio::test]
async fn test_api_key() -> Result<()> {
    let options = ServerOptions {
        api_key: Some("secret".to_string()),
        ..Default::default()
    };
    let url =
        start_server_with(LengthEmbedder::default(), ScriptedReranker::new(&[]), options).await?;
    let client = reqwest::Client::new();

    let res = client.get(format!("{url}/meta")).send().await?;
    assert_eq!(res.status(), 401);

    let res = client
        .get(format!("{url}/meta"))
        .bearer_auth("secret")
        .send()
        .await?;
    assert_eq!(res.status(), 200);

    Ok(())
}
