use crate::{ClientError, Result};
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::instrument;

/// Async client for an upstream inference server
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    inputs: Vec<[&'a str; 2]>,
    raw_scores: bool,
}

impl Client {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        Ok(Self { http })
    }

    /// Get upstream health
    #[instrument(skip(self))]
    pub async fn health(&self, url: &Url) -> Result<()> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(())
    }

    /// Embed a batch of texts. The JSON answer is returned untouched.
    #[instrument(skip_all, fields(batch_size = inputs.len()))]
    pub async fn embed(&self, url: &Url, inputs: &[String]) -> Result<Value> {
        self.post(url, &EmbedRequest { inputs }).await
    }

    /// Score a batch of (query, document) pairs with a sequence classification model
    #[instrument(skip_all, fields(batch_size = pairs.len()))]
    pub async fn predict(&self, url: &Url, pairs: &[(String, String)]) -> Result<Value> {
        let request = PredictRequest {
            inputs: pairs
                .iter()
                .map(|(query, document)| [query.as_str(), document.as_str()])
                .collect(),
            raw_scores: false,
        };
        self.post(url, &request).await
    }

    async fn post<T: Serialize>(&self, url: &Url, body: &T) -> Result<Value> {
        let response = self.http.post(url.clone()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Prefer the `error` field of a JSON error body, fall back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
