#![allow(dead_code)]

use anyhow::Result;
use inference_adapter_backend::{
    Backend, BackendError, BackendKind, Embedder, RawOutput, Reranker,
};
use inference_adapter_core::infer::Infer;
use inference_adapter_router::http::server::router;
use inference_adapter_router::Info;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Serialize, Deserialize, Debug)]
pub struct Score(pub f64);

impl Score {
    fn is_close(&self, other: &Self, abs_tol: f64) -> bool {
        is_close::default()
            .abs_tol(abs_tol)
            .is_close(self.0, other.0)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        // Default tolerance for equality
        self.is_close(other, 1e-6)
    }
}

/// Shared call counter of a stub collaborator
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Embeds a text as `[chars, position]`. A single text is answered with an unwrapped vector.
#[derive(Default)]
pub struct LengthEmbedder {
    pub calls: Calls,
}

impl Embedder for LengthEmbedder {
    fn embed(&self, texts: Vec<String>) -> Result<RawOutput, BackendError> {
        self.calls.hit();
        let mut vectors: Vec<Vec<f32>> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| vec![text.chars().count() as f32, i as f32])
            .collect();
        if vectors.len() == 1 {
            return Ok(RawOutput::from(vectors.remove(0)));
        }
        Ok(RawOutput::from(vectors))
    }
}

/// Always answers with the same vectors, whatever the batch size
pub struct FixedEmbedder(pub Vec<Vec<f32>>);

impl Embedder for FixedEmbedder {
    fn embed(&self, _texts: Vec<String>) -> Result<RawOutput, BackendError> {
        Ok(RawOutput::from(self.0.clone()))
    }
}

/// Answers every batch with the same scores
pub struct ScriptedReranker {
    pub scores: Vec<f64>,
    pub calls: Calls,
}

impl ScriptedReranker {
    pub fn new(scores: &[f64]) -> Self {
        Self {
            scores: scores.to_vec(),
            calls: Calls::default(),
        }
    }
}

impl Reranker for ScriptedReranker {
    fn score(&self, _pairs: Vec<(String, String)>) -> Result<RawOutput, BackendError> {
        self.calls.hit();
        if self.scores.len() == 1 {
            return Ok(RawOutput::from(self.scores[0]));
        }
        Ok(RawOutput::Sequence(
            self.scores.iter().map(|s| RawOutput::from(*s)).collect(),
        ))
    }
}

/// Fails every call with the same message
pub struct Broken {
    pub message: &'static str,
    pub calls: Calls,
}

impl Broken {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
            calls: Calls::default(),
        }
    }
}

impl Embedder for Broken {
    fn embed(&self, _texts: Vec<String>) -> Result<RawOutput, BackendError> {
        self.calls.hit();
        Err(BackendError::Inference(self.message.to_string()))
    }
}

impl Reranker for Broken {
    fn score(&self, _pairs: Vec<(String, String)>) -> Result<RawOutput, BackendError> {
        self.calls.hit();
        Err(BackendError::Inference(self.message.to_string()))
    }
}

/// Panics on every call
pub struct Exploding;

impl Embedder for Exploding {
    fn embed(&self, _texts: Vec<String>) -> Result<RawOutput, BackendError> {
        panic!("model exploded")
    }
}

#[derive(Default)]
pub struct ServerOptions {
    pub max_client_batch_size: Option<usize>,
    pub api_key: Option<String>,
    pub payload_limit: Option<usize>,
}

pub async fn start_server(
    embedder: impl Embedder + Send + 'static,
    reranker: impl Reranker + Send + 'static,
) -> Result<String> {
    start_server_with(embedder, reranker, ServerOptions::default()).await
}

/// Serve the router on an ephemeral port and return its base url
pub async fn start_server_with(
    embedder: impl Embedder + Send + 'static,
    reranker: impl Reranker + Send + 'static,
    options: ServerOptions,
) -> Result<String> {
    let backend = Backend::new(Box::new(embedder), Box::new(reranker), BackendKind::Custom);
    let infer = Infer::new(backend, 4);

    let info = Info {
        backend: BackendKind::Custom.to_string(),
        embed_url: None,
        rerank_url: None,
        max_concurrent_requests: 4,
        max_client_batch_size: options.max_client_batch_size,
        version: env!("CARGO_PKG_VERSION"),
        sha: None,
    };

    // Not installed globally: every test server gets its own registry
    let prom_handle = PrometheusBuilder::new().build_recorder().handle();

    let payload_limit = options.payload_limit.unwrap_or(2_000_000);
    let app = router(infer, info, prom_handle, payload_limit, options.api_key, None)?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });

    Ok(format!("http://{addr}"))
}
