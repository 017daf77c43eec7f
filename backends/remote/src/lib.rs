//! Backend forwarding batches to an upstream inference server over HTTP

mod client;

pub use client::Client;
pub use inference_adapter_backend_core::{BackendError, Embedder, RawOutput, Reranker};
pub use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Could not connect to upstream inference server: {0}")]
    Connection(String),
    #[error("Upstream inference server returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("Upstream error: {0}")]
    Inference(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let err = if err.is_connect() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Inference(err.to_string())
        };
        tracing::error!("{err}");
        err
    }
}

impl From<ClientError> for BackendError {
    fn from(err: ClientError) -> Self {
        BackendError::Inference(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub embed_url: Url,
    pub rerank_url: Url,
    pub health_url: Option<Url>,
    pub timeout: Duration,
}

/// Blocking facade over [`Client`].
///
/// Owns its own current-thread runtime so it can be driven from the backend thread.
pub struct RemoteBackend {
    tokio_runtime: Runtime,
    client: Client,
    config: RemoteConfig,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> std::result::Result<Self, BackendError> {
        let tokio_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| BackendError::Start(format!("Could not start Tokio runtime: {err}")))?;

        let client = Client::new(config.timeout)
            .map_err(|err| BackendError::Start(format!("Could not build HTTP client: {err}")))?;

        tracing::info!(
            embed_url = %config.embed_url,
            rerank_url = %config.rerank_url,
            "Remote backend configured"
        );

        Ok(Self {
            tokio_runtime,
            client,
            config,
        })
    }
}

impl Embedder for RemoteBackend {
    fn health(&self) -> std::result::Result<(), BackendError> {
        let Some(url) = &self.config.health_url else {
            return Ok(());
        };
        self.tokio_runtime
            .block_on(self.client.health(url))
            .map_err(|_| BackendError::Unhealthy)
    }

    fn embed(&self, texts: Vec<String>) -> std::result::Result<RawOutput, BackendError> {
        let value = self
            .tokio_runtime
            .block_on(self.client.embed(&self.config.embed_url, &texts))?;
        RawOutput::from_json(value)
    }
}

impl Reranker for RemoteBackend {
    fn score(&self, pairs: Vec<(String, String)>) -> std::result::Result<RawOutput, BackendError> {
        let value = self
            .tokio_runtime
            .block_on(self.client.predict(&self.config.rerank_url, &pairs))?;
        RawOutput::from_json(flatten_predictions(value))
    }
}

/// Replace `{"score": x, "label": ..}` prediction objects with their score.
///
/// Sequence classification servers answer one list of predictions per pair; a reranker
/// head has a single label so each pair collapses to `[x]`.
fn flatten_predictions(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(score @ Value::Number(_)) = map.get("score") {
                return score.clone();
            }
            Value::Object(map)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(flatten_predictions).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::flatten_predictions;
    use serde_json::json;

    #[test]
    fn predictions_collapse_to_scores() {
        let value = json!([
            [{"score": 0.25, "label": "LABEL_0"}],
            [{"score": 0.75, "label": "LABEL_0"}]
        ]);
        assert_eq!(flatten_predictions(value), json!([[0.25], [0.75]]));
    }

    #[test]
    fn plain_scores_are_untouched() {
        assert_eq!(flatten_predictions(json!([0.1, 0.2])), json!([0.1, 0.2]));
        assert_eq!(flatten_predictions(json!(0.5)), json!(0.5));
    }

    #[test]
    fn objects_without_score_are_kept() {
        let value = json!([{"label": "LABEL_0"}]);
        assert_eq!(flatten_predictions(value.clone()), value);
    }
}
