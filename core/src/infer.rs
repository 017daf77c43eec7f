use crate::normalize::{normalize_scores, normalize_vectors};
use crate::InferError;
use inference_adapter_backend::{Backend, BackendKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::instrument;

/// Inference struct
#[derive(Debug, Clone)]
pub struct Infer {
    backend: Backend,
    /// Inference limit
    limit_concurrent_requests: Arc<Semaphore>,
}

impl Infer {
    pub fn new(backend: Backend, max_concurrent_requests: usize) -> Self {
        // Inference limit with a semaphore
        let semaphore = Arc::new(Semaphore::new(max_concurrent_requests));

        Self {
            backend,
            limit_concurrent_requests: semaphore,
        }
    }

    #[instrument(skip(self))]
    pub fn try_acquire_permit(&self) -> Result<OwnedSemaphorePermit, InferError> {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.clone()
            .limit_concurrent_requests
            .try_acquire_owned()
            .map_err(|err| {
                let counter = metrics::counter!("adapter_request_failure", "err" => "overloaded");
                counter.increment(1);
                tracing::error!("{err}");
                InferError::from(err)
            })
    }

    /// Embed `texts` and resolve the embedder output into one vector per text.
    ///
    /// An empty batch is answered without calling the embedder.
    #[instrument(skip(self, texts, _permit), fields(batch_size = texts.len()))]
    pub async fn vectorize(
        &self,
        texts: Vec<String>,
        _permit: OwnedSemaphorePermit,
    ) -> Result<VectorizeInferResponse, InferError> {
        let start_time = Instant::now();
        let expected = texts.len();

        if expected == 0 {
            return Ok(VectorizeInferResponse {
                vectors: Vec::new(),
                metadata: InferMetadata::default(),
            });
        }

        let counter = metrics::counter!("adapter_vectorize_count");
        counter.increment(1);

        let (raw, inference) = self.backend.embed(texts).await.map_err(|err| {
            let counter = metrics::counter!("adapter_request_failure", "err" => "backend");
            counter.increment(1);
            tracing::error!("{err}");
            InferError::from(err)
        })?;

        let vectors = normalize_vectors(raw, expected).map_err(|err| {
            let counter = metrics::counter!("adapter_request_failure", "err" => "shape");
            counter.increment(1);
            tracing::error!("{err}");
            InferError::from(err)
        })?;

        let response = VectorizeInferResponse {
            vectors,
            metadata: InferMetadata {
                inference,
                total: start_time.elapsed(),
            },
        };

        // Metrics
        let counter = metrics::counter!("adapter_vectorize_success");
        counter.increment(1);
        let histogram = metrics::histogram!("adapter_vectorize_duration");
        histogram.record(response.metadata.total.as_secs_f64());
        let histogram = metrics::histogram!("adapter_vectorize_inference_duration");
        histogram.record(response.metadata.inference.as_secs_f64());

        Ok(response)
    }

    /// Score every document against `query` in a single batched reranker call.
    ///
    /// `scores[i]` belongs to `documents[i]`. An empty batch is answered without calling the
    /// reranker.
    #[instrument(skip(self, query, documents, _permit), fields(batch_size = documents.len()))]
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        _permit: OwnedSemaphorePermit,
    ) -> Result<RerankInferResponse, InferError> {
        let start_time = Instant::now();
        let expected = documents.len();

        if expected == 0 {
            return Ok(RerankInferResponse {
                scores: Vec::new(),
                metadata: InferMetadata::default(),
            });
        }

        let counter = metrics::counter!("adapter_rerank_count");
        counter.increment(1);

        let pairs = documents
            .iter()
            .map(|document| (query.to_string(), document.clone()))
            .collect();

        let (raw, inference) = self.backend.score(pairs).await.map_err(|err| {
            let counter = metrics::counter!("adapter_request_failure", "err" => "backend");
            counter.increment(1);
            tracing::error!("{err}");
            InferError::from(err)
        })?;

        let scores = normalize_scores(raw, expected).map_err(|err| {
            let counter = metrics::counter!("adapter_request_failure", "err" => "shape");
            counter.increment(1);
            tracing::error!("{err}");
            InferError::from(err)
        })?;

        let response = RerankInferResponse {
            scores,
            metadata: InferMetadata {
                inference,
                total: start_time.elapsed(),
            },
        };

        // Metrics
        let counter = metrics::counter!("adapter_rerank_success");
        counter.increment(1);
        let histogram = metrics::histogram!("adapter_rerank_duration");
        histogram.record(response.metadata.total.as_secs_f64());
        let histogram = metrics::histogram!("adapter_rerank_inference_duration");
        histogram.record(response.metadata.inference.as_secs_f64());

        Ok(response)
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> bool {
        self.backend.health().await.is_ok()
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.backend.health_watcher()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind
    }
}

#[derive(Debug, Default)]
pub struct InferMetadata {
    pub inference: Duration,
    pub total: Duration,
}

#[derive(Debug)]
pub struct VectorizeInferResponse {
    pub vectors: Vec<Vec<f64>>,
    pub metadata: InferMetadata,
}

#[derive(Debug)]
pub struct RerankInferResponse {
    pub scores: Vec<f64>,
    pub metadata: InferMetadata,
}
