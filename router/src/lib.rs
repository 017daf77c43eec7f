/// Inference adapter webserver
pub mod http;
mod logging;
mod prometheus;
mod shutdown;

pub use logging::init_logging;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderValue};
use inference_adapter_backend::{Backend, RemoteConfig, Url};
use inference_adapter_core::infer::Infer;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::Span;
use utoipa::ToSchema;

/// Router settings shared by the CLI and embedders of the library
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_concurrent_requests: usize,
    pub max_client_batch_size: Option<usize>,
    pub hostname: Option<String>,
    pub port: u16,
    pub payload_limit: usize,
    pub api_key: Option<String>,
    pub prometheus_port: u16,
    pub cors_allow_origin: Option<Vec<String>>,
}

/// Start the adapter in front of an upstream inference server
pub async fn run(
    embed_url: String,
    rerank_url: String,
    health_url: Option<String>,
    backend_timeout: Duration,
    config: RouterConfig,
) -> Result<()> {
    let remote_config = RemoteConfig {
        embed_url: parse_url(&embed_url).context("invalid `--embed-url`")?,
        rerank_url: parse_url(&rerank_url).context("invalid `--rerank-url`")?,
        health_url: health_url
            .as_deref()
            .map(parse_url)
            .transpose()
            .context("invalid `--health-url`")?,
        timeout: backend_timeout,
    };

    let backend = Backend::remote(remote_config).context("Could not create backend")?;
    let infer = Infer::new(backend, config.max_concurrent_requests);

    // The adapter still answers requests that need no model while the upstream is starting
    if !infer.health().await {
        tracing::warn!("Backend is not healthy yet. Requests will fail until it is");
    }

    let info = Info {
        backend: infer.backend_kind().to_string(),
        embed_url: Some(embed_url),
        rerank_url: Some(rerank_url),
        max_concurrent_requests: config.max_concurrent_requests,
        max_client_batch_size: config.max_client_batch_size,
        version: env!("CARGO_PKG_VERSION"),
        sha: option_env!("VERGEN_GIT_SHA"),
    };

    serve(infer, info, config).await
}

/// Serve an already built [`Infer`]
pub async fn serve(infer: Infer, info: Info, config: RouterConfig) -> Result<()> {
    let addr = match config
        .hostname
        .as_deref()
        .unwrap_or("0.0.0.0")
        .parse::<IpAddr>()
    {
        Ok(ip) => SocketAddr::new(ip, config.port),
        Err(_) => {
            tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port)
        }
    };

    let prom_builder = prometheus::prometheus_builder(addr, config.prometheus_port)?;

    http::server::run(
        infer,
        info,
        addr,
        prom_builder,
        config.payload_limit,
        config.api_key,
        config.cors_allow_origin,
    )
    .await
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).with_context(|| format!("`{url}` is not a valid URL"))
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Info {
    /// Backend info
    #[schema(example = "remote")]
    pub backend: String,
    #[schema(nullable = true, example = "http://127.0.0.1:8080/embed")]
    pub embed_url: Option<String>,
    #[schema(nullable = true, example = "http://127.0.0.1:8081/predict")]
    pub rerank_url: Option<String>,
    /// Router Parameters
    #[schema(example = "512")]
    pub max_concurrent_requests: usize,
    #[schema(nullable = true, example = "null", default = "null")]
    pub max_client_batch_size: Option<usize>,
    /// Router Info
    #[schema(example = "0.1.0")]
    pub version: &'static str,
    #[schema(nullable = true, example = "null")]
    pub sha: Option<&'static str>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorType {
    BadRequest,
    Internal,
    Overloaded,
    Unhealthy,
    PayloadTooLarge,
}

/// Error body. Only the message is part of the wire contract.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "Body must include key \"text\".")]
    pub error: String,
    #[serde(skip)]
    pub error_type: ErrorType,
}

impl ErrorResponse {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            error_type: ErrorType::BadRequest,
        }
    }
}

/// Timing of a served request
pub(crate) struct ResponseMetadata {
    batch_size: usize,
    start_time: Instant,
    inference_time: Duration,
}

impl ResponseMetadata {
    pub(crate) fn new(batch_size: usize, start_time: Instant, inference_time: Duration) -> Self {
        Self {
            batch_size,
            start_time,
            inference_time,
        }
    }

    pub(crate) fn record_span(&self, span: &Span) {
        span.record("batch_size", self.batch_size);
        span.record(
            "total_time",
            tracing::field::debug(self.start_time.elapsed()),
        );
        span.record("inference_time", tracing::field::debug(self.inference_time));
    }

    pub(crate) fn record_metrics(&self, method: &'static str) {
        let histogram = metrics::histogram!("adapter_request_duration", "method" => method);
        histogram.record(self.start_time.elapsed().as_secs_f64());
        let histogram =
            metrics::histogram!("adapter_request_inference_duration", "method" => method);
        histogram.record(self.inference_time.as_secs_f64());
        let histogram = metrics::histogram!("adapter_request_input_count", "method" => method);
        histogram.record(self.batch_size as f64);
    }
}

impl From<ResponseMetadata> for HeaderMap {
    fn from(value: ResponseMetadata) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("x-batch-size", HeaderValue::from(value.batch_size));
        headers.insert(
            "x-total-time",
            HeaderValue::from(value.start_time.elapsed().as_millis() as u64),
        );
        headers.insert(
            "x-inference-time",
            HeaderValue::from(value.inference_time.as_millis() as u64),
        );
        headers
    }
}
