/// HTTP Server logic
use crate::http::types::{
    Input, MetaResponse, RerankRequest, RerankResponse, Scored, VectorsRequest, VectorsResponse,
};
use crate::{shutdown, ErrorResponse, ErrorType, Info, ResponseMetadata};
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{http, Json, Router};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use inference_adapter_core::infer::Infer;
use inference_adapter_core::InferError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::any::Any;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::instrument;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Readiness probe
#[utoipa::path(
get,
tag = "Inference Adapter",
path = "/.well-known/ready",
responses((status = 200, description = "The adapter accepts requests", body = String,
example = json ! ("Ready")))
)]
async fn ready() -> &'static str {
    "Ready"
}

/// Static service status
#[utoipa::path(
get,
tag = "Inference Adapter",
path = "/meta",
responses((status = 200, description = "Service status", body = MetaResponse))
)]
async fn meta() -> Json<MetaResponse> {
    Json(MetaResponse { status: "Ready" })
}

/// Inference Adapter endpoint info
#[utoipa::path(
get,
tag = "Inference Adapter",
path = "/info",
responses((status = 200, description = "Served backend info", body = Info))
)]
#[instrument]
async fn get_model_info(info: Extension<Info>) -> Json<Info> {
    Json(info.0)
}

#[utoipa::path(
get,
tag = "Inference Adapter",
path = "/health",
responses(
(status = 200, description = "Everything is working fine"),
(status = 503, description = "The backend is down", body = ErrorResponse,
example = json ! ({"error": "unhealthy"})),
)
)]
#[instrument(skip(infer))]
/// Health check method
async fn health(infer: Extension<Infer>) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    match infer.health().await {
        true => Ok(()),
        false => Err(ErrorResponse {
            error: "unhealthy".to_string(),
            error_type: ErrorType::Unhealthy,
        })?,
    }
}

/// Get one vector per input text
#[utoipa::path(
post,
tag = "Inference Adapter",
path = "/vectors",
request_body = VectorsRequest,
responses(
(status = 200, description = "Vectors", body = VectorsResponse),
(status = 400, description = "Malformed request", body = ErrorResponse,
example = json ! ({"error": "Body must include key \"text\"."})),
(status = 413, description = "Body over the payload limit", body = ErrorResponse,
example = json ! ({"error": "Failed to buffer the request body: length limit exceeded"})),
(status = 429, description = "Model is overloaded", body = ErrorResponse,
example = json ! ({"error": "Model is overloaded"})),
(status = 500, description = "Embedder error", body = ErrorResponse,
example = json ! ({"error": "Embedding count does not match input texts."})),
)
)]
#[instrument(skip_all, fields(batch_size, total_time, inference_time))]
async fn vectors(
    infer: Extension<Infer>,
    info: Extension<Info>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(HeaderMap, Json<VectorsResponse>), (StatusCode, Json<ErrorResponse>)> {
    let span = tracing::Span::current();
    let start_time = Instant::now();

    let counter = metrics::counter!("adapter_request_count", "method" => "vectors");
    counter.increment(1);

    let body = body.map_err(body_failure)?;
    let req = VectorsRequest::from_body(&body).map_err(validation_failure)?;
    check_batch_size(&req.text, &info)?;

    let texts = req.text.into_texts();
    let batch_size = texts.len();

    let (vectors, inference_time) = if texts.is_empty() {
        (Vec::new(), Duration::ZERO)
    } else {
        let permit = infer.try_acquire_permit().map_err(ErrorResponse::from)?;
        let response = infer
            .vectorize(texts, permit)
            .await
            .map_err(ErrorResponse::from)?;
        (response.vectors, response.metadata.inference)
    };

    let metadata = ResponseMetadata::new(batch_size, start_time, inference_time);
    metadata.record_span(&span);
    metadata.record_metrics("vectors");

    let counter = metrics::counter!("adapter_request_success", "method" => "vectors");
    counter.increment(1);

    tracing::info!("Success");

    Ok((metadata.into(), Json(VectorsResponse { vectors })))
}

/// Score documents against a query
///
/// The body may also be the request object encoded as a JSON string.
#[utoipa::path(
post,
tag = "Inference Adapter",
path = "/rerank",
request_body = RerankRequest,
responses(
(status = 200, description = "One score per document, in document order", body = RerankResponse),
(status = 400, description = "Malformed request", body = ErrorResponse,
example = json ! ({"error": "Invalid input format. Expected a dictionary with 'query' and 'documents'."})),
(status = 413, description = "Body over the payload limit", body = ErrorResponse,
example = json ! ({"error": "Failed to buffer the request body: length limit exceeded"})),
(status = 429, description = "Model is overloaded", body = ErrorResponse,
example = json ! ({"error": "Model is overloaded"})),
(status = 500, description = "Reranker error", body = ErrorResponse,
example = json ! ({"error": "Score count does not match input documents."})),
)
)]
#[instrument(skip_all, fields(batch_size, total_time, inference_time))]
async fn rerank(
    infer: Extension<Infer>,
    info: Extension<Info>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(HeaderMap, Json<RerankResponse>), (StatusCode, Json<ErrorResponse>)> {
    let span = tracing::Span::current();
    let start_time = Instant::now();

    let counter = metrics::counter!("adapter_request_count", "method" => "rerank");
    counter.increment(1);

    let body = body.map_err(body_failure)?;
    let req = RerankRequest::from_body(&body).map_err(validation_failure)?;

    let batch_size = req.documents.len();
    if let Some(max_client_batch_size) = info.max_client_batch_size {
        if batch_size > max_client_batch_size {
            return Err(batch_size_error(batch_size, max_client_batch_size).into());
        }
    }

    // Nothing to score: answer without touching the reranker
    let (scores, inference_time) = if req.documents.is_empty() {
        (Vec::new(), Duration::ZERO)
    } else {
        let permit = infer.try_acquire_permit().map_err(ErrorResponse::from)?;
        let response = infer
            .rerank(&req.query, &req.documents, permit)
            .await
            .map_err(ErrorResponse::from)?;

        let scores = req
            .documents
            .into_iter()
            .zip(response.scores)
            .map(|(document, score)| Scored { document, score })
            .collect();
        (scores, response.metadata.inference)
    };

    let metadata = ResponseMetadata::new(batch_size, start_time, inference_time);
    metadata.record_span(&span);
    metadata.record_metrics("rerank");

    let counter = metrics::counter!("adapter_request_success", "method" => "rerank");
    counter.increment(1);

    tracing::info!("Success");

    Ok((metadata.into(), Json(RerankResponse { scores })))
}

/// Prometheus metrics scrape endpoint
#[utoipa::path(
get,
tag = "Inference Adapter",
path = "/metrics",
responses((status = 200, description = "Prometheus Metrics", body = String))
)]
async fn metrics(prom_handle: Extension<PrometheusHandle>) -> String {
    prom_handle.render()
}

fn check_batch_size(input: &Input, info: &Info) -> Result<(), ErrorResponse> {
    match info.max_client_batch_size {
        Some(max_client_batch_size) if input.len() > max_client_batch_size => {
            Err(batch_size_error(input.len(), max_client_batch_size))
        }
        _ => Ok(()),
    }
}

fn batch_size_error(batch_size: usize, max_client_batch_size: usize) -> ErrorResponse {
    let message =
        format!("batch size {batch_size} > maximum allowed batch size {max_client_batch_size}");
    tracing::error!("{message}");
    let counter = metrics::counter!("adapter_request_failure", "err" => "batch_size");
    counter.increment(1);
    ErrorResponse::bad_request(message)
}

/// The body could not be read, most often because it is over `--payload-limit`
fn body_failure(rejection: BytesRejection) -> ErrorResponse {
    let error_type = match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ErrorType::PayloadTooLarge,
        _ => ErrorType::BadRequest,
    };
    let err = ErrorResponse {
        error: rejection.body_text(),
        error_type,
    };
    tracing::error!("{}", err.error);
    let counter = metrics::counter!("adapter_request_failure", "err" => "payload");
    counter.increment(1);
    err
}

fn validation_failure(err: ErrorResponse) -> ErrorResponse {
    tracing::error!("{}", err.error);
    let counter = metrics::counter!("adapter_request_failure", "err" => "validation");
    counter.increment(1);
    err
}

/// Last resort boundary: a panicking handler still answers with a JSON error
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let error = if let Some(message) = err.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else {
        "Internal server error".to_string()
    };
    tracing::error!("handler panicked: {error}");

    let counter = metrics::counter!("adapter_request_failure", "err" => "panic");
    counter.increment(1);

    let err = ErrorResponse {
        error,
        error_type: ErrorType::Internal,
    };
    <(StatusCode, Json<ErrorResponse>)>::from(err).into_response()
}

#[derive(OpenApi)]
#[openapi(
paths(
ready,
meta,
get_model_info,
health,
vectors,
rerank,
metrics,
),
components(
schemas(
Input,
Info,
VectorsRequest,
VectorsResponse,
RerankRequest,
Scored,
RerankResponse,
MetaResponse,
ErrorResponse,
)
),
tags(
(name = "Inference Adapter", description = "Embedder and reranker API for vector databases")
),
info(
title = "Inference Adapter",
license(
name = "Apache 2.0",
url = "https://www.apache.org/licenses/LICENSE-2.0"
)
)
)]
struct ApiDoc;

/// Build the application router
pub fn router(
    infer: Infer,
    info: Info,
    prom_handle: PrometheusHandle,
    payload_limit: usize,
    api_key: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<Router, anyhow::Error> {
    // CORS allowed origins
    let allow_origin = match cors_allow_origin {
        Some(cors_allow_origin) => AllowOrigin::list(
            cors_allow_origin
                .into_iter()
                .map(|origin| origin.parse::<HeaderValue>())
                .collect::<Result<Vec<_>, _>>()
                .context("invalid `--cors-allow-origin`")?,
        ),
        None => AllowOrigin::any(),
    };

    // CORS layer
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_origin(allow_origin);

    let mut app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Vector database module routes
        .route("/.well-known/ready", get(ready))
        .route("/meta", get(meta))
        .route("/vectors", post(vectors))
        .route("/rerank", post(rerank))
        // Base Health route
        .route("/health", get(health))
        .route("/info", get(get_model_info))
        // Prometheus metrics route
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(payload_limit))
        .layer(Extension(infer))
        .layer(Extension(info))
        .layer(Extension(prom_handle))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(OtelAxumLayer::default())
        .layer(cors_layer);

    if let Some(api_key) = api_key {
        let mut prefix = "Bearer ".to_string();
        prefix.push_str(&api_key);

        // Leak to allow FnMut
        let api_key: &'static str = prefix.leak();

        let auth = move |headers: HeaderMap,
                         request: axum::extract::Request,
                         next: axum::middleware::Next| async move {
            match headers.get(AUTHORIZATION) {
                Some(token) if token == api_key => {
                    let response = next.run(request).await;
                    Ok(response)
                }
                _ => Err(StatusCode::UNAUTHORIZED),
            }
        };

        app = app.layer(axum::middleware::from_fn(auth));
    }

    Ok(app)
}

/// Serving method
pub async fn run(
    infer: Infer,
    info: Info,
    addr: SocketAddr,
    prom_builder: PrometheusBuilder,
    payload_limit: usize,
    api_key: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<(), anyhow::Error> {
    let prom_handle = prom_builder
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let app = router(
        infer,
        info,
        prom_handle,
        payload_limit,
        api_key,
        cors_allow_origin,
    )?;

    // Run server
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    tracing::info!("Starting HTTP server: {}", &addr);
    tracing::info!("Ready");

    axum::serve(listener, app)
        // Wait until all requests are finished to shut down
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;

    Ok(())
}

impl From<&ErrorType> for StatusCode {
    fn from(value: &ErrorType) -> Self {
        match value {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl From<InferError> for ErrorResponse {
    fn from(err: InferError) -> Self {
        let error_type = match err {
            InferError::Overloaded(_) => ErrorType::Overloaded,
            InferError::Backend(_) | InferError::Shape(_) => ErrorType::Internal,
        };
        ErrorResponse {
            error: err.to_string(),
            error_type,
        }
    }
}

/// Convert to Axum supported formats
impl From<ErrorResponse> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: ErrorResponse) -> Self {
        (StatusCode::from(&err.error_type), Json(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_adapter_backend::{
        Backend, BackendError, BackendKind, Embedder, RawOutput, Reranker,
    };
    use inference_adapter_core::ShapeError;
    use metrics_exporter_prometheus::PrometheusBuilder;

    struct Unreachable;

    impl Embedder for Unreachable {
        fn embed(&self, _texts: Vec<String>) -> Result<RawOutput, BackendError> {
            Err(BackendError::Inference("embedder called".to_string()))
        }
    }

    impl Reranker for Unreachable {
        fn score(&self, _pairs: Vec<(String, String)>) -> Result<RawOutput, BackendError> {
            Err(BackendError::Inference("reranker called".to_string()))
        }
    }

    fn info() -> Info {
        Info {
            backend: "custom".to_string(),
            embed_url: None,
            rerank_url: None,
            max_concurrent_requests: 1,
            max_client_batch_size: None,
            version: "0.1.0",
            sha: None,
        }
    }

    #[test]
    fn infer_errors_map_to_status_codes() {
        let err = ErrorResponse::from(InferError::Shape(ShapeError::CountMismatch));
        assert_eq!(StatusCode::from(&err.error_type), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error, "Embedding count does not match input texts.");

        let err = ErrorResponse::from(InferError::Backend(BackendError::Inference(
            "CUDA out of memory".to_string(),
        )));
        assert_eq!(StatusCode::from(&err.error_type), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error, "CUDA out of memory");
    }

    #[test]
    fn error_body_only_carries_the_message() {
        let err = ErrorResponse::bad_request("Body must include key \"text\".");
        let (status, Json(body)) = <(StatusCode, Json<ErrorResponse>)>::from(err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            serde_json::json!({"error": "Body must include key \"text\"."})
        );
    }

    #[test]
    fn batch_size_limit() {
        let mut info = info();
        let input = Input::Batch(vec!["a".to_string(); 3]);
        assert!(check_batch_size(&input, &info).is_ok());

        info.max_client_batch_size = Some(2);
        let err = check_batch_size(&input, &info).unwrap_err();
        assert_eq!(err.error, "batch size 3 > maximum allowed batch size 2");
        assert_eq!(err.error_type, ErrorType::BadRequest);
    }

    #[test]
    fn empty_requests_are_counted_as_successes() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let backend = Backend::new(
                    Box::new(Unreachable),
                    Box::new(Unreachable),
                    BackendKind::Custom,
                );
                let infer = Infer::new(backend, 1);

                let body = Bytes::from_static(br#"{"query": null, "documents": []}"#);
                let (_, Json(response)) =
                    rerank(Extension(infer.clone()), Extension(info()), Ok(body))
                        .await
                        .unwrap();
                assert!(response.scores.is_empty());

                let body = Bytes::from_static(br#"{"text": []}"#);
                let (_, Json(response)) = vectors(Extension(infer), Extension(info()), Ok(body))
                    .await
                    .unwrap();
                assert!(response.vectors.is_empty());
            });
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"adapter_request_success{method="rerank"} 1"#));
        assert!(rendered.contains(r#"adapter_request_success{method="vectors"} 1"#));
        assert!(rendered.contains(r#"adapter_request_count{method="rerank"} 1"#));
    }

    #[test]
    fn oversized_body_maps_to_payload_too_large() {
        let err = ErrorResponse {
            error: "Failed to buffer the request body: length limit exceeded".to_string(),
            error_type: ErrorType::PayloadTooLarge,
        };
        let (status, _) = <(StatusCode, Json<ErrorResponse>)>::from(err);
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
