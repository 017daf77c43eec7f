use anyhow::{Context, Result};
use clap::Parser;
use inference_adapter_backend::Url;
use inference_adapter_router::RouterConfig;
use opentelemetry::global;
use std::time::Duration;
use veil::Redact;

/// App Configuration
#[derive(Parser, Redact)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// The upstream endpoint embedding a batch of texts.
    /// It receives `{"inputs": [string, ...]}` and answers with one vector per input.
    #[clap(default_value = "http://127.0.0.1:8080/embed", long, env)]
    embed_url: String,

    /// The upstream endpoint scoring a batch of (query, document) pairs.
    /// It receives `{"inputs": [[query, document], ...]}` and answers with one score per pair.
    ///
    /// Defaults to `/predict` on the host of `--embed-url`.
    #[clap(long, env)]
    rerank_url: Option<String>,

    /// Optional upstream health route. Without it, health is checked with a real embedding call.
    #[clap(long, env)]
    health_url: Option<String>,

    /// Timeout of a single upstream call in milliseconds
    #[clap(default_value = "30000", long, env)]
    backend_timeout_ms: u64,

    /// The maximum amount of concurrent requests for this particular deployment.
    /// Having a low limit will refuse clients requests instead of having them
    /// wait for too long and is usually good to handle backpressure correctly.
    #[clap(default_value = "512", long, env)]
    max_concurrent_requests: usize,

    /// Optionally control the maximum number of inputs that a client can send in a single request
    #[clap(long, env)]
    max_client_batch_size: Option<usize>,

    /// The IP address to listen on
    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,

    /// The port to listen on.
    #[clap(default_value = "5009", long, short, env)]
    port: u16,

    /// Payload size limit in bytes
    ///
    /// Default is 2MB
    #[clap(default_value = "2000000", long, env)]
    payload_limit: usize,

    /// Set an api key for request authorization.
    ///
    /// By default the server responds to every request. With an api key set, the requests must have the Authorization header set with the api key as Bearer token.
    #[clap(long, env)]
    #[redact(partial)]
    api_key: Option<String>,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The grpc endpoint for opentelemetry. Telemetry is sent to this endpoint as OTLP over gRPC.
    /// e.g. `http://localhost:4317`
    #[clap(long, env)]
    otlp_endpoint: Option<String>,

    /// The service name for opentelemetry.
    /// e.g. `inference-adapter.server`
    #[clap(default_value = "inference-adapter.server", long, env)]
    otlp_service_name: String,

    /// The Prometheus port to listen on.
    #[clap(default_value = "9000", long, env)]
    prometheus_port: u16,

    #[clap(long, env)]
    cors_allow_origin: Option<Vec<String>>,
}

impl Args {
    /// `--rerank-url`, or `/predict` on the embed host
    pub fn rerank_url(&self) -> Result<String> {
        match &self.rerank_url {
            Some(rerank_url) => Ok(rerank_url.clone()),
            None => {
                let embed_url = Url::parse(&self.embed_url)
                    .with_context(|| format!("`{}` is not a valid URL", self.embed_url))?;
                Ok(embed_url.join("/predict")?.to_string())
            }
        }
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging and telemetry
    let global_tracer = inference_adapter_router::init_logging(
        args.otlp_endpoint.as_ref(),
        args.otlp_service_name.clone(),
        args.json_output,
        args.disable_spans,
    );

    tracing::info!("{args:?}");

    let rerank_url = args.rerank_url()?;

    let config = RouterConfig {
        max_concurrent_requests: args.max_concurrent_requests,
        max_client_batch_size: args.max_client_batch_size,
        hostname: Some(args.hostname),
        port: args.port,
        payload_limit: args.payload_limit,
        api_key: args.api_key,
        prometheus_port: args.prometheus_port,
        cors_allow_origin: args.cors_allow_origin,
    };

    inference_adapter_router::run(
        args.embed_url,
        rerank_url,
        args.health_url,
        Duration::from_millis(args.backend_timeout_ms),
        config,
    )
    .await?;

    if global_tracer {
        // Shutdown tracer
        global::shutdown_tracer_provider();
    }
    Ok(())
}
