//! Process entry point: load configuration, connect to storage, serve the
//! HTTP/WebSocket transport.
//!
//! Wiring order follows the teacher's own binaries: config → tracing init →
//! store → long-lived engine → router → listener.

use std::sync::Arc;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use oversight_gateway::config::GatewayConfig;
use oversight_gateway::http::{self, AppState};
use oversight_gateway::{Engine, Policy};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::load(std::env::var("GATEWAY_CONFIG_FILE").ok().as_deref())?;
    init_tracing(&config);

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store: oversight_gateway::SharedStateStore = Arc::new(oversight_gateway::PgStateStore::new(pool));

    let policy_source = std::fs::read_to_string(&config.policy_path)?;
    let policy = Policy::from_yaml(&policy_source)?;

    let engine = Arc::new(Engine::new(policy, store));
    let state = Arc::new(AppState {
        engine,
        api_keys: config.api_keys.clone(),
        policy_path: config.policy_path.clone(),
    });

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "oversight gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Configures the `tracing` subscriber and, when `otlp_endpoint` is set,
/// an OTLP span exporter. The Rust analogue of the original's
/// `tracing.py::setup_tracing`, minus the FastAPI/HTTPX auto-instrumentation
/// (there is no equivalent to instrument here; `#[instrument]` is applied
/// by hand at each call site).
fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_new(&config.observability.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = if config.observability.json_logs {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let otel_layer = config.observability.otlp_endpoint.as_ref().and_then(|endpoint| {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .ok()?;

        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                config.observability.service_name.clone(),
            )]))
            .build();
        let tracer = provider.tracer(config.observability.service_name.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    });

    tracing_subscriber::registry().with(filter).with(fmt_layer).with(otel_layer).init();
}
