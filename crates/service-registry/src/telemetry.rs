//! OpenTelemetry integration for distributed tracing
//!
//! Spans emitted through `tracing` are exported over OTLP/gRPC when
//! telemetry is enabled; logging always goes to stdout.

use crate::config::{LoggingSettings, TelemetrySettings};
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_subscriber::{Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard {
    _provider: TracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Build the OTLP tracer provider and install it globally.
///
/// Returns `None` when telemetry is disabled. Must be called from within a
/// Tokio runtime.
pub async fn init_telemetry(settings: &TelemetrySettings) -> anyhow::Result<Option<TracerProvider>> {
    if !settings.enabled {
        return Ok(None);
    }

    // Create OTLP exporter
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(settings.otlp_endpoint.as_str())
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());

    Ok(Some(provider))
}

/// Setup tracing-subscriber with an optional OpenTelemetry layer
///
/// Keep the returned guard alive for the lifetime of the process.
pub async fn setup_tracing_with_otel(
    telemetry: &TelemetrySettings,
    logging: &LoggingSettings,
) -> anyhow::Result<Option<TelemetryGuard>> {
    let Some(provider) = init_telemetry(telemetry).await? else {
        common::logging::try_init(logging.level(), logging.json())?;
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    };

    let fmt_layer = if logging.json() {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("service-registry"));

    tracing_subscriber::registry()
        .with(common::logging::env_filter(logging.level()))
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        "Tracing initialized with OpenTelemetry integration"
    );
    Ok(Some(TelemetryGuard {
        _provider: provider,
    }))
}
