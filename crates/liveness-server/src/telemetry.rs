//! Tracing subscriber setup with optional OpenTelemetry export.

use crate::server::BoxError;
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tracing output options
#[derive(Debug, Clone)]
pub struct TracingOptions {
    pub service_name: String,
    pub otlp_endpoint: String,
    pub otel_enabled: bool,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    pub json: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            service_name: "liveness-server".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard {
    provider: TracerProvider,
}

impl TelemetryGuard {
    /// SDK tracer for the tracing bridge layer
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        self.provider.tracer(name)
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Failed to flush traces: {}", e);
        }
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Install the OTLP (gRPC) exporter as the global tracer provider
pub fn init_telemetry(
    service_name: &str,
    otlp_endpoint: &str,
) -> Result<TelemetryGuard, BoxError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
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

    Ok(TelemetryGuard { provider })
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `options.log_level`. The returned guard must live
/// until shutdown when OpenTelemetry export is enabled.
pub fn setup_tracing(options: &TracingOptions) -> Result<Option<TelemetryGuard>, BoxError> {
    let guard = if options.otel_enabled {
        Some(init_telemetry(&options.service_name, &options.otlp_endpoint)?)
    } else {
        None
    };

    let otel_layer = guard
        .as_ref()
        .map(|guard| tracing_opentelemetry::layer().with_tracer(guard.tracer("liveness-server")));
    let json_layer = options.json.then(|| fmt::layer().json());
    let text_layer = (!options.json).then(|| fmt::layer());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.log_level)))
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        otel = options.otel_enabled,
        json = options.json,
        "Tracing initialized"
    );

    Ok(guard)
}
