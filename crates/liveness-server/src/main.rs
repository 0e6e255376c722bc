//! Liveness server binary

use liveness_server::{BoxError, Config, LivenessServer, ServerConfig, TracingOptions, setup_tracing};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load configuration first (needed for logging settings)
    let yaml_config = match Config::load() {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            // Can't use tracing yet - not initialized
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            None
        }
    };

    let options = match yaml_config {
        Some(ref cfg) => TracingOptions {
            service_name: cfg.telemetry.service_name.clone(),
            otlp_endpoint: cfg.telemetry.otlp_endpoint.clone(),
            otel_enabled: cfg.telemetry.enabled,
            log_level: cfg.logging.level.clone().unwrap_or_else(|| "info".to_string()),
            json: cfg.logging.format.as_deref() == Some("json"),
        },
        None => TracingOptions::default(),
    };

    // Flushes pending spans on drop
    let _telemetry_guard = setup_tracing(&options)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Liveness server starting");

    let server_config = yaml_config
        .map(|cfg| {
            tracing::info!(machines = cfg.machines.len(), "Configuration loaded successfully");
            cfg.to_server_config()
        })
        .unwrap_or_else(|| {
            tracing::warn!("Using default configuration");
            ServerConfig::default()
        });

    LivenessServer::new(server_config).run().await?;

    Ok(())
}
