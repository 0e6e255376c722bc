//! Liveness daemon wiring and lifecycle.

use crate::broadcaster::Broadcaster;
use crate::http_server::{AppState, HttpServer};
use crate::metrics::MetricsRegistry;
use crate::monitor::MonitorContext;
use crate::registry::MonitorRegistry;
use crate::store::{MemoryStore, RecordStore};
use crate::types::ServerConfig;
use liveness::{ProbeExecutor, build_prober};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error type of the daemon entry points
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Liveness server
pub struct LivenessServer {
    config: ServerConfig,
    store: Arc<dyn RecordStore>,
}

impl LivenessServer {
    /// Create a server backed by an in-memory store seeded from `config.machines`
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(MemoryStore::with_machines(config.machines.clone()));
        Self::with_store(config, store)
    }

    /// Create a server backed by `store`
    pub fn with_store(config: ServerConfig, store: Arc<dyn RecordStore>) -> Self {
        Self { config, store }
    }

    /// Build the monitoring engine without starting anything
    pub fn build_engine(
        &self,
    ) -> Result<(Arc<MonitorRegistry>, Arc<Broadcaster>, Option<Arc<MetricsRegistry>>), BoxError> {
        let metrics = if self.config.metrics_enabled {
            info!("Metrics enabled");
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let prober = build_prober(&self.config.probe_kind, self.config.probe_timeout)?;
        info!(
            prober = prober.name(),
            max_parallel = self.config.max_parallel_probes,
            timeout_ms = self.config.probe_timeout.as_millis() as u64,
            "Probe executor ready"
        );
        let executor = Arc::new(ProbeExecutor::new(
            prober,
            self.config.max_parallel_probes,
            self.config.probe_timeout,
        ));

        let broadcaster = Arc::new(Broadcaster::new(metrics.clone()));
        let registry = Arc::new(MonitorRegistry::new(MonitorContext {
            settings: self.config.monitor.clone(),
            executor,
            store: self.store.clone(),
            broadcaster: broadcaster.clone(),
            metrics: metrics.clone(),
        }));

        Ok((registry, broadcaster, metrics))
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), BoxError> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            signal_token.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run until `shutdown` fires
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), BoxError> {
        info!("Starting liveness server");

        let (registry, broadcaster, metrics) = self.build_engine()?;
        registry.start_all(self.store.as_ref()).await?;

        let http_stop = CancellationToken::new();
        let http_handle = if self.config.http_enabled {
            let server = HttpServer::new(
                AppState {
                    registry: registry.clone(),
                    broadcaster,
                    metrics,
                    observer_buffer: self.config.observer_buffer,
                },
                self.config.listen_addr.clone(),
            );
            let stop = http_stop.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(stop).await {
                    warn!(error = %e, "HTTP server error");
                }
            }))
        } else {
            info!("HTTP server disabled");
            None
        };

        info!(monitors = registry.len(), "Liveness server running");
        shutdown.cancelled().await;

        info!("Shutting down");
        registry.shutdown().await;

        http_stop.cancel();
        if let Some(handle) = http_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "HTTP server task failed");
            }
        }

        info!("Liveness server stopped");
        Ok(())
    }
}

/// Resolve on SIGINT or, on unix, SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Machine;
    use liveness::ProbeKind;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig {
            probe_kind: ProbeKind::Tcp { port: 1 },
            probe_timeout: Duration::from_millis(100),
            http_enabled: false,
            machines: vec![
                Machine {
                    id: 1,
                    address: "127.0.0.1".to_string(),
                    hostname: None,
                },
                Machine {
                    id: 2,
                    address: "127.0.0.2".to_string(),
                    hostname: None,
                },
            ],
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_engine() {
        let server = LivenessServer::new(config());
        let (registry, broadcaster, metrics) = server.build_engine().unwrap();
        assert!(registry.is_empty());
        assert_eq!(broadcaster.observer_count(), 0);
        assert!(metrics.is_some());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = LivenessServer::new(config());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run_until(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
