//! Registry server: owns the store and serves the admin API.

use crate::http_server::ApiServer;
use crate::metrics::MetricsRegistry;
use crate::store::Registry;
use crate::types::ServerConfig;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Service registry server
pub struct RegistryServer {
    config: ServerConfig,
    registry: Arc<Registry>,
}

impl RegistryServer {
    /// Create the server and its registry
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let metrics = if config.metrics_enabled {
            info!("Metrics enabled on {}/metrics", config.listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let registry = Registry::new(config.registry.clone(), metrics);
        Self { config, registry }
    }

    /// The registry served by this server
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Run until `shutdown` resolves, then stop all registry timers
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        info!(
            listen_addr = %self.config.listen_addr,
            heartbeat_mode = ?self.config.registry.heartbeat_mode,
            default_ttl = ?self.config.registry.default_ttl,
            "Starting service registry"
        );

        let api = ApiServer::new(self.registry.clone(), self.config.listen_addr.clone());
        let result = api.run(shutdown).await;

        self.registry.shutdown();
        info!("Service registry stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_follow_config() {
        let server = RegistryServer::new(ServerConfig::default());
        assert!(server.registry().metrics().is_some());

        let server = RegistryServer::new(ServerConfig {
            metrics_enabled: false,
            ..Default::default()
        });
        assert!(server.registry().metrics().is_none());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let server = RegistryServer::new(ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        });
        let registry = server.registry().clone();

        let result = server.run_until(async {}).await;
        assert!(result.is_ok());
        assert!(registry.is_empty());
    }
}
