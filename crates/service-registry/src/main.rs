//! Service registry binary

use service_registry::{Config, RegistryServer, setup_tracing_with_otel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (needed for telemetry settings)
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Can't use tracing yet - not initialized
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    // Telemetry guard flushes spans on drop
    let _telemetry_guard = setup_tracing_with_otel(&config.telemetry, &config.logging).await?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Service registry starting");

    let server = RegistryServer::new(config.to_server_config());
    server.run().await?;

    Ok(())
}
