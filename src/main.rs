//! # Edge Gateway - Main Entry Point
//!
//! Loads configuration (`GATEWAY_CONFIG_PATH`, default `config/gateway.yaml`,
//! with `GATEWAY_*` environment overrides), installs structured logging and
//! serves until Ctrl-C or SIGTERM.

use tracing::{error, info};

use edge_gateway::observability::{init_tracing, LogConfig};
use edge_gateway::{GatewayConfig, GatewayResult, GatewayServer};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config = match GatewayConfig::load().await {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LogConfig::default());
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    init_tracing(&config.logging);
    info!("Starting edge gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server = GatewayServer::from_config(&config).map_err(|e| {
        error!("Failed to start gateway: {}", e);
        e
    })?;
    info!(
        routes = config.routing.rules.len(),
        services = config.discovery.services.len(),
        "Gateway ready on {}",
        server.bind_addr()
    );

    server.run().await?;

    info!("Gateway shutdown complete");
    Ok(())
}
