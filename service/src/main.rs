//! Conformance service binary
//!
//! Configuration comes from `CONFORMANCE_*` environment variables; see
//! [`conformance_service::Config`].

use conformance_core::init_tracing;
use conformance_service::{shutdown_signal, Config, ConformanceServer, Metrics, MetricsServer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format)?;

    info!(
        grpc_addr = %config.grpc_addr,
        metrics_addr = %config.metrics_addr,
        metrics_enabled = config.metrics_enabled,
        "Starting conformance service"
    );

    let metrics_handle = if config.metrics_enabled {
        Metrics::init()?;
        Some(MetricsServer::start(config.metrics_addr))
    } else {
        None
    };

    let server = ConformanceServer::bind(config.grpc_addr).await?;
    server.serve_until(shutdown_signal()).await?;

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    info!("Conformance service shutdown complete");

    Ok(())
}
