//! Conformance driver binary
//!
//! Runs the selected checks (all by default) against `--target` and exits
//! non-zero on the first failure.

use clap::Parser;
use conformance_core::init_tracing;
use conformance_driver::{CheckSuite, Config, ConformanceClient, DriverError};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    if config.list {
        for check in config.selected_checks() {
            println!("{check}");
        }
        return Ok(());
    }

    init_tracing(&config.log_level, config.log_format)?;

    let checks = config.selected_checks();
    info!(target = %config.target, checks = checks.len(), "Starting conformance run");

    let client = ConformanceClient::connect(&config.target, config.connect_timeout())
        .await
        .map_err(DriverError::Connect)?
        .with_tag_prefix(config.echo_tag_prefix.clone())
        .with_call_timeout(config.call_timeout());

    let suite = CheckSuite::new(client, config.data.as_bytes(), config.count);
    if let Err(failure) = suite.run_checks(&checks).await {
        error!(check = failure.name, error = %failure.source, "Check failed");
        return Err(DriverError::from(failure).into());
    }

    info!(checks = checks.len(), "All checks passed");
    Ok(())
}
