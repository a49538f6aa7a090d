//! Driver configuration: command-line flags with environment fallbacks

use crate::checks::Check;
use clap::Parser;
use conformance_core::LogFormat;
use std::time::Duration;

/// Conformance driver configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "conformance-driver")]
#[command(about = "Run gRPC conformance checks against a TestService")]
#[command(version)]
pub struct Config {
    /// Target service URI
    #[arg(long, env = "CONFORMANCE_TARGET", default_value = "http://127.0.0.1:50051")]
    pub target: String,

    /// Base payload for every check
    #[arg(long, env = "CONFORMANCE_DATA", default_value = "hello")]
    pub data: String,

    /// Messages per streaming check
    #[arg(long, env = "CONFORMANCE_COUNT", default_value_t = 5)]
    pub count: usize,

    /// Prefix of the generated echo tags
    #[arg(long, env = "CONFORMANCE_ECHO_TAG_PREFIX", default_value = "rust")]
    pub echo_tag_prefix: String,

    /// Connect timeout in milliseconds
    #[arg(long, env = "CONFORMANCE_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Per-call time budget in milliseconds
    #[arg(long, env = "CONFORMANCE_CALL_TIMEOUT_MS", default_value_t = 10_000)]
    pub call_timeout_ms: u64,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, env = "CONFORMANCE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (json or pretty)
    #[arg(long, env = "CONFORMANCE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Print the check names in run order and exit
    #[arg(long)]
    pub list: bool,

    /// Checks to run, in order (default: all)
    pub checks: Vec<Check>,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Checks to run: the selected ones, or every check in run order.
    pub fn selected_checks(&self) -> Vec<Check> {
        if self.checks.is_empty() {
            Check::ALL.to_vec()
        } else {
            self.checks.clone()
        }
    }
}
