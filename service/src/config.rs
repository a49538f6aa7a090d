//! Service configuration loaded from environment variables

use crate::error::{Result, ServiceError};
use conformance_core::LogFormat;
use std::net::SocketAddr;

/// Service configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// gRPC listen address (`CONFORMANCE_GRPC_ADDR`)
    pub grpc_addr: SocketAddr,
    /// Metrics HTTP listen address (`CONFORMANCE_METRICS_ADDR`)
    pub metrics_addr: SocketAddr,
    /// Serve `/metrics` and `/health` (`CONFORMANCE_METRICS_ENABLED`)
    pub metrics_enabled: bool,
    /// Default log filter (`CONFORMANCE_LOG_LEVEL`), overridden by `RUST_LOG`
    pub log_level: String,
    /// Log output format (`CONFORMANCE_LOG_FORMAT`)
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            metrics_enabled: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            grpc_addr: parse_var(&lookup, "CONFORMANCE_GRPC_ADDR")?.unwrap_or(defaults.grpc_addr),
            metrics_addr: parse_var(&lookup, "CONFORMANCE_METRICS_ADDR")?
                .unwrap_or(defaults.metrics_addr),
            metrics_enabled: parse_var(&lookup, "CONFORMANCE_METRICS_ENABLED")?
                .unwrap_or(defaults.metrics_enabled),
            log_level: lookup("CONFORMANCE_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_var(&lookup, "CONFORMANCE_LOG_FORMAT")?
                .unwrap_or(defaults.log_format),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ServiceError::Config(format!("{key}: {e}")))
        })
        .transpose()
}
