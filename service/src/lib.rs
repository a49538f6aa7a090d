//! conformance-service - Behavior-simulating gRPC service
//!
//! Implements `conformance.v1.TestService` so that every edge condition a
//! conformance driver needs can be reproduced on demand. Clients steer each
//! call through directives in its request metadata:
//!
//! ```text
//! metadata ──► Directives ──► wait-for-cancel ──► sleep ──► injected error ──► transform
//!                  │
//!                  └──► echo tag (response header + trailer)
//! ```
//!
//! The service keeps no state between calls.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod echo_tag;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod server;
pub mod service;

pub use config::Config;
pub use echo_tag::EchoTagService;
pub use error::{Result, ServiceError};
pub use metrics::Metrics;
pub use metrics_server::MetricsServer;
pub use server::{shutdown_signal, ConformanceServer, RunningServer};
pub use service::ConformanceService;
