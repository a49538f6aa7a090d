//! conformance-driver - Checks a TestService against gRPC call-shape invariants
//!
//! The driver connects to a running service and issues one call per check,
//! steering the service through request directives and asserting what comes
//! back: payloads, ordering, status codes and messages, and the echo tag in
//! headers and trailers.
//!
//! ```text
//! Config ──► ConformanceClient ──► CheckSuite ──► Check::ALL (fail fast)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod checks;
pub mod client;
pub mod config;
pub mod error;

pub use checks::{Check, CheckSuite};
pub use client::ConformanceClient;
pub use config::Config;
pub use error::{CheckError, CheckFailure, DriverError};
