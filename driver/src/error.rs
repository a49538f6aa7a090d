//! Error types for the conformance driver

use conformance_core::DirectiveError;
use thiserror::Error;
use tonic::{Code, Status};

/// Why a single check failed
#[derive(Error, Debug)]
pub enum CheckError {
    /// A call failed where success was expected
    #[error("{call} failed: {:?}: {}", .status.code(), .status.message())]
    Rpc {
        call: &'static str,
        #[source]
        status: Status,
    },

    /// An observed value differs from the expected one
    #[error("unexpected {what}: got {got:?}, want {want:?}")]
    Mismatch {
        what: String,
        got: String,
        want: String,
    },

    /// Expected metadata was absent
    #[error("missing {0}")]
    MissingMetadata(&'static str),

    /// A call failed with the wrong status code
    #[error("expected {want:?}, got {got:?}: {message}")]
    UnexpectedCode {
        want: Code,
        got: Code,
        message: String,
    },

    /// A call succeeded where a failure was expected
    #[error("expected {0:?} error, got success")]
    UnexpectedSuccess(Code),

    /// A stream ended before the expected number of messages
    #[error("{call} stream ended after {received} messages")]
    UnexpectedEnd { call: &'static str, received: usize },

    /// Directives could not be written onto the request
    #[error("directive error: {0}")]
    Directive(#[from] DirectiveError),

    /// The task driving a call panicked or was aborted
    #[error("call task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CheckError {
    /// Wrap a failed call's status. Shaped for `map_err`.
    pub fn rpc(call: &'static str) -> impl FnOnce(Status) -> CheckError {
        move |status| CheckError::Rpc { call, status }
    }

    pub fn mismatch(
        what: impl Into<String>,
        got: impl Into<String>,
        want: impl Into<String>,
    ) -> Self {
        CheckError::Mismatch {
            what: what.into(),
            got: got.into(),
            want: want.into(),
        }
    }
}

/// A named check that failed
#[derive(Error, Debug)]
#[error("{name}: {source}")]
pub struct CheckFailure {
    pub name: &'static str,
    #[source]
    pub source: CheckError,
}

/// Top-level driver error
#[derive(Error, Debug)]
pub enum DriverError {
    /// Could not reach the target service
    #[error("connect error: {0}")]
    Connect(#[from] tonic::transport::Error),

    /// A conformance check failed
    #[error(transparent)]
    Check(#[from] CheckFailure),
}
