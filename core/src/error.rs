//! Error types for directive handling

use thiserror::Error;

/// Error raised while reading or writing call directives
///
/// On the service side this becomes an `InvalidArgument` status so a
/// malformed directive fails the call instead of being silently ignored.
///
/// # Example
///
/// ```
/// use conformance_core::DirectiveError;
///
/// let err = DirectiveError::InvalidInteger {
///     key: "x-sleep-ms",
///     value: "soon".to_string(),
/// };
/// let status: tonic::Status = err.into();
/// assert_eq!(status.code(), tonic::Code::InvalidArgument);
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectiveError {
    /// A numeric directive did not hold a non-negative integer
    #[error("invalid {key}: {value:?} is not a non-negative integer")]
    InvalidInteger { key: &'static str, value: String },

    /// A directive value was not printable ASCII
    #[error("invalid {key}: value is not printable ASCII")]
    NonAscii { key: &'static str },

    /// A directive value could not be written as metadata
    #[error("cannot encode {key} as metadata: {value:?}")]
    Unencodable { key: &'static str, value: String },
}

impl From<DirectiveError> for tonic::Status {
    fn from(err: DirectiveError) -> Self {
        tonic::Status::invalid_argument(err.to_string())
    }
}
