//! Call directives carried in request metadata
//!
//! A [`Directives`] value is parsed once when a call arrives and is never
//! mutated afterwards. Each step of the service pipeline queries it instead
//! of going back to the raw metadata. The driver builds the same value and
//! writes it onto an outbound request with [`Directives::apply`].

use crate::error::DirectiveError;
use crate::metadata_keys;
use bytes::Bytes;
use std::time::Duration;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

/// Terminal status requested by the `x-inject-error` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedError {
    pub code: Code,
    pub message: String,
}

impl InjectedError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Parse the `"<code>:<message>"` wire form.
    ///
    /// Only the first `:` separates code from message. A code that is not an
    /// integer becomes `Unknown`; an out-of-range integer does too. Code `0`
    /// is not an error at all, so it yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let (code, message) = value.split_once(':').unwrap_or((value, ""));
        let code = code
            .trim()
            .parse::<i32>()
            .map(Code::from_i32)
            .unwrap_or(Code::Unknown);

        if code == Code::Ok {
            return None;
        }

        Some(Self::new(code, message))
    }

    /// The `"<code>:<message>"` wire form.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.code as i32, self.message)
    }

    /// Build the status to terminate the call with.
    ///
    /// Non-empty `details` travel as raw `grpc-status-details-bin` bytes.
    pub fn to_status(&self, details: Option<&[u8]>) -> Status {
        match details {
            Some(details) if !details.is_empty() => Status::with_details(
                self.code,
                self.message.clone(),
                Bytes::copy_from_slice(details),
            ),
            _ => Status::new(self.code, self.message.clone()),
        }
    }
}

/// The full directive set of one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    /// Correlation tag echoed as header and trailer
    pub echo_tag: Option<String>,
    /// Delay before the nominal response
    pub sleep: Option<Duration>,
    /// Block until cancellation or deadline
    pub wait_for_cancel: bool,
    /// Status to fail with instead of the nominal response
    pub inject_error: Option<InjectedError>,
    /// Raw details for the injected status
    pub error_details: Option<Vec<u8>>,
    /// Delay after each streamed message
    pub message_delay: Option<Duration>,
    /// Abort after this many streamed messages
    pub error_after: Option<usize>,
}

impl Directives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_echo_tag(mut self, tag: impl Into<String>) -> Self {
        self.echo_tag = Some(tag.into());
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = Some(sleep);
        self
    }

    pub fn with_wait_for_cancel(mut self) -> Self {
        self.wait_for_cancel = true;
        self
    }

    pub fn with_injected_error(mut self, code: Code, message: impl Into<String>) -> Self {
        self.inject_error = Some(InjectedError::new(code, message));
        self
    }

    pub fn with_error_details(mut self, details: impl Into<Vec<u8>>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    pub fn with_message_delay(mut self, delay: Duration) -> Self {
        self.message_delay = Some(delay);
        self
    }

    pub fn with_error_after(mut self, count: usize) -> Self {
        self.error_after = Some(count);
        self
    }

    /// Parse directives from inbound request metadata.
    pub fn from_metadata(metadata: &MetadataMap) -> Result<Self, DirectiveError> {
        let echo_tag = ascii(metadata, metadata_keys::ECHO_TAG)?.map(str::to_string);
        let inject_error =
            ascii(metadata, metadata_keys::INJECT_ERROR)?.and_then(InjectedError::parse);
        let error_details = metadata
            .get(metadata_keys::ERROR_DETAILS)
            .map(|value| value.as_encoded_bytes().to_vec());

        Ok(Self {
            echo_tag,
            sleep: millis(metadata, metadata_keys::SLEEP_MS)?,
            wait_for_cancel: metadata.contains_key(metadata_keys::WAIT_CANCEL),
            inject_error,
            error_details,
            message_delay: millis(metadata, metadata_keys::DELAY_MS)?,
            error_after: integer(metadata, metadata_keys::ERROR_AFTER_COUNT)?
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
        })
    }

    /// Write these directives onto outbound request metadata.
    pub fn apply(&self, metadata: &mut MetadataMap) -> Result<(), DirectiveError> {
        if let Some(tag) = &self.echo_tag {
            metadata.insert(metadata_keys::ECHO_TAG, encode(metadata_keys::ECHO_TAG, tag)?);
        }
        if let Some(sleep) = self.sleep {
            let value = sleep.as_millis().to_string();
            metadata.insert(metadata_keys::SLEEP_MS, encode(metadata_keys::SLEEP_MS, &value)?);
        }
        if self.wait_for_cancel {
            metadata.insert(metadata_keys::WAIT_CANCEL, MetadataValue::from_static("1"));
        }
        if let Some(error) = &self.inject_error {
            let value = error.encode();
            metadata.insert(
                metadata_keys::INJECT_ERROR,
                encode(metadata_keys::INJECT_ERROR, &value)?,
            );
        }
        if let Some(details) = &self.error_details {
            let value = String::from_utf8(details.clone()).map_err(|_| {
                DirectiveError::NonAscii {
                    key: metadata_keys::ERROR_DETAILS,
                }
            })?;
            metadata.insert(
                metadata_keys::ERROR_DETAILS,
                encode(metadata_keys::ERROR_DETAILS, &value)?,
            );
        }
        if let Some(delay) = self.message_delay {
            let value = delay.as_millis().to_string();
            metadata.insert(metadata_keys::DELAY_MS, encode(metadata_keys::DELAY_MS, &value)?);
        }
        if let Some(count) = self.error_after {
            let value = count.to_string();
            metadata.insert(
                metadata_keys::ERROR_AFTER_COUNT,
                encode(metadata_keys::ERROR_AFTER_COUNT, &value)?,
            );
        }
        Ok(())
    }

    /// True once `count` streamed messages reach the error-after threshold.
    pub fn error_after_reached(&self, count: usize) -> bool {
        self.error_after.is_some_and(|limit| count >= limit)
    }

    /// `Err(Aborted)` once `count` messages reach the error-after threshold.
    pub fn check_error_after(&self, count: usize) -> Result<(), Status> {
        if self.error_after_reached(count) {
            Err(aborted_after(count))
        } else {
            Ok(())
        }
    }

    /// The status requested by `x-inject-error`, if any.
    pub fn injected_status(&self) -> Option<Status> {
        self.inject_error
            .as_ref()
            .map(|error| error.to_status(self.error_details.as_deref()))
    }

    /// Names of the directives present, for logs and metrics.
    pub fn active(&self) -> Vec<&'static str> {
        let mut active = Vec::new();
        if self.echo_tag.is_some() {
            active.push(metadata_keys::ECHO_TAG);
        }
        if self.wait_for_cancel {
            active.push(metadata_keys::WAIT_CANCEL);
        }
        if self.sleep.is_some() {
            active.push(metadata_keys::SLEEP_MS);
        }
        if self.inject_error.is_some() {
            active.push(metadata_keys::INJECT_ERROR);
        }
        if self.error_details.is_some() {
            active.push(metadata_keys::ERROR_DETAILS);
        }
        if self.message_delay.is_some() {
            active.push(metadata_keys::DELAY_MS);
        }
        if self.error_after.is_some() {
            active.push(metadata_keys::ERROR_AFTER_COUNT);
        }
        active
    }
}

/// Status used when the error-after threshold trips.
pub fn aborted_after(count: usize) -> Status {
    Status::aborted(format!("error after {count} messages"))
}

fn ascii<'a>(
    metadata: &'a MetadataMap,
    key: &'static str,
) -> Result<Option<&'a str>, DirectiveError> {
    metadata
        .get(key)
        .map(|value| value.to_str().map_err(|_| DirectiveError::NonAscii { key }))
        .transpose()
}

fn integer(metadata: &MetadataMap, key: &'static str) -> Result<Option<u64>, DirectiveError> {
    ascii(metadata, key)?
        .map(|value| {
            value.trim().parse::<u64>().map_err(|_| DirectiveError::InvalidInteger {
                key,
                value: value.to_string(),
            })
        })
        .transpose()
}

fn millis(metadata: &MetadataMap, key: &'static str) -> Result<Option<Duration>, DirectiveError> {
    Ok(integer(metadata, key)?
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis))
}

fn encode(
    key: &'static str,
    value: &str,
) -> Result<MetadataValue<tonic::metadata::Ascii>, DirectiveError> {
    MetadataValue::try_from(value).map_err(|_| DirectiveError::Unencodable {
        key,
        value: value.to_string(),
    })
}
