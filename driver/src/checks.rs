//! Conformance checks
//!
//! Each check issues one call shape against the service, with its own fresh
//! echo tag, and asserts the protocol-level invariants of the outcome.
//! [`CheckSuite::run_all`] runs every check in [`Check::ALL`] order and stops
//! at the first failure.

use crate::client::ConformanceClient;
use crate::error::{CheckError, CheckFailure};
use conformance_core::proto::{BiEchoRequest, CollectRequest, EchoRequest, ExpandRequest};
use conformance_core::{metadata_keys, CallContext, Directives, COLLECT_SEPARATOR, ECHO_PREFIX};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{debug, info};

/// Caller deadline of the deadline check
const DEADLINE_BUDGET: Duration = Duration::from_millis(50);
/// Server-side sleep of the deadline check
const DEADLINE_SLEEP: Duration = Duration::from_millis(200);
/// Safety deadline of the cancel check
const CANCEL_BUDGET: Duration = Duration::from_secs(5);
/// Delay before the cancel check cancels its call
const CANCEL_AFTER: Duration = Duration::from_millis(50);
/// Injected error of the error check
const INJECTED_CODE: Code = Code::FailedPrecondition;
const INJECTED_MESSAGE: &str = "server error test";
/// Threshold of the abort checks
const ABORT_AFTER: usize = 2;
const ERROR_DETAILS: &[u8] = b"conformance-error-details";

/// A named conformance check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Unary,
    ClientStream,
    ServerStream,
    Bidi,
    Deadline,
    Cancel,
    Error,
    ErrorDetails,
    ErrorTrailer,
    ClientStreamAbort,
    ServerStreamAbort,
}

impl Check {
    /// Every check, in run order
    pub const ALL: [Check; 11] = [
        Check::Unary,
        Check::ClientStream,
        Check::ServerStream,
        Check::Bidi,
        Check::Deadline,
        Check::Cancel,
        Check::Error,
        Check::ErrorDetails,
        Check::ErrorTrailer,
        Check::ClientStreamAbort,
        Check::ServerStreamAbort,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Check::Unary => "unary",
            Check::ClientStream => "client-stream",
            Check::ServerStream => "server-stream",
            Check::Bidi => "bidi",
            Check::Deadline => "deadline",
            Check::Cancel => "cancel",
            Check::Error => "error",
            Check::ErrorDetails => "error-details",
            Check::ErrorTrailer => "error-trailer",
            Check::ClientStreamAbort => "client-stream-abort",
            Check::ServerStreamAbort => "server-stream-abort",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Check {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Check::ALL
            .into_iter()
            .find(|check| check.name() == s)
            .ok_or_else(|| format!("unknown check {s:?}"))
    }
}

/// Runs checks against one service with a fixed payload and message count
#[derive(Debug, Clone)]
pub struct CheckSuite {
    client: ConformanceClient,
    data: Vec<u8>,
    count: usize,
}

impl CheckSuite {
    pub fn new(client: ConformanceClient, data: impl Into<Vec<u8>>, count: usize) -> Self {
        Self {
            client,
            data: data.into(),
            count,
        }
    }

    /// Run one check.
    pub async fn run(&self, check: Check) -> Result<(), CheckFailure> {
        info!(check = check.name(), "Running check");

        let client = &self.client;
        let data = self.data.as_slice();
        let result = match check {
            Check::Unary => unary(client, data).await,
            Check::ClientStream => client_stream(client, data, self.count).await,
            Check::ServerStream => server_stream(client, data, self.count).await,
            Check::Bidi => bidi(client, data, self.count).await,
            Check::Deadline => deadline(client, data).await,
            Check::Cancel => cancel(client, data).await,
            Check::Error => error(client, data).await,
            Check::ErrorDetails => error_details(client, data).await,
            Check::ErrorTrailer => error_trailer(client, data).await,
            Check::ClientStreamAbort => client_stream_abort(client, data).await,
            Check::ServerStreamAbort => server_stream_abort(client, data, self.count).await,
        };

        match result {
            Ok(()) => {
                info!(check = check.name(), "Check passed");
                Ok(())
            }
            Err(source) => Err(CheckFailure {
                name: check.name(),
                source,
            }),
        }
    }

    /// Run `checks` in order, stopping at the first failure.
    pub async fn run_checks(&self, checks: &[Check]) -> Result<(), CheckFailure> {
        for check in checks {
            self.run(*check).await?;
        }
        Ok(())
    }

    /// Run every check in [`Check::ALL`] order, stopping at the first failure.
    pub async fn run_all(&self) -> Result<(), CheckFailure> {
        self.run_checks(&Check::ALL).await
    }
}

// ============================================================================
// Assertions
// ============================================================================

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn expect_bytes(what: impl Into<String>, got: &[u8], want: &[u8]) -> Result<(), CheckError> {
    if got == want {
        Ok(())
    } else {
        Err(CheckError::mismatch(what, lossy(got), lossy(want)))
    }
}

fn expect_metadata(
    metadata: &MetadataMap,
    key: &'static str,
    want: &str,
) -> Result<(), CheckError> {
    let value = metadata.get(key).ok_or(CheckError::MissingMetadata(key))?;
    let got = value.to_str().unwrap_or_default();
    if got == want {
        Ok(())
    } else {
        Err(CheckError::mismatch(format!("metadata {key}"), got, want))
    }
}

/// The call must have failed with exactly `want`.
fn expect_code<T>(result: Result<T, Status>, want: Code) -> Result<Status, CheckError> {
    match result {
        Ok(_) => Err(CheckError::UnexpectedSuccess(want)),
        Err(status) if status.code() == want => Ok(status),
        Err(status) => Err(CheckError::UnexpectedCode {
            want,
            got: status.code(),
            message: status.message().to_string(),
        }),
    }
}

fn expect_message(status: &Status, want: &str) -> Result<(), CheckError> {
    if status.message() == want {
        Ok(())
    } else {
        Err(CheckError::mismatch("status message", status.message(), want))
    }
}

fn sequence_of(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

fn numbered(base: &[u8], index: usize) -> Vec<u8> {
    [base, format!("-{index}").as_bytes()].concat()
}

fn echo_request(data: &[u8]) -> EchoRequest {
    EchoRequest {
        data: data.to_vec(),
    }
}

// ============================================================================
// Core checks
// ============================================================================

/// Echo round trip with header and trailer echo.
pub async fn unary(client: &ConformanceClient, data: &[u8]) -> Result<(), CheckError> {
    let tag = client.echo_tag();
    let (ctx, _cancel) = client.call_context();
    let request = client.request(
        echo_request(data),
        &Directives::new().with_echo_tag(&tag),
        &ctx,
    )?;

    let response = ctx
        .run(client.stub().echo(request))
        .await
        .map_err(CheckError::rpc("Echo"))?;

    // Unary metadata holds both the header block and the trailers
    expect_metadata(response.metadata(), metadata_keys::ECHO_TAG, &tag)?;
    expect_metadata(response.metadata(), metadata_keys::ECHO_TAG_HEADER, &tag)?;

    let want = [ECHO_PREFIX, data].concat();
    expect_bytes("response", &response.into_inner().data, &want)?;

    debug!(tag = %tag, "Unary echo verified");
    Ok(())
}

/// Collect joins `count` numbered messages in order.
pub async fn client_stream(
    client: &ConformanceClient,
    data: &[u8],
    count: usize,
) -> Result<(), CheckError> {
    let tag = client.echo_tag();
    let (ctx, _cancel) = client.call_context();

    let messages: Vec<Vec<u8>> = (0..count).map(|i| numbered(data, i)).collect();
    let outbound = tokio_stream::iter(
        messages
            .clone()
            .into_iter()
            .map(|data| CollectRequest { data }),
    );
    let request = client.request(outbound, &Directives::new().with_echo_tag(&tag), &ctx)?;

    let response = ctx
        .run(client.stub().collect(request))
        .await
        .map_err(CheckError::rpc("Collect"))?;
    expect_metadata(response.metadata(), metadata_keys::ECHO_TAG, &tag)?;

    let response = response.into_inner();
    if response.count != sequence_of(count) {
        return Err(CheckError::mismatch(
            "count",
            response.count.to_string(),
            count.to_string(),
        ));
    }
    expect_bytes("data", &response.data, &messages.join(COLLECT_SEPARATOR))?;

    debug!(count, "Client stream verified");
    Ok(())
}

/// Expand yields exactly `count` ordered messages, then ends cleanly.
pub async fn server_stream(
    client: &ConformanceClient,
    data: &[u8],
    count: usize,
) -> Result<(), CheckError> {
    let tag = client.echo_tag();
    let (ctx, _cancel) = client.call_context();
    let request = client.request(
        ExpandRequest {
            count: sequence_of(count),
            prefix: data.to_vec(),
        },
        &Directives::new().with_echo_tag(&tag),
        &ctx,
    )?;

    let mut stream = ctx
        .run(client.stub().expand(request))
        .await
        .map_err(CheckError::rpc("Expand"))?
        .into_inner();

    let mut received = 0;
    while let Some(message) = ctx
        .run(stream.message())
        .await
        .map_err(CheckError::rpc("Expand recv"))?
    {
        let sequence = sequence_of(received);
        if message.sequence != sequence {
            return Err(CheckError::mismatch(
                "sequence",
                message.sequence.to_string(),
                sequence.to_string(),
            ));
        }
        let want = [data, format!(":{sequence}").as_bytes()].concat();
        expect_bytes(format!("data at seq {sequence}"), &message.data, &want)?;
        received += 1;
    }

    if received != count {
        return Err(CheckError::mismatch(
            "message count",
            received.to_string(),
            count.to_string(),
        ));
    }

    let trailers = ctx
        .run(stream.trailers())
        .await
        .map_err(CheckError::rpc("Expand trailers"))?
        .ok_or(CheckError::MissingMetadata("trailers"))?;
    expect_metadata(&trailers, metadata_keys::ECHO_TAG, &tag)?;

    debug!(count, "Server stream verified");
    Ok(())
}

/// BiEcho alternates send and receive, then closes after half-close.
pub async fn bidi(client: &ConformanceClient, data: &[u8], count: usize) -> Result<(), CheckError> {
    let tag = client.echo_tag();
    let (ctx, _cancel) = client.call_context();

    let (tx, rx) = mpsc::channel(count.max(1));
    let request = client.request(
        ReceiverStream::new(rx),
        &Directives::new().with_echo_tag(&tag),
        &ctx,
    )?;

    let mut stream = ctx
        .run(client.stub().bi_echo(request))
        .await
        .map_err(CheckError::rpc("BiEcho"))?
        .into_inner();

    for i in 0..count {
        let unexpected_end = || CheckError::UnexpectedEnd {
            call: "BiEcho",
            received: i,
        };

        tx.send(BiEchoRequest {
            data: numbered(data, i),
        })
        .await
        .map_err(|_| unexpected_end())?;

        let reply = ctx
            .run(stream.message())
            .await
            .map_err(CheckError::rpc("BiEcho recv"))?
            .ok_or_else(unexpected_end)?;

        let sequence = sequence_of(i);
        if reply.sequence != sequence {
            return Err(CheckError::mismatch(
                "sequence",
                reply.sequence.to_string(),
                sequence.to_string(),
            ));
        }
        let prefix = format!("{sequence}:");
        if !reply.data.starts_with(prefix.as_bytes()) {
            return Err(CheckError::mismatch(
                format!("response format at seq {sequence}"),
                lossy(&reply.data),
                format!("{prefix}..."),
            ));
        }
    }

    // Half-close
    drop(tx);

    if let Some(extra) = ctx
        .run(stream.message())
        .await
        .map_err(CheckError::rpc("BiEcho recv after half-close"))?
    {
        return Err(CheckError::mismatch(
            "response after half-close",
            lossy(&extra.data),
            "end of stream",
        ));
    }

    let trailers = ctx
        .run(stream.trailers())
        .await
        .map_err(CheckError::rpc("BiEcho trailers"))?
        .ok_or(CheckError::MissingMetadata("trailers"))?;
    expect_metadata(&trailers, metadata_keys::ECHO_TAG, &tag)?;

    debug!(count, "Bidi stream verified");
    Ok(())
}

/// A short caller deadline against a long server sleep.
pub async fn deadline(client: &ConformanceClient, data: &[u8]) -> Result<(), CheckError> {
    let (ctx, _cancel) = CallContext::with_timeout(DEADLINE_BUDGET);
    let directives = Directives::new()
        .with_echo_tag(client.echo_tag())
        .with_sleep(DEADLINE_SLEEP);
    let request = client.request(echo_request(data), &directives, &ctx)?;

    let result = ctx.run(client.stub().echo(request)).await;
    expect_code(result, Code::DeadlineExceeded)?;

    debug!("Deadline propagation verified");
    Ok(())
}

/// Cancel a call that is blocked waiting for cancellation.
pub async fn cancel(client: &ConformanceClient, data: &[u8]) -> Result<(), CheckError> {
    let (ctx, handle) = CallContext::with_timeout(CANCEL_BUDGET);
    let directives = Directives::new()
        .with_echo_tag(client.echo_tag())
        .with_wait_for_cancel();
    let request = client.request(echo_request(data), &directives, &ctx)?;

    let mut stub = client.stub();
    let call = tokio::spawn(async move { ctx.run(stub.echo(request)).await });

    tokio::time::sleep(CANCEL_AFTER).await;
    handle.cancel();

    let result = call.await?;
    expect_code(result, Code::Cancelled)?;

    debug!("Cancellation propagation verified");
    Ok(())
}

/// Injected error arrives with exact code and message.
pub async fn error(client: &ConformanceClient, data: &[u8]) -> Result<(), CheckError> {
    let (ctx, _cancel) = client.call_context();
    let directives = Directives::new()
        .with_echo_tag(client.echo_tag())
        .with_injected_error(INJECTED_CODE, INJECTED_MESSAGE);
    let request = client.request(echo_request(data), &directives, &ctx)?;

    let result = ctx.run(client.stub().echo(request)).await;
    let status = expect_code(result, INJECTED_CODE)?;
    expect_message(&status, INJECTED_MESSAGE)?;

    debug!("Error propagation verified");
    Ok(())
}

// ============================================================================
// Supplemental checks
// ============================================================================

/// Injected error carries its raw details payload.
pub async fn error_details(client: &ConformanceClient, data: &[u8]) -> Result<(), CheckError> {
    let (ctx, _cancel) = client.call_context();
    let directives = Directives::new()
        .with_echo_tag(client.echo_tag())
        .with_injected_error(Code::ResourceExhausted, "details attached")
        .with_error_details(ERROR_DETAILS);
    let request = client.request(echo_request(data), &directives, &ctx)?;

    let result = ctx.run(client.stub().echo(request)).await;
    let status = expect_code(result, Code::ResourceExhausted)?;
    expect_message(&status, "details attached")?;
    expect_bytes("status details", status.details(), ERROR_DETAILS)?;

    Ok(())
}

/// The echo tag reaches the trailers of a failed call.
pub async fn error_trailer(client: &ConformanceClient, data: &[u8]) -> Result<(), CheckError> {
    let tag = client.echo_tag();
    let (ctx, _cancel) = client.call_context();
    let directives = Directives::new()
        .with_echo_tag(&tag)
        .with_injected_error(Code::NotFound, "no such thing");
    let request = client.request(echo_request(data), &directives, &ctx)?;

    let result = ctx.run(client.stub().echo(request)).await;
    let status = expect_code(result, Code::NotFound)?;
    expect_metadata(status.metadata(), metadata_keys::ECHO_TAG, &tag)?;

    Ok(())
}

/// Collect aborts once the error-after threshold is reached.
pub async fn client_stream_abort(
    client: &ConformanceClient,
    data: &[u8],
) -> Result<(), CheckError> {
    let (ctx, _cancel) = client.call_context();
    let directives = Directives::new()
        .with_echo_tag(client.echo_tag())
        .with_error_after(ABORT_AFTER);

    let messages: Vec<CollectRequest> = (0..=ABORT_AFTER)
        .map(|i| CollectRequest {
            data: numbered(data, i),
        })
        .collect();
    let outbound = tokio_stream::iter(messages);
    let request = client.request(outbound, &directives, &ctx)?;

    let result = ctx.run(client.stub().collect(request)).await;
    let status = expect_code(result, Code::Aborted)?;
    expect_message(&status, &format!("error after {ABORT_AFTER} messages"))?;

    Ok(())
}

/// Expand stops after the error-after threshold with the tag in its trailers.
pub async fn server_stream_abort(
    client: &ConformanceClient,
    data: &[u8],
    count: usize,
) -> Result<(), CheckError> {
    let tag = client.echo_tag();
    let (ctx, _cancel) = client.call_context();
    let directives = Directives::new()
        .with_echo_tag(&tag)
        .with_error_after(ABORT_AFTER);
    let request = client.request(
        ExpandRequest {
            count: sequence_of(count.max(ABORT_AFTER + 1)),
            prefix: data.to_vec(),
        },
        &directives,
        &ctx,
    )?;

    let mut stream = ctx
        .run(client.stub().expand(request))
        .await
        .map_err(CheckError::rpc("Expand"))?
        .into_inner();

    let mut received = 0;
    let status = loop {
        match ctx.run(stream.message()).await {
            Ok(Some(_)) => received += 1,
            Ok(None) => return Err(CheckError::UnexpectedSuccess(Code::Aborted)),
            Err(status) => break status,
        }
    };

    if received != ABORT_AFTER {
        return Err(CheckError::mismatch(
            "messages before abort",
            received.to_string(),
            ABORT_AFTER.to_string(),
        ));
    }
    let status = expect_code::<()>(Err(status), Code::Aborted)?;
    expect_message(&status, &format!("error after {ABORT_AFTER} messages"))?;
    expect_metadata(status.metadata(), metadata_keys::ECHO_TAG, &tag)?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_check_names_round_trip() {
        for check in Check::ALL {
            assert_eq!(check.name().parse::<Check>(), Ok(check));
            assert_eq!(check.to_string(), check.name());
        }
        assert!("everything".parse::<Check>().is_err());
    }

    #[test]
    fn test_core_checks_run_first_in_fixed_order() {
        let names: Vec<&str> = Check::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(
            &names[..7],
            &["unary", "client-stream", "server-stream", "bidi", "deadline", "cancel", "error"]
        );
    }

    #[test]
    fn test_expect_code() {
        let status = expect_code::<()>(Err(Status::aborted("stop")), Code::Aborted).unwrap();
        assert_eq!(status.message(), "stop");

        assert!(matches!(
            expect_code(Ok(()), Code::Aborted),
            Err(CheckError::UnexpectedSuccess(Code::Aborted))
        ));
        assert!(matches!(
            expect_code::<()>(Err(Status::cancelled("x")), Code::DeadlineExceeded),
            Err(CheckError::UnexpectedCode {
                want: Code::DeadlineExceeded,
                got: Code::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn test_expect_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert(metadata_keys::ECHO_TAG, "abc".parse().unwrap());

        assert!(expect_metadata(&metadata, metadata_keys::ECHO_TAG, "abc").is_ok());
        assert!(matches!(
            expect_metadata(&metadata, metadata_keys::ECHO_TAG, "xyz"),
            Err(CheckError::Mismatch { .. })
        ));
        assert!(matches!(
            expect_metadata(&metadata, metadata_keys::ECHO_TAG_HEADER, "abc"),
            Err(CheckError::MissingMetadata(metadata_keys::ECHO_TAG_HEADER))
        ));
    }

    #[test]
    fn test_numbered_payload() {
        assert_eq!(numbered(b"hello", 3), b"hello-3".to_vec());
    }
}
