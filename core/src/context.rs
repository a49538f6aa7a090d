//! Call context: deadline plus explicit cancellation
//!
//! Every call carries one [`CallContext`]. It answers a single question at
//! any suspension point: is this call done, and if so, why? An explicit
//! cancel always reads as [`DoneReason::Cancelled`]; an expired time budget
//! reads as [`DoneReason::DeadlineExceeded`]. When both hold, the cancel
//! wins.
//!
//! On the service side the context is built from the inbound `grpc-timeout`
//! header and is never cancelled explicitly: a peer cancel drops the handler
//! future instead. On the driver side the caller keeps a [`CancelHandle`] and
//! runs the call through [`CallContext::run`], which reconciles whatever the
//! transport reported with the context's own view.

use crate::metadata_keys;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Status};

/// Why a call context finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Explicitly cancelled by the caller
    Cancelled,
    /// The time budget ran out
    DeadlineExceeded,
}

impl DoneReason {
    pub fn code(self) -> Code {
        match self {
            DoneReason::Cancelled => Code::Cancelled,
            DoneReason::DeadlineExceeded => Code::DeadlineExceeded,
        }
    }

    /// The terminal status for a call that ended for this reason.
    pub fn into_status(self) -> Status {
        match self {
            DoneReason::Cancelled => Status::cancelled("context canceled"),
            DoneReason::DeadlineExceeded => Status::deadline_exceeded("context deadline exceeded"),
        }
    }
}

/// Owner side of a context's cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the call. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Deadline and cancellation signal of one call
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancelled: watch::Receiver<bool>,
}

impl CallContext {
    /// A context with no deadline.
    pub fn new() -> (Self, CancelHandle) {
        Self::build(None)
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        Self::build(Instant::now().checked_add(timeout))
    }

    /// Server-side context derived from the inbound `grpc-timeout` header.
    ///
    /// A missing or malformed header means no deadline.
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let timeout = metadata
            .get(metadata_keys::GRPC_TIMEOUT)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout);

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let (ctx, _handle) = Self::build(deadline);
        ctx
    }

    fn build(deadline: Option<Instant>) -> (Self, CancelHandle) {
        let (tx, cancelled) = watch::channel(false);
        (Self { deadline, cancelled }, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking poll of the context.
    pub fn reason(&self) -> Option<DoneReason> {
        if *self.cancelled.borrow() {
            return Some(DoneReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DoneReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Err` with the mapped status once the context is done.
    pub fn check(&self) -> Result<(), Status> {
        match self.reason() {
            Some(reason) => Err(reason.into_status()),
            None => Ok(()),
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a context with no deadline whose handle is gone.
    pub async fn done(&self) -> DoneReason {
        let mut cancelled = self.cancelled.clone();
        let cancel = async move {
            let closed = cancelled.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        };
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel => DoneReason::Cancelled,
            _ = expiry => {
                // A cancel that landed at the same instant still wins.
                self.reason().unwrap_or(DoneReason::DeadlineExceeded)
            }
        }
    }

    /// Sleep for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Status> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(reason.into_status()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drive an outbound call under this context.
    ///
    /// The call future is dropped as soon as the context finishes, which
    /// resets the stream on the wire. A `Cancelled` or `DeadlineExceeded`
    /// status is remapped through [`CallContext::reason`] so a client-side
    /// timeout never reads as a cancel, nor the reverse.
    pub async fn run<T, F>(&self, call: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        self.check()?;
        let result = tokio::select! {
            biased;
            reason = self.done() => Err(reason.into_status()),
            result = call => result,
        };
        result.map_err(|status| self.reconcile(status))
    }

    /// Only the two codes a local timeout or stream reset can produce are
    /// remapped. Any other code came from the server and is kept.
    fn reconcile(&self, status: Status) -> Status {
        if !matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded) {
            return status;
        }
        match self.reason() {
            Some(reason) if status.code() != reason.code() => {
                tracing::debug!(
                    transport_code = ?status.code(),
                    context_code = ?reason.code(),
                    "Remapping call status to context outcome"
                );
                reason.into_status()
            }
            _ => status,
        }
    }

    /// Carry the remaining time budget on an outbound request.
    pub fn propagate<T>(&self, request: &mut Request<T>) {
        if let Some(remaining) = self.remaining() {
            request.set_timeout(remaining);
        }
    }
}

/// Parse a `grpc-timeout` header value: up to 8 digits and a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 {
        return None;
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let duration = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}
