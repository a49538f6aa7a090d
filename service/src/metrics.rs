//! Prometheus metrics for the conformance service

use crate::error::{Result, ServiceError};
use prometheus::{
    register_counter, register_counter_vec, Counter, CounterVec, Encoder, TextEncoder,
};
use std::sync::OnceLock;
use tonic::Code;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All service metrics
pub struct Metrics {
    /// Calls accepted by a handler
    pub calls_started: Counter,

    /// Calls finished (by method, status code)
    pub calls_completed: CounterVec,

    /// Streamed messages (by method, direction)
    pub stream_messages: CounterVec,

    /// Directives observed on inbound calls (by directive key)
    pub directives: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            calls_started: register_counter!(
                "conformance_calls_started_total",
                "Total calls accepted by the service"
            )
            .map_err(|e| ServiceError::Metrics(format!("calls_started: {e}")))?,

            calls_completed: register_counter_vec!(
                "conformance_calls_completed_total",
                "Total calls finished, by terminal status code",
                &["method", "code"]
            )
            .map_err(|e| ServiceError::Metrics(format!("calls_completed: {e}")))?,

            stream_messages: register_counter_vec!(
                "conformance_stream_messages_total",
                "Total streamed messages received or sent",
                &["method", "direction"]
            )
            .map_err(|e| ServiceError::Metrics(format!("stream_messages: {e}")))?,

            directives: register_counter_vec!(
                "conformance_directives_total",
                "Total directives observed on inbound calls",
                &["directive"]
            )
            .map_err(|e| ServiceError::Metrics(format!("directives: {e}")))?,
        };

        let _ = METRICS.set(metrics);
        METRICS
            .get()
            .ok_or_else(|| ServiceError::Metrics("metrics not initialized".to_string()))
    }

    /// Get the global metrics instance, if initialized
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_started(&self) {
        self.calls_started.inc();
    }

    pub fn record_completed(&self, method: &str, code: Code) {
        self.calls_completed
            .with_label_values(&[method, code_label(code)])
            .inc();
    }

    pub fn record_message(&self, method: &str, direction: Direction) {
        self.stream_messages
            .with_label_values(&[method, direction.as_str()])
            .inc();
    }

    pub fn record_directive(&self, directive: &str) {
        self.directives.with_label_values(&[directive]).inc();
    }
}

/// Direction of a streamed message, relative to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Received => "received",
            Direction::Sent => "sent",
        }
    }
}

/// Canonical upper-snake name of a status code
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Gather all metrics as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Records the terminal outcome of one call.
///
/// A tracker dropped without [`CallTracker::finish`] means the handler
/// future or response stream was dropped mid-call, which only happens when
/// the peer resets the call.
pub struct CallTracker {
    method: &'static str,
    finished: bool,
}

impl CallTracker {
    pub fn start(method: &'static str) -> Self {
        if let Some(m) = Metrics::get() {
            m.record_started();
        }
        Self {
            method,
            finished: false,
        }
    }

    pub fn message(&self, direction: Direction) {
        if let Some(m) = Metrics::get() {
            m.record_message(self.method, direction);
        }
    }

    pub fn finish(&mut self, code: Code) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(m) = Metrics::get() {
            m.record_completed(self.method, code);
        }
    }

    /// Record a failed `result` as this call's outcome and hand it back.
    pub fn guard<T>(
        &mut self,
        result: std::result::Result<T, tonic::Status>,
    ) -> std::result::Result<T, tonic::Status> {
        if let Err(status) = &result {
            tracing::info!(
                method = self.method,
                code = ?status.code(),
                message = status.message(),
                "Call failed"
            );
            self.finish(status.code());
        }
        result
    }
}

impl Drop for CallTracker {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(method = self.method, "Call cancelled by peer");
            self.finish(Code::Cancelled);
        }
    }
}

/// Count each directive present on a call
pub fn record_directives(directives: &[&'static str]) {
    if let Some(m) = Metrics::get() {
        for directive in directives {
            m.record_directive(directive);
        }
    }
}
