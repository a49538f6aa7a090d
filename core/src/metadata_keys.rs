//! Reserved metadata keys for call directives
//!
//! Directives ride in request metadata, next to the payload rather than in
//! it. The service reads them once per call; the driver writes them. Keys
//! are lowercase ASCII, as HTTP/2 requires.

/// Correlation value echoed back as a trailer (and as [`ECHO_TAG_HEADER`])
pub const ECHO_TAG: &str = "x-echo-tag";

/// Response header carrying the echoed tag, sent before any payload
pub const ECHO_TAG_HEADER: &str = "x-echo-tag-header";

/// Fixed delay in milliseconds before the nominal response
pub const SLEEP_MS: &str = "x-sleep-ms";

/// Presence flag: block until the call is cancelled or its deadline passes
pub const WAIT_CANCEL: &str = "x-wait-cancel";

/// Injected terminal status, formatted `"<code>:<message>"`
pub const INJECT_ERROR: &str = "x-inject-error";

/// Raw status details attached to an injected error
pub const ERROR_DETAILS: &str = "x-error-details";

/// Delay in milliseconds after each streamed message
pub const DELAY_MS: &str = "x-delay-ms";

/// Fail with `Aborted` once this many streamed messages have gone by
pub const ERROR_AFTER_COUNT: &str = "x-error-after-count";

/// Deadline header set by gRPC clients (`<amount><unit>`)
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// All directive keys, in pipeline order
pub const DIRECTIVES: [&str; 7] = [
    ECHO_TAG,
    WAIT_CANCEL,
    SLEEP_MS,
    INJECT_ERROR,
    ERROR_DETAILS,
    DELAY_MS,
    ERROR_AFTER_COUNT,
];
