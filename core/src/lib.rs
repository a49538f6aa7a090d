//! conformance-core - Shared pieces of the gRPC conformance harness
//!
//! Both halves of the harness, the behavior-simulating service and the
//! conformance driver, agree on the same things:
//!
//! - [`proto`] - the `conformance.v1.TestService` wire contract (prost
//!   messages, tonic client and server)
//! - [`metadata_keys`] - the reserved directive metadata keys
//! - [`Directives`] - a parsed, immutable directive set for one call
//! - [`CallContext`] - deadline and cancellation signal for one call
//! - [`logging`] - tracing subscriber bootstrap
//!
//! The service reads directives from inbound metadata and acts them out; the
//! driver writes them onto outbound requests and checks what comes back.
//!
//! ```text
//! driver ── Directives::apply ──► metadata ──► Directives::from_metadata ── service
//!    ▲                                                                       │
//!    └──────────── response / stream / status / headers / trailers ◄─────────┘
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod context;
pub mod directives;
mod error;
pub mod logging;
pub mod metadata_keys;

// Generated from proto/conformance/v1/test_service.proto
pub mod proto {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::derive_partial_eq_without_eq)]
    #![allow(missing_docs)]

    include!("proto/conformance.v1.rs");
}

pub use context::{parse_grpc_timeout, CallContext, CancelHandle, DoneReason};
pub use directives::{aborted_after, Directives, InjectedError};
pub use error::DirectiveError;
pub use logging::{init_tracing, LogFormat};

pub use proto::test_service_client::TestServiceClient;
pub use proto::test_service_server::{TestService, TestServiceServer};
pub use proto::{
    BiEchoRequest, BiEchoResponse, CollectRequest, CollectResponse, EchoRequest, EchoResponse,
    ExpandRequest, ExpandResponse,
};

/// Payload prefix of a nominal `Echo` response
pub const ECHO_PREFIX: &[u8] = b"ECHO:";

/// Separator between `Collect` payloads
pub const COLLECT_SEPARATOR: &[u8] = b"|";

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Wire message tests
    // ==========================================================================

    #[test]
    fn test_messages_default_empty() {
        assert!(EchoRequest::default().data.is_empty());
        let response = CollectResponse::default();
        assert!(response.data.is_empty());
        assert_eq!(response.count, 0);
        let request = ExpandRequest::default();
        assert_eq!(request.count, 0);
        assert!(request.prefix.is_empty());
        assert_eq!(BiEchoResponse::default().sequence, 0);
    }

    #[test]
    fn test_expand_response_prost_encoding() {
        use prost::Message;

        let response = ExpandResponse {
            data: b"x:1".to_vec(),
            sequence: 1,
        };
        let bytes = response.encode_to_vec();
        let decoded = ExpandResponse::decode(bytes.as_slice()).map_err(|e| e.to_string());
        assert_eq!(decoded, Ok(response));
    }

    #[test]
    fn test_wire_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EchoRequest>();
        assert_send_sync::<BiEchoResponse>();
        assert_send_sync::<Directives>();
        assert_send_sync::<CallContext>();
    }
}
