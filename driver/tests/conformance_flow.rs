//! End-to-end conformance runs
//!
//! The driver runs against a conformance service started in-process on an
//! ephemeral port.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use conformance_driver::checks::{self, Check};
use conformance_driver::{CheckError, CheckSuite, ConformanceClient};
use conformance_service::{ConformanceServer, RunningServer};
use std::time::Duration;
use tonic::transport::Endpoint;
use tonic::Code;

// ============================================================================
// Test Helpers
// ============================================================================

async fn start() -> (RunningServer, ConformanceClient) {
    let server = ConformanceServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let running = server.start();
    let client = ConformanceClient::connect(&running.endpoint(), Duration::from_secs(5))
        .await
        .unwrap()
        .with_tag_prefix("flow");
    (running, client)
}

/// A client whose every call fails with `Unavailable`.
fn unreachable_client() -> ConformanceClient {
    let channel = Endpoint::from_static("http://127.0.0.1:1")
        .connect_timeout(Duration::from_millis(200))
        .connect_lazy();
    ConformanceClient::new(channel).with_call_timeout(Duration::from_secs(2))
}

// ============================================================================
// Full runs
// ============================================================================

#[tokio::test]
async fn test_run_all_passes() {
    let (server, client) = start().await;

    let suite = CheckSuite::new(client, "hello", 5);
    suite.run_all().await.expect("every check should pass");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_each_check_passes_on_its_own() {
    let (server, client) = start().await;
    let suite = CheckSuite::new(client, "solo", 3);

    for check in Check::ALL {
        suite
            .run(check)
            .await
            .unwrap_or_else(|failure| panic!("{failure}"));
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_message_streams() {
    let (server, client) = start().await;

    let suite = CheckSuite::new(client, "one", 1);
    suite
        .run_checks(&[Check::ClientStream, Check::ServerStream, Check::Bidi])
        .await
        .unwrap();

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_run_stops_at_first_failure() {
    let suite = CheckSuite::new(unreachable_client(), "hello", 2);

    let failure = suite
        .run_checks(&[Check::Unary, Check::Error])
        .await
        .unwrap_err();

    assert_eq!(failure.name, "unary");
    assert!(matches!(
        failure.source,
        CheckError::Rpc { call: "Echo", ref status } if status.code() == Code::Unavailable
    ));
}

// ============================================================================
// Individual checks
// ============================================================================

#[tokio::test]
async fn test_server_stream_with_short_prefix() {
    let (server, client) = start().await;

    checks::server_stream(&client, b"x", 3).await.unwrap();

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_stream_abort_reports_threshold() {
    let (server, client) = start().await;

    checks::client_stream_abort(&client, b"abort").await.unwrap();

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_stream_abort_with_small_count() {
    let (server, client) = start().await;

    // The check raises the requested count past the threshold
    checks::server_stream_abort(&client, b"abort", 1).await.unwrap();

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deadline_and_cancel_are_distinct() {
    let (server, client) = start().await;

    checks::deadline(&client, b"late").await.unwrap();
    checks::cancel(&client, b"stop").await.unwrap();

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_binary_payload_round_trips() {
    let (server, client) = start().await;

    checks::unary(&client, &[0x00, 0xff, 0x7f]).await.unwrap();

    server.shutdown().await.unwrap();
}
