//! Service behavior tests
//!
//! These tests start a real conformance server on an ephemeral port and
//! drive every directive through a plain tonic client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use conformance_core::metadata_keys;
use conformance_core::proto::{
    BiEchoRequest, CollectRequest, EchoRequest, ExpandRequest, ExpandResponse,
};
use conformance_core::{CallContext, Directives, TestServiceClient};
use conformance_service::{ConformanceServer, RunningServer};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::BoxBody;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

// ============================================================================
// Test Helpers
// ============================================================================

async fn start() -> RunningServer {
    ConformanceServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
        .start()
}

async fn start_server() -> (RunningServer, TestServiceClient<Channel>) {
    let running = start().await;
    let client = TestServiceClient::connect(running.endpoint()).await.unwrap();
    (running, client)
}

type WireClient = TestServiceClient<Client<HttpConnector, BoxBody>>;

/// A plain HTTP/2 client. Unlike a tonic `Channel` it never enforces
/// `grpc-timeout` locally, so every status it sees was sent by the server.
fn wire_client(server: &RunningServer) -> WireClient {
    let http = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http::<BoxBody>();
    TestServiceClient::with_origin(http, server.endpoint().parse().unwrap())
}

fn with_timeout<T>(mut request: Request<T>, timeout: Duration) -> Request<T> {
    request.set_timeout(timeout);
    request
}

fn request<T>(message: T, directives: Directives) -> Request<T> {
    let mut request = Request::new(message);
    directives.apply(request.metadata_mut()).unwrap();
    request
}

fn echo(data: &str) -> EchoRequest {
    EchoRequest {
        data: data.as_bytes().to_vec(),
    }
}

fn collect_stream(items: &[&str]) -> tokio_stream::Iter<std::vec::IntoIter<CollectRequest>> {
    tokio_stream::iter(
        items
            .iter()
            .map(|item| CollectRequest {
                data: item.as_bytes().to_vec(),
            })
            .collect::<Vec<_>>(),
    )
}

async fn drain_expand(
    stream: &mut tonic::Streaming<ExpandResponse>,
) -> (Vec<ExpandResponse>, Option<Status>) {
    let mut received = Vec::new();
    loop {
        match stream.message().await {
            Ok(Some(message)) => received.push(message),
            Ok(None) => return (received, None),
            Err(status) => return (received, Some(status)),
        }
    }
}

fn tag_of(metadata: &tonic::metadata::MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .map(|value| value.to_str().unwrap().to_string())
}

// ============================================================================
// Echo
// ============================================================================

#[tokio::test]
async fn test_echo_prefixes_payload() {
    let (server, mut client) = start_server().await;

    let response = client.echo(echo("hello")).await.unwrap();
    assert_eq!(response.into_inner().data, b"ECHO:hello");

    let response = client.echo(echo("")).await.unwrap();
    assert_eq!(response.into_inner().data, b"ECHO:");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_echo_tag_in_header_and_trailer() {
    let (server, mut client) = start_server().await;

    let response = client
        .echo(request(echo("tagged"), Directives::new().with_echo_tag("rust-abc")))
        .await
        .unwrap();

    // Unary responses merge headers and trailers into one map
    assert_eq!(
        tag_of(response.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("rust-abc")
    );
    assert_eq!(
        tag_of(response.metadata(), metadata_keys::ECHO_TAG_HEADER).as_deref(),
        Some("rust-abc")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_echo_is_idempotent() {
    let (server, mut client) = start_server().await;

    let first = client.echo(echo("same")).await.unwrap().into_inner();
    let second = client.echo(echo("same")).await.unwrap().into_inner();
    assert_eq!(first, second);

    server.shutdown().await.unwrap();
}

// ============================================================================
// Injected errors
// ============================================================================

#[tokio::test]
async fn test_injected_error_round_trip() {
    let (server, mut client) = start_server().await;

    let directives = Directives::new()
        .with_echo_tag("err-tag")
        .with_injected_error(Code::FailedPrecondition, "server error test");
    let status = client
        .echo(request(echo("x"), directives))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(status.message(), "server error test");
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("err-tag")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_injected_error_with_details() {
    let (server, mut client) = start_server().await;

    let directives = Directives::new()
        .with_injected_error(Code::ResourceExhausted, "quota")
        .with_error_details("detail-payload");
    let status = client
        .echo(request(echo("x"), directives))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::ResourceExhausted);
    assert_eq!(status.details(), b"detail-payload");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_injected_ok_code_is_not_an_error() {
    let (server, mut client) = start_server().await;

    let mut req = Request::new(echo("fine"));
    req.metadata_mut()
        .insert(metadata_keys::INJECT_ERROR, "0:not an error".parse().unwrap());
    let response = client.echo(req).await.unwrap();
    assert_eq!(response.into_inner().data, b"ECHO:fine");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_numeric_code_maps_to_unknown() {
    let (server, mut client) = start_server().await;

    let mut req = Request::new(echo("x"));
    req.metadata_mut()
        .insert(metadata_keys::INJECT_ERROR, "bogus:whatever".parse().unwrap());
    let status = client.echo(req).await.unwrap_err();
    assert_eq!(status.code(), Code::Unknown);
    assert_eq!(status.message(), "whatever");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_directive_is_invalid_argument() {
    let (server, mut client) = start_server().await;

    let mut req = Request::new(echo("x"));
    req.metadata_mut()
        .insert(metadata_keys::SLEEP_MS, "later".parse().unwrap());
    let status = client.echo(req).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains(metadata_keys::SLEEP_MS));

    server.shutdown().await.unwrap();
}

// ============================================================================
// Deadline and cancellation
// ============================================================================

#[tokio::test]
async fn test_sleep_past_deadline_is_deadline_exceeded() {
    let (server, mut client) = start_server().await;

    let (ctx, _handle) = CallContext::with_timeout(Duration::from_millis(50));
    let mut req = request(
        echo("slow"),
        Directives::new().with_sleep(Duration::from_millis(200)),
    );
    ctx.propagate(&mut req);

    let status = ctx.run(client.echo(req)).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sleep_within_deadline_succeeds() {
    let (server, mut client) = start_server().await;

    let (ctx, _handle) = CallContext::with_timeout(Duration::from_secs(5));
    let mut req = request(
        echo("patient"),
        Directives::new().with_sleep(Duration::from_millis(20)),
    );
    ctx.propagate(&mut req);

    let response = ctx.run(client.echo(req)).await.unwrap();
    assert_eq!(response.into_inner().data, b"ECHO:patient");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_cancel_then_cancel_is_cancelled() {
    let (server, client) = start_server().await;

    let (ctx, handle) = CallContext::with_timeout(Duration::from_secs(5));
    let call = tokio::spawn(async move {
        let mut client = client;
        let mut req = request(echo("wait"), Directives::new().with_wait_for_cancel());
        ctx.propagate(&mut req);
        ctx.run(client.echo(req)).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let status = call.await.unwrap().unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_cancel_until_deadline_is_deadline_exceeded() {
    let (server, mut client) = start_server().await;

    let (ctx, _handle) = CallContext::with_timeout(Duration::from_millis(50));
    let mut req = request(echo("wait"), Directives::new().with_wait_for_cancel());
    ctx.propagate(&mut req);

    let status = ctx.run(client.echo(req)).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);

    server.shutdown().await.unwrap();
}

// ============================================================================
// Deadlines as sent by the server
// ============================================================================

#[tokio::test]
async fn test_sleep_past_deadline_sends_deadline_exceeded_with_tag() {
    let server = start().await;
    let mut client = wire_client(&server);

    let directives = Directives::new()
        .with_echo_tag("wire-sleep")
        .with_sleep(Duration::from_millis(500));
    let req = with_timeout(request(echo("slow"), directives), Duration::from_millis(100));

    let status = client.echo(req).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("wire-sleep")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_cancel_sends_deadline_exceeded_with_tag() {
    let server = start().await;
    let mut client = wire_client(&server);

    let directives = Directives::new()
        .with_echo_tag("wire-wait")
        .with_wait_for_cancel();
    let req = with_timeout(request(echo("wait"), directives), Duration::from_millis(100));

    let status = client.echo(req).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(status.message(), "context deadline exceeded");
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("wire-wait")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collect_deadline_mid_stream_sends_deadline_exceeded_with_tag() {
    let server = start().await;
    let mut client = wire_client(&server);

    let directives = Directives::new()
        .with_echo_tag("wire-collect")
        .with_message_delay(Duration::from_millis(50));
    let items = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
    let req = with_timeout(
        request(collect_stream(&items), directives),
        Duration::from_millis(120),
    );

    let status = client.collect(req).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("wire-collect")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collect_waiting_for_input_observes_deadline() {
    let server = start().await;
    let mut client = wire_client(&server);

    // The inbound stream stays open, so only the deadline can end the call.
    let (tx, rx) = mpsc::channel(1);
    tx.send(CollectRequest {
        data: b"only".to_vec(),
    })
    .await
    .unwrap();
    let req = with_timeout(
        request(
            ReceiverStream::new(rx),
            Directives::new().with_echo_tag("wire-idle"),
        ),
        Duration::from_millis(100),
    );

    let status = client.collect(req).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("wire-idle")
    );

    drop(tx);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bi_echo_waiting_for_input_observes_deadline() {
    let server = start().await;
    let mut client = wire_client(&server);

    let (tx, rx) = mpsc::channel(1);
    let req = with_timeout(
        request(
            ReceiverStream::new(rx),
            Directives::new().with_echo_tag("wire-bidi"),
        ),
        Duration::from_millis(150),
    );
    let mut stream = client.bi_echo(req).await.unwrap().into_inner();

    tx.send(BiEchoRequest { data: b"a".to_vec() }).await.unwrap();
    let reply = stream.message().await.unwrap().unwrap();
    assert_eq!(reply.data, b"0:a");

    // No second message: the deadline ends the call.
    let status = stream.message().await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("wire-bidi")
    );

    drop(tx);
    server.shutdown().await.unwrap();
}

// ============================================================================
// Collect
// ============================================================================

#[tokio::test]
async fn test_collect_joins_in_order() {
    let (server, mut client) = start_server().await;

    let response = client
        .collect(request(
            collect_stream(&["a", "b", "c"]),
            Directives::new().with_echo_tag("collect-tag"),
        ))
        .await
        .unwrap();

    assert_eq!(
        tag_of(response.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("collect-tag")
    );
    let response = response.into_inner();
    assert_eq!(response.data, b"a|b|c");
    assert_eq!(response.count, 3);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collect_empty_stream() {
    let (server, mut client) = start_server().await;

    let response = client.collect(collect_stream(&[])).await.unwrap().into_inner();
    assert!(response.data.is_empty());
    assert_eq!(response.count, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collect_aborts_after_count() {
    let (server, mut client) = start_server().await;

    let status = client
        .collect(request(
            collect_stream(&["one", "two", "three"]),
            Directives::new().with_error_after(2),
        ))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::Aborted);
    assert_eq!(status.message(), "error after 2 messages");

    server.shutdown().await.unwrap();
}

// ============================================================================
// Expand
// ============================================================================

#[tokio::test]
async fn test_expand_sequence() {
    let (server, mut client) = start_server().await;

    let mut stream = client
        .expand(request(
            ExpandRequest {
                count: 3,
                prefix: b"x".to_vec(),
            },
            Directives::new().with_echo_tag("expand-tag"),
        ))
        .await
        .unwrap()
        .into_inner();

    let (received, status) = drain_expand(&mut stream).await;
    assert!(status.is_none());
    let data: Vec<Vec<u8>> = received.iter().map(|r| r.data.clone()).collect();
    assert_eq!(data, vec![b"x:0".to_vec(), b"x:1".to_vec(), b"x:2".to_vec()]);
    let sequences: Vec<i32> = received.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    let trailers = stream.trailers().await.unwrap().unwrap();
    assert_eq!(
        tag_of(&trailers, metadata_keys::ECHO_TAG).as_deref(),
        Some("expand-tag")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expand_negative_count_is_empty() {
    let (server, mut client) = start_server().await;

    let mut stream = client
        .expand(ExpandRequest {
            count: -4,
            prefix: b"neg".to_vec(),
        })
        .await
        .unwrap()
        .into_inner();

    let (received, status) = drain_expand(&mut stream).await;
    assert!(received.is_empty());
    assert!(status.is_none());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expand_aborts_after_count_with_tag() {
    let (server, mut client) = start_server().await;

    let mut stream = client
        .expand(request(
            ExpandRequest {
                count: 5,
                prefix: b"p".to_vec(),
            },
            Directives::new()
                .with_echo_tag("abort-tag")
                .with_error_after(2),
        ))
        .await
        .unwrap()
        .into_inner();

    let (received, status) = drain_expand(&mut stream).await;
    assert_eq!(received.len(), 2);
    let status = status.expect("stream should end with an error");
    assert_eq!(status.code(), Code::Aborted);
    assert_eq!(status.message(), "error after 2 messages");
    assert_eq!(
        tag_of(status.metadata(), metadata_keys::ECHO_TAG).as_deref(),
        Some("abort-tag")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expand_with_delay() {
    let (server, mut client) = start_server().await;

    let started = std::time::Instant::now();
    let mut stream = client
        .expand(request(
            ExpandRequest {
                count: 3,
                prefix: b"d".to_vec(),
            },
            Directives::new().with_message_delay(Duration::from_millis(20)),
        ))
        .await
        .unwrap()
        .into_inner();

    let (received, status) = drain_expand(&mut stream).await;
    assert_eq!(received.len(), 3);
    assert!(status.is_none());
    assert!(started.elapsed() >= Duration::from_millis(40));

    server.shutdown().await.unwrap();
}

// ============================================================================
// BiEcho
// ============================================================================

#[tokio::test]
async fn test_bi_echo_alternates_and_closes_cleanly() {
    let (server, mut client) = start_server().await;

    let (tx, rx) = mpsc::channel(4);
    let mut stream = client
        .bi_echo(request(
            ReceiverStream::new(rx),
            Directives::new().with_echo_tag("bidi-tag"),
        ))
        .await
        .unwrap()
        .into_inner();

    for i in 0..3 {
        tx.send(BiEchoRequest {
            data: format!("msg-{i}").into_bytes(),
        })
        .await
        .unwrap();

        let reply = stream.message().await.unwrap().unwrap();
        assert_eq!(reply.sequence, i);
        assert_eq!(reply.data, format!("{i}:msg-{i}").into_bytes());
    }

    // Half-close
    drop(tx);
    assert!(stream.message().await.unwrap().is_none());

    let trailers = stream.trailers().await.unwrap().unwrap();
    assert_eq!(
        tag_of(&trailers, metadata_keys::ECHO_TAG).as_deref(),
        Some("bidi-tag")
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bi_echo_aborts_after_count() {
    let (server, mut client) = start_server().await;

    let (tx, rx) = mpsc::channel(4);
    let mut stream = client
        .bi_echo(request(
            ReceiverStream::new(rx),
            Directives::new().with_error_after(1),
        ))
        .await
        .unwrap()
        .into_inner();

    tx.send(BiEchoRequest { data: b"a".to_vec() }).await.unwrap();
    let reply = stream.message().await.unwrap().unwrap();
    assert_eq!(reply.data, b"0:a");

    tx.send(BiEchoRequest { data: b"b".to_vec() }).await.unwrap();
    let status = stream.message().await.unwrap_err();
    assert_eq!(status.code(), Code::Aborted);
    assert_eq!(status.message(), "error after 1 messages");

    server.shutdown().await.unwrap();
}
