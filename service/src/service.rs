//! Behavior-simulating `TestService`
//!
//! Every call runs the same fixed pipeline:
//!
//! 1. echo tag (handled by [`EchoTagService`](crate::echo_tag::EchoTagService))
//! 2. wait-for-cancel
//! 3. sleep
//! 4. injected error
//! 5. the method's nominal transform
//!
//! Streaming methods additionally honor the per-message delay and the
//! error-after-count threshold, and poll the call context at every
//! iteration boundary.

use crate::echo_tag::EchoTagService;
use crate::metrics::{record_directives, CallTracker, Direction};
use conformance_core::proto::test_service_server::{TestService, TestServiceServer};
use conformance_core::proto::{
    BiEchoRequest, BiEchoResponse, CollectRequest, CollectResponse, EchoRequest, EchoResponse,
    ExpandRequest, ExpandResponse,
};
use conformance_core::{CallContext, Directives, COLLECT_SEPARATOR, ECHO_PREFIX};
use std::pin::Pin;
use tokio_stream::Stream;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

const ECHO: &str = "Echo";
const COLLECT: &str = "Collect";
const EXPAND: &str = "Expand";
const BI_ECHO: &str = "BiEcho";

/// Boxed response stream of a streaming method
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// The behavior-simulating service
#[derive(Debug, Clone, Default)]
pub struct ConformanceService;

impl ConformanceService {
    pub fn new() -> Self {
        Self
    }

    /// The tonic server for this service, wrapped in the echo-tag layer.
    pub fn into_server(self) -> EchoTagService<TestServiceServer<Self>> {
        EchoTagService::new(TestServiceServer::new(self))
    }
}

/// Parse directives and build the call context.
fn prepare(
    method: &'static str,
    metadata: &MetadataMap,
) -> Result<(Directives, CallContext), Status> {
    let directives = Directives::from_metadata(metadata).map_err(|e| {
        warn!(method, error = %e, "Rejecting call with malformed directive");
        Status::from(e)
    })?;

    let active = directives.active();
    record_directives(&active);
    debug!(
        method,
        directives = ?active,
        echo_tag = directives.echo_tag.as_deref().unwrap_or_default(),
        "Call received"
    );

    Ok((directives, CallContext::from_metadata(metadata)))
}

/// Wait-for-cancel, sleep and injected error, in that order.
async fn preamble(
    method: &'static str,
    directives: &Directives,
    ctx: &CallContext,
) -> Result<(), Status> {
    if directives.wait_for_cancel {
        debug!(method, "Waiting for cancellation or deadline");
        let reason = ctx.done().await;
        info!(method, ?reason, "Call context finished while waiting");
        return Err(reason.into_status());
    }

    if let Some(sleep) = directives.sleep {
        debug!(method, sleep_ms = sleep.as_millis() as u64, "Sleeping before response");
        ctx.sleep(sleep).await?;
    }

    if let Some(status) = directives.injected_status() {
        if directives.error_details.as_ref().is_some_and(|d| d.is_empty()) {
            debug!(method, "Error details requested without a payload, sending plain status");
        }
        info!(
            method,
            code = ?status.code(),
            message = status.message(),
            "Injecting error"
        );
        return Err(status);
    }

    Ok(())
}

fn len_i32(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

#[tonic::async_trait]
impl TestService for ConformanceService {
    type ExpandStream = ResponseStream<ExpandResponse>;
    type BiEchoStream = ResponseStream<BiEchoResponse>;

    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        let mut tracker = CallTracker::start(ECHO);
        let (directives, ctx) = tracker.guard(prepare(ECHO, request.metadata()))?;
        tracker.guard(preamble(ECHO, &directives, &ctx).await)?;

        let data = request.into_inner().data;
        debug!(method = ECHO, bytes = data.len(), "Echoing payload");

        tracker.finish(Code::Ok);
        Ok(Response::new(EchoResponse {
            data: [ECHO_PREFIX, data.as_slice()].concat(),
        }))
    }

    async fn collect(
        &self,
        request: Request<Streaming<CollectRequest>>,
    ) -> Result<Response<CollectResponse>, Status> {
        let mut tracker = CallTracker::start(COLLECT);
        let (directives, ctx) = tracker.guard(prepare(COLLECT, request.metadata()))?;
        tracker.guard(preamble(COLLECT, &directives, &ctx).await)?;

        let mut inbound = request.into_inner();
        let mut parts: Vec<Vec<u8>> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                reason = ctx.done() => Err(reason.into_status()),
                next = inbound.message() => next,
            };
            let Some(message) = tracker.guard(next)? else {
                break;
            };

            tracker.message(Direction::Received);
            debug!(
                method = COLLECT,
                index = parts.len(),
                bytes = message.data.len(),
                "Received message"
            );
            parts.push(message.data);

            tracker.guard(directives.check_error_after(parts.len()))?;

            if let Some(delay) = directives.message_delay {
                tracker.guard(ctx.sleep(delay).await)?;
            }
        }

        debug!(method = COLLECT, count = parts.len(), "Inbound closed, replying");
        tracker.finish(Code::Ok);
        Ok(Response::new(CollectResponse {
            data: parts.join(COLLECT_SEPARATOR),
            count: len_i32(parts.len()),
        }))
    }

    async fn expand(
        &self,
        request: Request<ExpandRequest>,
    ) -> Result<Response<Self::ExpandStream>, Status> {
        let mut tracker = CallTracker::start(EXPAND);
        let (directives, ctx) = tracker.guard(prepare(EXPAND, request.metadata()))?;
        tracker.guard(preamble(EXPAND, &directives, &ctx).await)?;

        let ExpandRequest { count, prefix } = request.into_inner();
        let count = count.max(0);
        debug!(
            method = EXPAND,
            count,
            prefix = %String::from_utf8_lossy(&prefix),
            "Generating responses"
        );

        let output = async_stream::try_stream! {
            let mut tracker = tracker;

            for sequence in 0..count {
                tracker.guard(ctx.check())?;
                tracker.guard(directives.check_error_after(sequence as usize))?;

                let mut data = prefix.clone();
                data.push(b':');
                data.extend_from_slice(sequence.to_string().as_bytes());

                yield ExpandResponse { data, sequence };
                tracker.message(Direction::Sent);

                if let Some(delay) = directives.message_delay {
                    tracker.guard(ctx.sleep(delay).await)?;
                }
            }

            tracker.finish(Code::Ok);
        };

        Ok(Response::new(Box::pin(output)))
    }

    async fn bi_echo(
        &self,
        request: Request<Streaming<BiEchoRequest>>,
    ) -> Result<Response<Self::BiEchoStream>, Status> {
        let mut tracker = CallTracker::start(BI_ECHO);
        let (directives, ctx) = tracker.guard(prepare(BI_ECHO, request.metadata()))?;
        tracker.guard(preamble(BI_ECHO, &directives, &ctx).await)?;

        let mut inbound = request.into_inner();

        let output = async_stream::try_stream! {
            let mut tracker = tracker;
            let mut sequence: i32 = 0;

            loop {
                let next = tokio::select! {
                    biased;
                    reason = ctx.done() => Err(reason.into_status()),
                    next = inbound.message() => next,
                };
                let Some(message) = tracker.guard(next)? else {
                    break;
                };

                tracker.message(Direction::Received);
                debug!(method = BI_ECHO, sequence, "Received message");
                tracker.guard(directives.check_error_after(sequence as usize))?;

                let mut data = sequence.to_string().into_bytes();
                data.push(b':');
                data.extend_from_slice(&message.data);

                yield BiEchoResponse { data, sequence };
                tracker.message(Direction::Sent);
                sequence += 1;

                if let Some(delay) = directives.message_delay {
                    tracker.guard(ctx.sleep(delay).await)?;
                }
            }

            debug!(method = BI_ECHO, count = sequence, "Inbound closed, ending stream");
            tracker.finish(Code::Ok);
        };

        Ok(Response::new(Box::pin(output)))
    }
}
