//! Echo-tag metadata layer
//!
//! tonic handlers can set response headers but not trailers, so the echo
//! tag is attached one level down, on the HTTP response of the generated
//! server. [`EchoTagService`] copies an inbound `x-echo-tag` into:
//!
//! - the `x-echo-tag-header` response header, sent before any payload
//! - the `x-echo-tag` trailer, on every terminal outcome
//!
//! A trailers-only response (an error before any message) has a single
//! header block that clients read as trailers, so the tag goes there.

use bytes::Bytes;
use conformance_core::metadata_keys;
use http::HeaderValue;
use http_body::{Body, Frame, SizeHint};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::Status;
use tower::Service;

const GRPC_STATUS: &str = "grpc-status";

/// Wraps a generated tonic server and echoes the call's tag back
#[derive(Debug, Clone)]
pub struct EchoTagService<S> {
    inner: S,
}

impl<S> EchoTagService<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: NamedService> NamedService for EchoTagService<S> {
    const NAME: &'static str = S::NAME;
}

impl<S, B> Service<http::Request<B>> for EchoTagService<S>
where
    S: Service<http::Request<B>, Response = http::Response<BoxBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let tag = request.headers().get(metadata_keys::ECHO_TAG).cloned();

        // The readied service must handle this request; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.call(request).await?;
            Ok(match tag {
                Some(tag) => attach_tag(response, tag),
                None => response,
            })
        })
    }
}

/// Put `tag` on the response header block and on its trailers.
pub fn attach_tag(response: http::Response<BoxBody>, tag: HeaderValue) -> http::Response<BoxBody> {
    let (mut parts, body) = response.into_parts();
    parts
        .headers
        .insert(metadata_keys::ECHO_TAG_HEADER, tag.clone());

    if parts.headers.contains_key(GRPC_STATUS) {
        parts.headers.insert(metadata_keys::ECHO_TAG, tag);
        return http::Response::from_parts(parts, body);
    }

    let body = tonic::body::boxed(TrailerEchoBody::new(body, tag));
    http::Response::from_parts(parts, body)
}

/// Response body that adds `x-echo-tag` to the trailers frame
pub struct TrailerEchoBody {
    inner: BoxBody,
    tag: Option<HeaderValue>,
}

impl TrailerEchoBody {
    pub fn new(inner: BoxBody, tag: HeaderValue) -> Self {
        Self {
            inner,
            tag: Some(tag),
        }
    }
}

impl Body for TrailerEchoBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(mut frame))) => {
                if let Some(trailers) = frame.trailers_mut() {
                    if let Some(tag) = this.tag.take() {
                        trailers.insert(metadata_keys::ECHO_TAG, tag);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use std::collections::VecDeque;

    /// Body that replays a fixed list of frames
    struct Frames(VecDeque<Frame<Bytes>>);

    impl Body for Frames {
        type Data = Bytes;
        type Error = Status;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
            Poll::Ready(self.get_mut().0.pop_front().map(Ok))
        }
    }

    fn trailers(status: &'static str) -> HeaderMap {
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from_static(status));
        trailers
    }

    async fn next_frame(body: &mut BoxBody) -> Option<Frame<Bytes>> {
        std::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx))
            .await
            .map(|frame| frame.unwrap())
    }

    #[tokio::test]
    async fn test_tag_added_to_trailers_frame() {
        let body = Frames(VecDeque::from([
            Frame::data(Bytes::from_static(b"payload")),
            Frame::trailers(trailers("0")),
        ]));
        let response = http::Response::new(tonic::body::boxed(body));

        let response = attach_tag(response, HeaderValue::from_static("tag-7"));
        assert_eq!(
            response.headers().get(metadata_keys::ECHO_TAG_HEADER).unwrap(),
            "tag-7"
        );
        assert!(response.headers().get(metadata_keys::ECHO_TAG).is_none());

        let mut body = response.into_body();
        let data = next_frame(&mut body).await.unwrap();
        assert_eq!(data.into_data().unwrap(), Bytes::from_static(b"payload"));

        let trailers = next_frame(&mut body).await.unwrap().into_trailers().unwrap();
        assert_eq!(trailers.get(metadata_keys::ECHO_TAG).unwrap(), "tag-7");
        assert_eq!(trailers.get(GRPC_STATUS).unwrap(), "0");

        assert!(next_frame(&mut body).await.is_none());
    }

    #[tokio::test]
    async fn test_trailers_only_response_gets_tag_in_headers() {
        let mut response = http::Response::new(tonic::body::empty_body());
        response
            .headers_mut()
            .insert(GRPC_STATUS, HeaderValue::from_static("9"));

        let response = attach_tag(response, HeaderValue::from_static("tag-9"));
        assert_eq!(response.headers().get(metadata_keys::ECHO_TAG).unwrap(), "tag-9");
        assert_eq!(
            response.headers().get(metadata_keys::ECHO_TAG_HEADER).unwrap(),
            "tag-9"
        );
    }

    #[tokio::test]
    async fn test_data_frames_pass_through_untouched() {
        let body = Frames(VecDeque::from([
            Frame::data(Bytes::from_static(b"a")),
            Frame::data(Bytes::from_static(b"b")),
        ]));
        let mut body = tonic::body::boxed(TrailerEchoBody::new(
            tonic::body::boxed(body),
            HeaderValue::from_static("t"),
        ));

        assert!(next_frame(&mut body).await.unwrap().is_data());
        assert!(next_frame(&mut body).await.unwrap().is_data());
        assert!(next_frame(&mut body).await.is_none());
    }
}
