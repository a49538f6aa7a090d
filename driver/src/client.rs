//! Conformance client for the TestService

use crate::error::CheckError;
use conformance_core::{CallContext, CancelHandle, Directives, TestServiceClient};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

/// Client that issues directive-tagged calls against a TestService
#[derive(Debug, Clone)]
pub struct ConformanceClient {
    client: TestServiceClient<Channel>,
    tag_prefix: String,
    call_timeout: Duration,
}

impl ConformanceClient {
    /// Connect to the service at the given URI
    pub async fn connect(
        target: &str,
        connect_timeout: Duration,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(target.to_string())?
            .connect_timeout(connect_timeout)
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    /// Wrap an existing channel
    pub fn new(channel: Channel) -> Self {
        Self {
            client: TestServiceClient::new(channel),
            tag_prefix: "rust".to_string(),
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = prefix.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// A fresh, unique echo tag
    pub fn echo_tag(&self) -> String {
        format!("{}-{}", self.tag_prefix, uuid::Uuid::new_v4())
    }

    /// A context with the default per-call time budget
    pub fn call_context(&self) -> (CallContext, CancelHandle) {
        CallContext::with_timeout(self.call_timeout)
    }

    /// A handle for issuing one call. Clones share the channel.
    pub fn stub(&self) -> TestServiceClient<Channel> {
        self.client.clone()
    }

    /// Build a request carrying `directives` and the context's time budget.
    pub fn request<T>(
        &self,
        message: T,
        directives: &Directives,
        ctx: &CallContext,
    ) -> Result<Request<T>, CheckError> {
        let mut request = Request::new(message);
        directives.apply(request.metadata_mut())?;
        ctx.propagate(&mut request);
        Ok(request)
    }
}
