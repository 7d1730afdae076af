//! Logging decorator.

use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::info;

use crate::core::Request;
use crate::error::{ConfigurationError, Result};
use crate::pipeline::{
    AsyncNext, AsyncRequestHandler, HandlerTiming, LinkParams, Next, RequestHandler,
};

/// Logs the request as JSON, then forwards it. Params: `[timing]`.
pub struct RequestLogging<R> {
    timing: HandlerTiming,
    _request: PhantomData<fn(R) -> R>,
}

impl<R: Request> RequestLogging<R> {
    pub fn new(timing: HandlerTiming) -> Self {
        Self {
            timing,
            _request: PhantomData,
        }
    }

    pub fn from_params(params: LinkParams<'_>) -> Result<Self, ConfigurationError> {
        let timing = params
            .optional(0, "timing")?
            .unwrap_or(HandlerTiming::Before);
        Ok(Self::new(timing))
    }

    fn log(&self, request: &R) {
        let body = serde_json::to_string(request).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        info!(
            request_type = R::request_type(),
            request_id = %request.id(),
            timing = ?self.timing,
            request = %body,
            "logging request"
        );
    }
}

impl<R: Request> RequestHandler<R> for RequestLogging<R> {
    fn name(&self) -> &str {
        "Logging"
    }

    fn handle(&self, request: R, next: Next<'_, R>) -> Result<R> {
        self.log(&request);
        next.run(request)
    }
}

#[async_trait]
impl<R: Request> AsyncRequestHandler<R> for RequestLogging<R> {
    fn name(&self) -> &str {
        "Logging"
    }

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R> {
        self.log(&request);
        next.run(request).await
    }
}
