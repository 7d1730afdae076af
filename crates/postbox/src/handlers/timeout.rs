//! Timeout decorator, async pipelines only.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::core::Request;
use crate::error::{ConfigurationError, PostboxError, Result};
use crate::pipeline::{AsyncNext, AsyncRequestHandler, LinkParams};

/// Bounds the rest of the chain. Params: `[millis]`.
///
/// When the limit passes, the inner future is dropped at its current await
/// point and the chain fails with [`PostboxError::Timeout`].
pub struct TimeoutLink<R> {
    limit: Duration,
    _request: PhantomData<fn(R) -> R>,
}

impl<R: Request> TimeoutLink<R> {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            _request: PhantomData,
        }
    }

    pub fn from_params(params: LinkParams<'_>) -> Result<Self, ConfigurationError> {
        let millis: u64 = params.get(0, "millis")?;
        if millis == 0 {
            return Err(params.invalid("timeout must be greater than zero"));
        }
        Ok(Self::new(Duration::from_millis(millis)))
    }
}

#[async_trait]
impl<R: Request> AsyncRequestHandler<R> for TimeoutLink<R> {
    fn name(&self) -> &str {
        "Timeout"
    }

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R> {
        let request_id = request.id().clone();
        match tokio::time::timeout(self.limit, next.run(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    request_type = R::request_type(),
                    %request_id,
                    limit = ?self.limit,
                    "request timed out"
                );
                Err(PostboxError::Timeout {
                    duration: self.limit,
                })
            }
        }
    }
}
