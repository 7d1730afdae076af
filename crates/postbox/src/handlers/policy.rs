//! Retry decorator backed by the policy registry.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::core::Request;
use crate::error::{ConfigurationError, ErrorKind, PostboxError, Result};
use crate::pipeline::{AsyncNext, AsyncRequestHandler, LinkParams, Next, RequestHandler};
use crate::policy::PolicyRegistry;

/// Re-runs the rest of the chain under a named retry policy. Params: `[policy_name]`.
///
/// The name is resolved on every request, so an unknown policy surfaces as a
/// configuration error when the node runs.
pub struct UsePolicy<R> {
    policy: String,
    policies: Arc<PolicyRegistry>,
    _request: PhantomData<fn(R) -> R>,
}

impl<R: Request> UsePolicy<R> {
    pub fn new(policy: impl Into<String>, policies: Arc<PolicyRegistry>) -> Self {
        Self {
            policy: policy.into(),
            policies,
            _request: PhantomData,
        }
    }

    pub fn from_params(
        params: LinkParams<'_>,
        policies: Arc<PolicyRegistry>,
    ) -> Result<Self, ConfigurationError> {
        let policy: String = params.get(0, "policy_name")?;
        Ok(Self::new(policy, policies))
    }
}

// Duplicates, wiring mistakes and cardinality errors fail the same way every time.
fn is_transient(error: &PostboxError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Handler | ErrorKind::Store | ErrorKind::Timeout
    )
}

impl<R: Request> RequestHandler<R> for UsePolicy<R> {
    fn name(&self) -> &str {
        "UsePolicy"
    }

    fn handle(&self, request: R, next: Next<'_, R>) -> Result<R> {
        let policy = self.policies.get(&self.policy)?;
        policy.execute(
            |attempt| {
                debug!(request_id = %request.id(), policy = %self.policy, attempt, "running chain under policy");
                next.run(request.clone())
            },
            is_transient,
        )
    }
}

#[async_trait]
impl<R: Request> AsyncRequestHandler<R> for UsePolicy<R> {
    fn name(&self) -> &str {
        "UsePolicy"
    }

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R> {
        let policy = self.policies.get(&self.policy)?;
        policy
            .execute_async(
                |attempt| {
                    debug!(request_id = %request.id(), policy = %self.policy, attempt, "running chain under policy");
                    next.run(request.clone())
                },
                is_transient,
            )
            .await
    }
}
