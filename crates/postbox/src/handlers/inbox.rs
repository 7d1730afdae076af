//! Inbox decorator: once-only handling per context.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::Request;
use crate::error::{ConfigurationError, PostboxError, Result};
use crate::inbox::{AsyncInbox, Inbox, OnceOnlyAction};
use crate::pipeline::{AsyncNext, AsyncRequestHandler, LinkParams, Next, RequestHandler};

/// Parameters of a `postbox.inbox` link:
/// `[once_only, context_key, action, expire_after_ms?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxLinkConfig {
    pub once_only: bool,
    pub context_key: String,
    pub action: OnceOnlyAction,
    pub expire_after: Option<Duration>,
}

impl InboxLinkConfig {
    pub fn from_params(params: LinkParams<'_>) -> Result<Self, ConfigurationError> {
        let context_key: String = params.get(1, "context_key")?;
        if context_key.is_empty() {
            return Err(params.invalid("context_key must not be empty"));
        }
        Ok(Self {
            once_only: params.get(0, "once_only")?,
            context_key,
            action: params.get(2, "action")?,
            expire_after: params
                .optional::<u64>(3, "expire_after_ms")?
                .map(Duration::from_millis),
        })
    }
}

/// Blocking inbox node.
///
/// Records the request after the rest of the chain succeeds. With `once_only`,
/// a request already recorded under the same context is rejected
/// ([`OnceOnlyAction::Throw`]) or returned untouched ([`OnceOnlyAction::Warn`]).
pub struct UseInbox<R> {
    inbox: Inbox,
    config: InboxLinkConfig,
    _request: PhantomData<fn(R) -> R>,
}

impl<R: Request> UseInbox<R> {
    pub fn new(inbox: Inbox, config: InboxLinkConfig) -> Self {
        Self {
            inbox,
            config,
            _request: PhantomData,
        }
    }
}

impl<R: Request> RequestHandler<R> for UseInbox<R> {
    fn name(&self) -> &str {
        "UseInbox"
    }

    fn handle(&self, request: R, next: Next<'_, R>) -> Result<R> {
        let context_key = self.config.context_key.as_str();
        if self.config.once_only && self.inbox.exists(request.id(), context_key)? {
            return on_duplicate(request, &self.config);
        }

        let handled = next.run(request)?;
        self.inbox.add(&handled, context_key, self.config.expire_after)?;
        Ok(handled)
    }
}

/// Async inbox node.
pub struct UseInboxAsync<R> {
    inbox: AsyncInbox,
    config: InboxLinkConfig,
    _request: PhantomData<fn(R) -> R>,
}

impl<R: Request> UseInboxAsync<R> {
    pub fn new(inbox: AsyncInbox, config: InboxLinkConfig) -> Self {
        Self {
            inbox,
            config,
            _request: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Request> AsyncRequestHandler<R> for UseInboxAsync<R> {
    fn name(&self) -> &str {
        "UseInbox"
    }

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R> {
        let context_key = self.config.context_key.as_str();
        if self.config.once_only && self.inbox.exists(request.id(), context_key).await? {
            return on_duplicate(request, &self.config);
        }

        let handled = next.run(request).await?;
        self.inbox
            .add(&handled, context_key, self.config.expire_after)
            .await?;
        Ok(handled)
    }
}

fn on_duplicate<R: Request>(request: R, config: &InboxLinkConfig) -> Result<R> {
    match config.action {
        OnceOnlyAction::Throw => {
            debug!(
                request_type = R::request_type(),
                request_id = %request.id(),
                context_key = %config.context_key,
                "rejecting duplicate request"
            );
            Err(PostboxError::Duplicate {
                id: request.id().clone(),
                context_key: config.context_key.clone(),
            })
        }
        OnceOnlyAction::Warn => {
            warn!(
                request_type = R::request_type(),
                request_id = %request.id(),
                context_key = %config.context_key,
                "request already handled, skipping"
            );
            Ok(request)
        }
    }
}
