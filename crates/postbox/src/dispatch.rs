//! The command processor: the public entry point for dispatch and posting.
//!
//! # Overview
//!
//! ```text
//! send(request) ──► PipelineBuilder::build ──► exactly one chain ──► handle
//!                                          └─► 0 → NoHandler, >1 → AmbiguousHandler
//!
//! publish(event) ─► PipelineBuilder::build ──► every chain runs ──► failures collected
//!
//! post(request) ──► mediator.deposit ──► mediator.clear_outbox ──► checked report
//! ```
//!
//! # Example
//!
//! ```ignore
//! let processor = CommandProcessor::builder()
//!     .with_handler(GreetingHandler::default())
//!     .with_inbox_store(Arc::new(InMemoryInbox::default()))
//!     .with_mediator(mediator)
//!     .build();
//!
//! processor.send(GreetingCommand::new("world"))?;
//! processor.post(&GreetingMade::new("world"))?;
//! ```

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::InboxConfiguration;
use crate::core::{MessageId, Request};
use crate::error::{ConfigurationError, PostboxError, PublishFailure, Result};
use crate::inbox::{AsyncInboxStore, InboxStore};
use crate::mediator::{DispatchReport, OutboxProducerMediator};
use crate::outbox::{AsyncOutboxWriter, OutboxWriter};
use crate::pipeline::{
    AsyncHandler, AsyncRequestHandler, Handler, HandlerFactory, LinkParams, PipelineBuilder,
    RequestHandler, SubscriberRegistry,
};
use crate::policy::PolicyRegistry;

// =============================================================================
// Builder
// =============================================================================

/// Collects handlers, links and collaborators for a [`CommandProcessor`].
pub struct CommandProcessorBuilder {
    registry: SubscriberRegistry,
    factory: HandlerFactory,
    policies: Option<Arc<PolicyRegistry>>,
    inbox: Option<InboxConfiguration>,
    mediator: Option<Arc<OutboxProducerMediator>>,
}

impl CommandProcessorBuilder {
    pub fn new() -> Self {
        Self {
            registry: SubscriberRegistry::new(),
            factory: HandlerFactory::new(),
            policies: None,
            inbox: None,
            mediator: None,
        }
    }

    /// Register a blocking handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler of the same type is already registered for `R`.
    pub fn with_handler<R: Request, H: Handler<R>>(mut self, handler: H) -> Self {
        self.registry = self.registry.with_handler(handler);
        self
    }

    /// Register an async handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler of the same type is already registered for `R`.
    pub fn with_async_handler<R: Request, H: AsyncHandler<R>>(mut self, handler: H) -> Self {
        self.registry = self.registry.with_async_handler(handler);
        self
    }

    /// Register a blocking handler, failing on a duplicate registration.
    pub fn try_with_handler<R: Request, H: Handler<R>>(mut self, handler: H) -> Result<Self, ConfigurationError> {
        self.registry.register(handler)?;
        Ok(self)
    }

    /// Register an async handler, failing on a duplicate registration.
    pub fn try_with_async_handler<R: Request, H: AsyncHandler<R>>(
        mut self,
        handler: H,
    ) -> Result<Self, ConfigurationError> {
        self.registry.register_async(handler)?;
        Ok(self)
    }

    /// Store backing inbox nodes in both execution models.
    pub fn with_inbox_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: InboxStore + AsyncInboxStore + 'static,
    {
        self.factory = self
            .factory
            .with_inbox(store.clone())
            .with_async_inbox(store);
        self
    }

    /// Put an inbox node in front of every handler that does not declare one.
    pub fn with_inbox_configuration(mut self, configuration: InboxConfiguration) -> Self {
        self.inbox = Some(configuration);
        self
    }

    /// Named retry policies for `postbox.policy` links.
    pub fn with_policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn with_link<R, F>(mut self, link_type: impl Into<String>, constructor: F) -> Self
    where
        R: Request,
        F: Fn(LinkParams<'_>) -> Result<Arc<dyn RequestHandler<R>>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.factory = self.factory.with_link::<R, F>(link_type, constructor);
        self
    }

    pub fn with_async_link<R, F>(mut self, link_type: impl Into<String>, constructor: F) -> Self
    where
        R: Request,
        F: Fn(LinkParams<'_>) -> Result<Arc<dyn AsyncRequestHandler<R>>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.factory = self.factory.with_async_link::<R, F>(link_type, constructor);
        self
    }

    /// Called with the link type of every node released from the chain cache.
    pub fn on_release<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.factory = self.factory.on_release(hook);
        self
    }

    /// Outbound path used by the `deposit_*`, `clear_*` and `post*` operations.
    pub fn with_mediator(mut self, mediator: Arc<OutboxProducerMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    pub fn build(self) -> CommandProcessor {
        let factory = match self.policies {
            Some(policies) => self.factory.with_policies(policies),
            None => self.factory,
        };
        let mut pipelines = PipelineBuilder::new(Arc::new(self.registry), Arc::new(factory));
        if let Some(inbox) = self.inbox {
            pipelines = pipelines.with_global_inbox(inbox);
        }
        CommandProcessor {
            pipelines,
            mediator: self.mediator,
        }
    }
}

impl Default for CommandProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CommandProcessor
// =============================================================================

/// Routes requests to handler chains and messages to the outbox.
///
/// Clone the `Arc` around it to share one processor across tasks; concurrent
/// calls share only the chain cache.
pub struct CommandProcessor {
    pipelines: PipelineBuilder,
    mediator: Option<Arc<OutboxProducerMediator>>,
}

impl CommandProcessor {
    pub fn builder() -> CommandProcessorBuilder {
        CommandProcessorBuilder::new()
    }

    pub fn pipelines(&self) -> &PipelineBuilder {
        &self.pipelines
    }

    /// The outbound mediator, or [`ConfigurationError::NoOutbox`] if none was set.
    pub fn mediator(&self) -> Result<&Arc<OutboxProducerMediator>> {
        self.mediator
            .as_ref()
            .ok_or_else(|| ConfigurationError::NoOutbox { mode: "processor" }.into())
    }

    /// Drop every cached chain. Idempotent.
    pub fn clear_pipeline_cache(&self) {
        self.pipelines.clear_cache();
    }

    // -------------------------------------------------------------------------
    // Send / publish
    // -------------------------------------------------------------------------

    /// Run `request` through its single handler chain.
    pub fn send<R: Request>(&self, request: R) -> Result<R> {
        let pipelines = self.pipelines.build::<R>()?;
        let pipeline = match &pipelines[..] {
            [pipeline] => pipeline,
            other => return Err(cardinality::<R>(other.len())),
        };
        debug!(
            request_type = R::request_type(),
            request_id = %request.id(),
            handler = pipeline.handler_name(),
            "sending request"
        );
        pipeline.handle(request)
    }

    pub async fn send_async<R: Request>(&self, request: R) -> Result<R> {
        let pipelines = self.pipelines.build_async::<R>()?;
        let pipeline = match &pipelines[..] {
            [pipeline] => pipeline,
            other => return Err(cardinality::<R>(other.len())),
        };
        debug!(
            request_type = R::request_type(),
            request_id = %request.id(),
            handler = pipeline.handler_name(),
            "sending request"
        );
        pipeline.handle(request).await
    }

    /// Run `event` through every chain registered for its type.
    ///
    /// All chains run even when some fail; the failures are returned together
    /// as [`PostboxError::PublishFailed`]. No chains is a success.
    pub fn publish<R: Request>(&self, event: R) -> Result<()> {
        let pipelines = self.pipelines.build::<R>()?;
        debug!(
            request_type = R::request_type(),
            request_id = %event.id(),
            chains = pipelines.len(),
            "publishing event"
        );

        let mut failures = Vec::new();
        for pipeline in pipelines.iter() {
            if let Err(error) = pipeline.handle(event.clone()) {
                warn!(handler = pipeline.handler_name(), error = %error, "subscriber failed");
                failures.push(PublishFailure {
                    handler: pipeline.handler_name(),
                    error,
                });
            }
        }
        published(failures)
    }

    /// Async [`publish`](Self::publish); the chains run concurrently.
    pub async fn publish_async<R: Request>(&self, event: R) -> Result<()> {
        let pipelines = self.pipelines.build_async::<R>()?;
        debug!(
            request_type = R::request_type(),
            request_id = %event.id(),
            chains = pipelines.len(),
            "publishing event"
        );

        let outcomes = join_all(pipelines.iter().map(|pipeline| {
            let event = event.clone();
            async move { (pipeline.handler_name(), pipeline.handle(event).await) }
        }))
        .await;

        let failures = outcomes
            .into_iter()
            .filter_map(|(handler, outcome)| outcome.err().map(|error| (handler, error)))
            .map(|(handler, error)| {
                warn!(handler, error = %error, "subscriber failed");
                PublishFailure { handler, error }
            })
            .collect();
        published(failures)
    }

    // -------------------------------------------------------------------------
    // Outbox
    // -------------------------------------------------------------------------

    /// Store `request` in the outbox without sending it.
    pub fn deposit_post<R: Request>(&self, request: &R) -> Result<MessageId> {
        self.mediator()?.deposit(request)
    }

    pub async fn deposit_post_async<R: Request>(&self, request: &R) -> Result<MessageId> {
        self.mediator()?.deposit_async(request).await
    }

    /// Write `request` through the caller's transaction.
    ///
    /// The message becomes visible to `clear_outbox` and the sweeper only once
    /// the caller commits.
    pub fn deposit_post_with<R: Request>(
        &self,
        request: &R,
        writer: &mut dyn OutboxWriter,
    ) -> Result<MessageId> {
        self.mediator()?.deposit_with(request, writer)
    }

    pub async fn deposit_post_with_async<R: Request>(
        &self,
        request: &R,
        writer: &mut dyn AsyncOutboxWriter,
    ) -> Result<MessageId> {
        self.mediator()?.deposit_with_async(request, writer).await
    }

    /// Deposit a batch, stopping at the first failure.
    pub fn deposit_posts<R: Request>(&self, requests: &[R]) -> Result<Vec<MessageId>> {
        let mediator = self.mediator()?;
        requests.iter().map(|r| mediator.deposit(r)).collect()
    }

    pub async fn deposit_posts_async<R: Request>(&self, requests: &[R]) -> Result<Vec<MessageId>> {
        let mediator = self.mediator()?;
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(mediator.deposit_async(request).await?);
        }
        Ok(ids)
    }

    /// Dispatch deposited messages. Delivery failures are in the report.
    pub fn clear_outbox(&self, ids: &[MessageId]) -> Result<DispatchReport> {
        self.mediator()?.clear_outbox(ids)
    }

    pub async fn clear_outbox_async(&self, ids: &[MessageId]) -> Result<DispatchReport> {
        self.mediator()?.clear_outbox_async(ids).await
    }

    /// Deposit and dispatch at once. Fails with [`PostboxError::DeliveryFailed`]
    /// if retries are exhausted; the message stays in the outbox either way.
    pub fn post<R: Request>(&self, request: &R) -> Result<MessageId> {
        let mediator = self.mediator()?;
        let id = mediator.deposit(request)?;
        mediator.clear_outbox(std::slice::from_ref(&id))?.into_result()?;
        Ok(id)
    }

    pub async fn post_async<R: Request>(&self, request: &R) -> Result<MessageId> {
        let mediator = self.mediator()?;
        let id = mediator.deposit_async(request).await?;
        mediator
            .clear_outbox_async(std::slice::from_ref(&id))
            .await?
            .into_result()?;
        Ok(id)
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("pipelines", &self.pipelines)
            .field("mediator", &self.mediator.is_some())
            .finish()
    }
}

fn cardinality<R: Request>(count: usize) -> PostboxError {
    let request_type = R::request_type();
    if count == 0 {
        PostboxError::NoHandler { request_type }
    } else {
        PostboxError::AmbiguousHandler {
            request_type,
            count,
        }
    }
}

fn published(failures: Vec<PublishFailure>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PostboxError::PublishFailed { failures })
    }
}
