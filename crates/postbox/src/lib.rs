//! # Postbox
//!
//! In-process command dispatch through declarative handler pipelines, with a
//! transactional outbox for outbound messages and an idempotent inbox for
//! inbound ones.
//!
//! ## Core Concepts
//!
//! - A [`Request`] is a command or event with a stable [`RequestId`].
//! - A [`Handler`] (or [`AsyncHandler`]) holds the application logic for one
//!   request type and declares the links around it as
//!   [`DecoratorDescriptor`]s.
//! - The [`PipelineBuilder`] turns those descriptors into an immutable chain:
//!   Before links in ascending step, the handler, then After links in
//!   ascending step.
//! - The [`CommandProcessor`] sends a request to exactly one chain, or
//!   publishes an event to every chain.
//! - The [`OutboxProducerMediator`] deposits outbound messages in the same
//!   transaction as the caller's state change and dispatches them later,
//!   guarded by a retry policy and a per-topic [`OutboxCircuitBreaker`].
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ send / publish
//!   ▼
//! CommandProcessor ──► PipelineBuilder (cached per request type)
//!   │                        │
//!   │                        ▼
//!   │      [Logging] → [UseInbox] → Handler → [After links]
//!   │                      │
//!   │                      ▼
//!   │                  InboxStore (seen ids per context)
//!   │
//!   │ deposit_post / post
//!   ▼
//! OutboxProducerMediator ──► OutboxStore ◄── OutboxSweeper (periodic)
//!   │
//!   ▼ clear_outbox
//! circuit breaker ──► retry policy ──► MessageProducer ──► transport
//!   │
//!   └─► mark_dispatched_if_pending (exactly once per entry)
//! ```
//!
//! ## Guarantees
//!
//! - **Exactly-once admission**: with a once-only inbox link, a request id is
//!   handled at most once per context until its inbox entry expires.
//! - **At-least-once publish**: a deposited message stays outstanding until a
//!   producer accepted it; a send that succeeds just before a crash may be
//!   repeated.
//! - **Isolation**: a tripped topic never blocks sends to other topics.
//!
//! Concrete stores live in `postbox-persistence`, the sweepers in
//! `postbox-outbox`.
//!
//! ## Example
//!
//! ```ignore
//! use postbox_core::{
//!     request, CommandProcessor, DecoratorDescriptor, Handler, HandlerTiming, OnceOnlyAction,
//!     RequestId,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct GreetingCommand {
//!     id: RequestId,
//!     name: String,
//! }
//! request!(GreetingCommand);
//!
//! struct GreetingHandler;
//!
//! impl Handler<GreetingCommand> for GreetingHandler {
//!     fn handle(&self, command: GreetingCommand) -> anyhow::Result<GreetingCommand> {
//!         tracing::info!(name = %command.name, "hello");
//!         Ok(command)
//!     }
//!
//!     fn decorators(&self) -> Vec<DecoratorDescriptor> {
//!         vec![
//!             DecoratorDescriptor::logging(0, HandlerTiming::Before),
//!             DecoratorDescriptor::use_inbox(1, "greetings", true, OnceOnlyAction::Throw),
//!         ]
//!     }
//! }
//!
//! let processor = CommandProcessor::builder()
//!     .with_handler(GreetingHandler)
//!     .with_inbox_store(inbox)
//!     .build();
//!
//! processor.send(GreetingCommand { id: RequestId::new(), name: "world".into() })?;
//! ```

// Core modules
mod circuit_breaker;
mod config;
mod core;
mod dispatch;
mod error;
mod inbox;
mod mapper;
mod mediator;
mod message;
mod outbox;
mod policy;
mod producer;
mod request_macro;
mod task;

// Chain construction and built-in links
pub mod handlers;
pub mod pipeline;

// Re-export core types
pub use crate::core::{MessageId, Request, RequestId, RoutingKey};

// Re-export error types
pub use crate::error::{ConfigurationError, ErrorKind, PostboxError, PublishFailure, Result};

// Re-export configuration
pub use config::{
    CircuitBreakerConfig, ContextKeyStrategy, InboxConfiguration, InboxSweepConfig, OutboxConfig,
    SweeperConfig,
};

// Re-export message types
pub use message::{Message, MessageBody, MessageHeader, MessageType};

// Re-export pipeline types
pub use pipeline::{
    link_types, AsyncHandler, AsyncNext, AsyncPipeline, AsyncRequestHandler, DecoratorDescriptor,
    Handler, HandlerFactory, HandlerTiming, LinkParams, Next, Pipeline, PipelineBuilder,
    RequestHandler, SubscriberRegistry,
};

// Re-export dispatcher types
pub use dispatch::{CommandProcessor, CommandProcessorBuilder};

// Re-export inbox types
pub use inbox::{AsyncInbox, AsyncInboxStore, Inbox, InboxEntry, InboxKey, InboxStore, OnceOnlyAction};

// Re-export outbox types
pub use circuit_breaker::{BreakerState, CircuitState, OutboxCircuitBreaker};
pub use mapper::{JsonMessageMapper, MapperRegistry, MessageMapper, Publication};
pub use mediator::{DispatchError, DispatchReport, OutboxProducerMediator};
pub use outbox::{AsyncOutboxStore, AsyncOutboxWriter, OutboxEntry, OutboxStore, OutboxWriter};
pub use producer::{MessageProducer, ProducerRegistry};

// Re-export policy types
pub use policy::{PolicyRegistry, RetryPolicy, DEFAULT_RETRY_POLICY};

// Re-export background task types
pub use task::{spawn_periodic, TaskHandle, MIN_INTERVAL};

// Re-export commonly used external types
pub use async_trait::async_trait;
