//! Structured error types for postbox.
//!
//! `PostboxError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Collaborators (handlers, stores, producers) return
//! `anyhow::Result` because it is ergonomic to write; the core wraps those
//! failures at the boundary so callers always see a `PostboxError`.
//!
//! # The Error Taxonomy
//!
//! | kind | raised when | retried? |
//! |---|---|---|
//! | Configuration | unregistered link type, unknown policy, missing mapper/producer | never |
//! | Cardinality | `send` finds zero or several handlers | never |
//! | Duplicate | an inbox node in `Throw` mode sees a known request | never |
//! | Delivery | a producer keeps failing after the retry policy is exhausted | by the sweeper |
//! | NotFound | an inbox or outbox lookup misses | never |
//!
//! # Example
//!
//! ```ignore
//! use postbox_core::{ErrorKind, PostboxError};
//!
//! match processor.send(cmd) {
//!     Ok(_) => {}
//!     Err(PostboxError::Duplicate { id, .. }) => tracing::warn!(%id, "already handled"),
//!     Err(e) if e.kind() == ErrorKind::Configuration => panic!("miswired: {e}"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::{RequestId, RoutingKey};

// =============================================================================
// Configuration Error
// =============================================================================

/// A wiring mistake. Raised at build or dispatch time, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A decorator descriptor names a link type nobody registered.
    #[error("no link registered for link type {link_type} on request {request_type}")]
    UnknownLinkType {
        link_type: String,
        request_type: &'static str,
    },

    /// A link type exists, but not for this execution model.
    #[error("link type {link_type} cannot run in a {mode} pipeline")]
    UnsupportedLink {
        link_type: String,
        mode: &'static str,
    },

    /// A descriptor's initializer parameters could not be read by its link.
    #[error("invalid parameters for link type {link_type}: {reason}")]
    InvalidLinkParams { link_type: String, reason: String },

    /// A named retry policy was looked up but never registered.
    #[error("no policy registered under the name {name}")]
    UnknownPolicy { name: String },

    /// A request type was posted without a registered message mapper.
    #[error("no message mapper registered for request type {request_type}")]
    MissingMapper { request_type: &'static str },

    /// A message was dispatched to a topic without a registered producer.
    #[error("no producer registered for topic {topic}")]
    MissingProducer { topic: RoutingKey },

    /// An inbox link was built, but no inbox store of the right kind is configured.
    #[error("no {mode} inbox configured")]
    NoInbox { mode: &'static str },

    /// An outbox operation was called, but no outbox store of the right kind is configured.
    #[error("no {mode} outbox configured")]
    NoOutbox { mode: &'static str },

    /// A handler of the same type is already registered for the request type.
    #[error("handler {handler} already registered for request type {request_type}")]
    HandlerAlreadyRegistered {
        handler: &'static str,
        request_type: &'static str,
    },
}

// =============================================================================
// Postbox Error
// =============================================================================

/// Error returned by every postbox operation.
#[derive(Debug, Error)]
pub enum PostboxError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// `send` found no handler for the request type.
    #[error("no handler registered for {request_type}")]
    NoHandler { request_type: &'static str },

    /// `send` found more than one handler; commands need exactly one.
    #[error("ambiguous handler: {count} handlers registered for {request_type}, a command must have exactly one")]
    AmbiguousHandler {
        request_type: &'static str,
        count: usize,
    },

    /// The inbox has already seen this request under this context.
    #[error("request {id} has already been processed in context {context_key}")]
    Duplicate { id: RequestId, context_key: String },

    #[error("request {id} not found in inbox context {context_key}")]
    RequestNotFound { id: RequestId, context_key: String },

    #[error("message {id} not found in the outbox")]
    MessageNotFound { id: RequestId },

    /// One or more messages stayed outstanding after the retry policy gave up.
    #[error("delivery failed for {} message(s); they remain outstanding in the outbox", .ids.len())]
    DeliveryFailed { ids: Vec<RequestId> },

    #[error("the outbox limit of {limit} outstanding messages has been reached")]
    OutboxLimitReached { limit: usize },

    #[error("pipeline timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// One or more chains failed during `publish`. Every chain was run.
    #[error("failed to publish to {} handler(s): {}", .failures.len(), PublishFailures(.failures))]
    PublishFailed { failures: Vec<PublishFailure> },

    /// A user handler returned an error.
    #[error(transparent)]
    Handler(anyhow::Error),

    /// An inbox or outbox store returned an error.
    #[error("store error: {0}")]
    Store(anyhow::Error),

    /// A message mapper could not turn a request into a message or back.
    #[error("message mapping failed: {0}")]
    Mapping(anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One failed chain of a `publish` call.
#[derive(Debug)]
pub struct PublishFailure {
    /// Name of the core handler at the centre of the failed chain.
    pub handler: &'static str,
    pub error: PostboxError,
}

struct PublishFailures<'a>(&'a [PublishFailure]);

impl fmt::Display for PublishFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.handler, failure.error)?;
        }
        Ok(())
    }
}

/// Coarse classification of a [`PostboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Cardinality,
    Duplicate,
    Delivery,
    NotFound,
    Timeout,
    Handler,
    Store,
}

impl PostboxError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PostboxError::Configuration(_) => ErrorKind::Configuration,
            PostboxError::NoHandler { .. } | PostboxError::AmbiguousHandler { .. } => {
                ErrorKind::Cardinality
            }
            PostboxError::Duplicate { .. } => ErrorKind::Duplicate,
            PostboxError::DeliveryFailed { .. } | PostboxError::OutboxLimitReached { .. } => {
                ErrorKind::Delivery
            }
            PostboxError::RequestNotFound { .. } | PostboxError::MessageNotFound { .. } => {
                ErrorKind::NotFound
            }
            PostboxError::Timeout { .. } => ErrorKind::Timeout,
            PostboxError::Handler(_) | PostboxError::PublishFailed { .. } => ErrorKind::Handler,
            PostboxError::Store(_)
            | PostboxError::Mapping(_)
            | PostboxError::Serialization(_) => ErrorKind::Store,
        }
    }

    /// Wrap a handler failure, recovering a `PostboxError` that was carried
    /// inside the `anyhow::Error` (e.g. by a handler that sends another command).
    pub fn from_handler(error: anyhow::Error) -> Self {
        match error.downcast::<PostboxError>() {
            Ok(inner) => inner,
            Err(other) => PostboxError::Handler(other),
        }
    }

    /// Wrap a store failure.
    pub fn store(error: anyhow::Error) -> Self {
        match error.downcast::<PostboxError>() {
            Ok(inner) => inner,
            Err(other) => PostboxError::Store(other),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = PostboxError> = std::result::Result<T, E>;
