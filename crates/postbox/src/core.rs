//! Core traits and identifiers for postbox.
//!
//! # Overview
//!
//! A [`Request`] is anything that can be routed through a handler pipeline:
//! commands (intent, exactly one handler) and events (facts, any number of
//! handlers). Requests carry a stable [`RequestId`] which becomes the message id
//! when the request is posted through the outbox, and the inbox key when it is
//! received.
//!
//! Requests are serializable because the inbox records them and the default
//! message mapper writes them as JSON bodies.

use std::borrow::Borrow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a request, and of the message it is posted as.
///
/// Identifiers are opaque strings. [`RequestId::new`] generates a fresh one
/// from a v4 UUID; any string (e.g. an upstream message id) can be adopted
/// with `From`.
///
/// # Example
///
/// ```ignore
/// use postbox_core::RequestId;
///
/// let generated = RequestId::new();
/// let adopted = RequestId::from("c1");
/// assert_eq!(adopted.as_str(), "c1");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the identifier, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<Uuid> for RequestId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Messages are keyed by the id of the request they were mapped from.
pub type MessageId = RequestId;

/// Destination identifier (topic / routing key) of an outbound message.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingKey({})", self.0)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RoutingKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for RoutingKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An application command or event that can be routed through a pipeline.
///
/// Implement it by hand, or with the [`request!`](crate::request) macro for
/// structs that keep their identifier in an `id: RequestId` field.
///
/// # Example
///
/// ```ignore
/// use postbox_core::{Request, RequestId};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct GreetingCommand {
///     id: RequestId,
///     name: String,
/// }
///
/// impl Request for GreetingCommand {
///     fn id(&self) -> &RequestId {
///         &self.id
///     }
/// }
/// ```
pub trait Request: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique identity of this request. Must not change during handling.
    fn id(&self) -> &RequestId;

    /// Human-readable type name used in logs and errors.
    fn request_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Strip the module path from a type name for compact diagnostics.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let without_generics = full.split('<').next().unwrap_or(full);
    match without_generics.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}
