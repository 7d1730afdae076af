//! Wire-level message envelope.
//!
//! A [`Message`] is what leaves the process: a [`MessageHeader`] describing
//! where it goes and how often it has been handled, and an opaque
//! [`MessageBody`]. Requests become messages through a
//! [`MessageMapper`](crate::MessageMapper); the header id is always the
//! request id so a message can be traced back to the request that produced it.
//!
//! # Wire Shape
//!
//! ```text
//! {
//!   "id": "8c6f...", "topic": "greetings", "messageType": "MT_COMMAND",
//!   "timeStamp": "2024-01-01T00:00:00Z", "handledCount": 0,
//!   "bag": {}, "dataRef": null
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{MessageId, RequestId, RoutingKey};

/// Kind of message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "MT_COMMAND")]
    Command,
    #[serde(rename = "MT_EVENT")]
    Event,
    /// Placeholder for an empty or unreadable message.
    #[serde(rename = "MT_NONE")]
    None,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::None
    }
}

/// Routing and bookkeeping metadata of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Id of the request this message was mapped from.
    pub id: MessageId,
    /// Destination the message is published to.
    pub topic: RoutingKey,
    pub message_type: MessageType,
    pub time_stamp: DateTime<Utc>,
    /// How many times the message has been delivered to a handler.
    pub handled_count: u32,
    /// Ordered free-form metadata.
    #[serde(default)]
    pub bag: BTreeMap<String, serde_json::Value>,
    /// Claim-check pointer to an externally stored body.
    #[serde(default)]
    pub data_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl MessageHeader {
    /// Create a header stamped with the current time.
    pub fn new(id: MessageId, topic: impl Into<RoutingKey>, message_type: MessageType) -> Self {
        Self {
            id,
            topic: topic.into(),
            message_type,
            time_stamp: Utc::now(),
            handled_count: 0,
            bag: BTreeMap::new(),
            data_ref: None,
            correlation_id: None,
            reply_to: None,
            partition_key: None,
        }
    }

    pub fn with_correlation_id(mut self, id: RequestId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_data_ref(mut self, data_ref: impl Into<String>) -> Self {
        self.data_ref = Some(data_ref.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Add a bag entry, replacing any previous value under the same key.
    pub fn with_bag_item(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.bag.insert(key.into(), value);
        self
    }
}

/// Opaque message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl MessageBody {
    pub const JSON: &'static str = "application/json";

    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// A JSON body serialized from `value`.
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?, Self::JSON))
    }

    /// An empty body, used when the payload lives behind a claim check.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Self::JSON)
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A message ready to be stored in the outbox or handed to a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    pub fn id(&self) -> &MessageId {
        &self.header.id
    }

    pub fn topic(&self) -> &RoutingKey {
        &self.header.topic
    }

    /// Record one more delivery attempt to a handler.
    pub fn mark_handled(&mut self) {
        self.header.handled_count = self.header.handled_count.saturating_add(1);
    }

    /// True for placeholder messages that must never be dispatched.
    pub fn is_empty(&self) -> bool {
        self.header.message_type == MessageType::None
    }
}
