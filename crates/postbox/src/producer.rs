//! Transport producers, looked up by topic.
//!
//! Concrete transports live outside this crate. A producer only has to report
//! success or failure; retries and circuit breaking are handled by the
//! [`OutboxProducerMediator`](crate::OutboxProducerMediator).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::RoutingKey;
use crate::error::ConfigurationError;
use crate::message::Message;

/// Sends messages to a broker or any other destination.
///
/// Blocking transports implement [`send`](Self::send) only; the async variant
/// falls back to it. Non-blocking transports should override both.
///
/// # Example
///
/// ```ignore
/// struct StdoutProducer;
///
/// impl MessageProducer for StdoutProducer {
///     fn send(&self, message: &Message) -> anyhow::Result<()> {
///         println!("{} -> {}", message.id(), message.topic());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn send(&self, message: &Message) -> anyhow::Result<()>;

    async fn send_async(&self, message: &Message) -> anyhow::Result<()> {
        self.send(message)
    }
}

/// Producers by topic.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: HashMap<RoutingKey, Arc<dyn MessageProducer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_producer(
        mut self,
        topic: impl Into<RoutingKey>,
        producer: Arc<dyn MessageProducer>,
    ) -> Self {
        self.producers.insert(topic.into(), producer);
        self
    }

    /// The producer for `topic`, or [`ConfigurationError::MissingProducer`].
    pub fn lookup_by(&self, topic: &RoutingKey) -> Result<Arc<dyn MessageProducer>, ConfigurationError> {
        self.producers
            .get(topic)
            .cloned()
            .ok_or_else(|| ConfigurationError::MissingProducer {
                topic: topic.clone(),
            })
    }

    pub fn topics(&self) -> impl Iterator<Item = &RoutingKey> {
        self.producers.keys()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("topics", &self.producers.keys().collect::<Vec<_>>())
            .finish()
    }
}
