//! Producers that record or fail on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use postbox_core::{Message, MessageId, MessageProducer, RoutingKey};

/// Accepts every message and keeps a copy.
#[derive(Debug, Default)]
pub struct RecordingProducer {
    sent: Mutex<Vec<Message>>,
}

impl RecordingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.sent().iter().map(|m| m.id().clone()).collect()
    }

    /// How many times `id` was sent.
    pub fn times_sent(&self, id: &MessageId) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.id() == id)
            .count()
    }

    pub fn sent_to(&self, topic: &RoutingKey) -> Vec<Message> {
        self.sent().into_iter().filter(|m| m.topic() == topic).collect()
    }
}

impl MessageProducer for RecordingProducer {
    fn send(&self, message: &Message) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

/// Fails or succeeds according to a script.
///
/// Each send pops the next scripted outcome; once the script runs out every
/// send gets the fallback outcome.
///
/// # Example
///
/// ```ignore
/// // Two transient failures, then deliveries succeed.
/// let producer = Arc::new(FailingProducer::failing_first(2));
/// ```
#[derive(Debug)]
pub struct FailingProducer {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    attempts: AtomicUsize,
    delivered: RecordingProducer,
}

impl FailingProducer {
    /// Every send fails.
    pub fn always() -> Self {
        Self::scripted(Vec::new(), false)
    }

    /// The first `n` sends fail, the rest succeed.
    pub fn failing_first(n: usize) -> Self {
        Self::scripted(vec![false; n], true)
    }

    /// `true` succeeds, `false` fails, then `fallback` for the rest.
    pub fn scripted(outcomes: Vec<bool>, fallback: bool) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback,
            attempts: AtomicUsize::new(0),
            delivered: RecordingProducer::new(),
        }
    }

    /// Sends attempted, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages that were accepted.
    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.sent()
    }

    fn next_outcome(&self) -> bool {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

impl MessageProducer for FailingProducer {
    fn send(&self, message: &Message) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.next_outcome() {
            self.delivered.send(message)
        } else {
            anyhow::bail!("broker unreachable (attempt {attempt} for {})", message.id())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postbox_core::{MessageBody, MessageHeader, MessageType};

    fn message(id: &str) -> Message {
        Message::new(
            MessageHeader::new(MessageId::from(id), "orders", MessageType::Event),
            MessageBody::empty(),
        )
    }

    #[test]
    fn test_recording_producer_counts_per_id() {
        let producer = RecordingProducer::new();
        producer.send(&message("a")).unwrap();
        producer.send(&message("a")).unwrap();
        producer.send(&message("b")).unwrap();

        assert_eq!(producer.count(), 3);
        assert_eq!(producer.times_sent(&MessageId::from("a")), 2);
        assert_eq!(producer.sent_to(&RoutingKey::from("orders")).len(), 3);
    }

    #[test]
    fn test_failing_producer_follows_script() {
        let producer = FailingProducer::failing_first(2);
        assert!(producer.send(&message("a")).is_err());
        assert!(producer.send(&message("a")).is_err());
        assert!(producer.send(&message("a")).is_ok());
        assert_eq!(producer.attempts(), 3);
        assert_eq!(producer.delivered().len(), 1);

        let down = FailingProducer::always();
        assert!(down.send(&message("b")).is_err());
        assert!(down.delivered().is_empty());
    }
}
