//! Transactional outbox storage interfaces.
//!
//! The outbox pattern keeps an outbound message in the same store, and ideally
//! the same transaction, as the business change that produced it. Delivery
//! happens later, from the outbox, so a crash or an unreachable broker never
//! loses a message: it stays outstanding until someone dispatches it.
//!
//! # Overview
//!
//! 1. A handler deposits a message (`deposit_post`), possibly through an
//!    [`OutboxWriter`] bound to its own transaction
//! 2. `clear_outbox` sends it through the producer for its topic
//! 3. On success the entry is marked dispatched, exactly once
//! 4. Anything left outstanding is re-driven by the outbox sweeper
//!
//! # Guarantees
//!
//! - **At-least-once delivery**: a send that succeeds just before a crash is
//!   sent again by the sweeper
//! - **Single dispatched transition**: [`OutboxStore::mark_dispatched_if_pending`]
//!   only succeeds for the first caller, so racing clears and sweeps count a
//!   delivery once
//! - **Nothing is dropped**: failed messages remain queryable until dispatched
//!
//! # Example
//!
//! ```ignore
//! use postbox_core::{OutboxEntry, OutboxWriter};
//!
//! struct PgOutboxWriter<'a> {
//!     tx: &'a mut Transaction,
//! }
//!
//! impl OutboxWriter for PgOutboxWriter<'_> {
//!     fn write(&mut self, entry: OutboxEntry) -> anyhow::Result<()> {
//!         self.tx.execute(
//!             "INSERT INTO outbox (message_id, topic, body, created_at) VALUES ($1, $2, $3, $4)",
//!             &[&entry.message_id.as_str(), &entry.message.topic().as_str(), &entry.message.body.bytes, &entry.created_at],
//!         )?;
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{MessageId, RoutingKey};
use crate::message::Message;

// =============================================================================
// OutboxEntry
// =============================================================================

/// A message persisted in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub message: Message,
    pub created_at: DateTime<Utc>,
    /// When the message was delivered. `None` while outstanding.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A fresh, outstanding entry keyed by the message id.
    pub fn new(message: Message) -> Self {
        Self::created_at(message, Utc::now())
    }

    /// An outstanding entry with an explicit creation time.
    pub fn created_at(message: Message, created_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message.id().clone(),
            message,
            created_at,
            dispatched_at: None,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

// =============================================================================
// Store traits
// =============================================================================

/// Blocking outbox storage.
pub trait OutboxStore: Send + Sync {
    /// Persist a new entry. Adding an id that already exists must not
    /// overwrite the stored entry.
    fn add(&self, entry: OutboxEntry) -> Result<()>;

    fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>>;

    /// Undispatched entries created before `created_before`, oldest first.
    /// Entries whose topic is in `exclude_topics` are left out before `limit`
    /// is applied.
    fn get_outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        exclude_topics: &[RoutingKey],
    ) -> Result<Vec<OutboxEntry>>;

    /// Set `dispatched_at` only if it is still unset.
    ///
    /// Returns `false` when the entry was already dispatched or does not exist.
    fn mark_dispatched_if_pending(&self, id: &MessageId, at: DateTime<Utc>) -> Result<bool>;

    fn outstanding_count(&self) -> Result<usize>;

    /// Delete dispatched entries whose `dispatched_at` is before `before`.
    fn purge_dispatched(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Non-blocking outbox storage. Same contract as [`OutboxStore`].
#[async_trait]
pub trait AsyncOutboxStore: Send + Sync {
    async fn add(&self, entry: OutboxEntry) -> Result<()>;

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>>;

    async fn get_outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        exclude_topics: &[RoutingKey],
    ) -> Result<Vec<OutboxEntry>>;

    async fn mark_dispatched_if_pending(&self, id: &MessageId, at: DateTime<Utc>) -> Result<bool>;

    async fn outstanding_count(&self) -> Result<usize>;

    async fn purge_dispatched(&self, before: DateTime<Utc>) -> Result<usize>;
}

// =============================================================================
// Writer traits
// =============================================================================

/// Writes outbox entries inside a caller-owned transaction.
///
/// The caller commits or rolls back; the entry becomes visible to
/// `clear_outbox` and the sweeper only once committed.
pub trait OutboxWriter: Send {
    fn write(&mut self, entry: OutboxEntry) -> Result<()>;
}

/// Async twin of [`OutboxWriter`].
#[async_trait]
pub trait AsyncOutboxWriter: Send {
    async fn write(&mut self, entry: OutboxEntry) -> Result<()>;
}
