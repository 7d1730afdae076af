//! In-memory outbox.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use postbox_core::{
    AsyncOutboxStore, AsyncOutboxWriter, MessageId, OutboxEntry, OutboxStore, OutboxWriter, RoutingKey,
};
use tracing::debug;

use crate::housekeeping::{outlived, Housekeeper, InMemoryBoxConfig};

/// Outbox held in a concurrent map.
///
/// Outstanding entries are never evicted. Expiry scans and compaction only
/// remove entries that were already dispatched, oldest first, so a full box
/// keeps every message that still has to go out.
///
/// # Example
///
/// ```ignore
/// let outbox = Arc::new(InMemoryOutbox::default());
/// let mediator = OutboxProducerMediator::new(producers, mappers)
///     .with_outbox(outbox.clone())
///     .with_async_outbox(outbox);
/// ```
pub struct InMemoryOutbox {
    entries: DashMap<MessageId, OutboxEntry>,
    housekeeper: Housekeeper,
}

impl InMemoryOutbox {
    pub fn new(config: InMemoryBoxConfig) -> Self {
        Self {
            entries: DashMap::new(),
            housekeeper: Housekeeper::new(config),
        }
    }

    pub fn config(&self) -> &InMemoryBoxConfig {
        self.housekeeper.config()
    }

    /// Total entries, dispatched or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a transaction whose writes land in this outbox on commit.
    pub fn begin(self: &Arc<Self>) -> InMemoryOutboxTransaction {
        InMemoryOutboxTransaction {
            outbox: Arc::clone(self),
            pending: Vec::new(),
        }
    }

    fn insert(&self, entry: OutboxEntry) {
        self.entries.entry(entry.message_id.clone()).or_insert(entry);
        self.maintain(Utc::now());
    }

    fn maintain(&self, now: DateTime<Utc>) {
        if self.housekeeper.scan_due(now) {
            let ttl = self.config().entry_ttl;
            let removed = self.housekeeper.exclusive(|| {
                let before = self.entries.len();
                self.entries
                    .retain(|_, e| !e.dispatched_at.is_some_and(|at| outlived(at, ttl, now)));
                before.saturating_sub(self.entries.len())
            });
            if removed > 0 {
                debug!(removed, "expired dispatched outbox entries");
            }
        }

        if let Some(excess) = self.housekeeper.overflow(self.entries.len()) {
            let removed = self.housekeeper.exclusive(|| self.compact(excess));
            if removed > 0 {
                debug!(removed, remaining = self.entries.len(), "compacted outbox");
            }
        }
    }

    fn compact(&self, excess: usize) -> usize {
        let mut dispatched: Vec<(DateTime<Utc>, MessageId)> = self
            .entries
            .iter()
            .filter_map(|e| e.dispatched_at.map(|at| (at, e.key().clone())))
            .collect();
        dispatched.sort();
        dispatched
            .into_iter()
            .take(excess)
            .filter(|(_, id)| self.entries.remove(id).is_some())
            .count()
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new(InMemoryBoxConfig::default())
    }
}

impl std::fmt::Debug for InMemoryOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutbox")
            .field("entries", &self.entries.len())
            .field("config", self.config())
            .finish()
    }
}

impl OutboxStore for InMemoryOutbox {
    fn add(&self, entry: OutboxEntry) -> Result<()> {
        self.insert(entry);
        Ok(())
    }

    fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }

    fn get_outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        exclude_topics: &[RoutingKey],
    ) -> Result<Vec<OutboxEntry>> {
        let mut outstanding: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| !e.is_dispatched() && e.created_at < created_before)
            .filter(|e| !exclude_topics.contains(e.message.topic()))
            .map(|e| e.value().clone())
            .collect();
        outstanding.sort_by_key(|e| e.created_at);
        outstanding.truncate(limit);
        Ok(outstanding)
    }

    fn mark_dispatched_if_pending(&self, id: &MessageId, at: DateTime<Utc>) -> Result<bool> {
        // The shard write lock makes check-and-set atomic.
        Ok(match self.entries.get_mut(id) {
            Some(mut entry) if entry.dispatched_at.is_none() => {
                entry.dispatched_at = Some(at);
                true
            }
            _ => false,
        })
    }

    fn outstanding_count(&self) -> Result<usize> {
        Ok(self.entries.iter().filter(|e| !e.is_dispatched()).count())
    }

    fn purge_dispatched(&self, before: DateTime<Utc>) -> Result<usize> {
        let count = self.entries.len();
        self.entries
            .retain(|_, e| !e.dispatched_at.is_some_and(|at| at < before));
        Ok(count.saturating_sub(self.entries.len()))
    }
}

#[async_trait]
impl AsyncOutboxStore for InMemoryOutbox {
    async fn add(&self, entry: OutboxEntry) -> Result<()> {
        OutboxStore::add(self, entry)
    }

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>> {
        OutboxStore::get(self, id)
    }

    async fn get_outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
        exclude_topics: &[RoutingKey],
    ) -> Result<Vec<OutboxEntry>> {
        OutboxStore::get_outstanding(self, created_before, limit, exclude_topics)
    }

    async fn mark_dispatched_if_pending(&self, id: &MessageId, at: DateTime<Utc>) -> Result<bool> {
        OutboxStore::mark_dispatched_if_pending(self, id, at)
    }

    async fn outstanding_count(&self) -> Result<usize> {
        OutboxStore::outstanding_count(self)
    }

    async fn purge_dispatched(&self, before: DateTime<Utc>) -> Result<usize> {
        OutboxStore::purge_dispatched(self, before)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Buffers outbox writes until [`commit`](Self::commit).
///
/// Dropping the transaction discards its writes, like a rollback.
pub struct InMemoryOutboxTransaction {
    outbox: Arc<InMemoryOutbox>,
    pending: Vec<OutboxEntry>,
}

impl InMemoryOutboxTransaction {
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Make every buffered entry visible in the outbox.
    pub fn commit(self) -> usize {
        let committed = self.pending.len();
        for entry in self.pending {
            self.outbox.insert(entry);
        }
        committed
    }

    pub fn rollback(self) {
        debug!(discarded = self.pending.len(), "rolled back outbox transaction");
    }
}

impl OutboxWriter for InMemoryOutboxTransaction {
    fn write(&mut self, entry: OutboxEntry) -> Result<()> {
        self.pending.push(entry);
        Ok(())
    }
}

#[async_trait]
impl AsyncOutboxWriter for InMemoryOutboxTransaction {
    async fn write(&mut self, entry: OutboxEntry) -> Result<()> {
        self.pending.push(entry);
        Ok(())
    }
}
