//! In-memory inbox.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use postbox_core::{AsyncInboxStore, InboxEntry, InboxKey, InboxStore};
use tracing::debug;

use crate::housekeeping::{outlived, Housekeeper, InMemoryBoxConfig};

/// Inbox held in a concurrent map.
///
/// An entry without its own time-to-live expires after the box's
/// `entry_ttl`. Compaction drops the oldest entries regardless of expiry; a
/// request whose entry was dropped is simply handled again.
pub struct InMemoryInbox {
    entries: DashMap<InboxKey, InboxEntry>,
    housekeeper: Housekeeper,
}

impl InMemoryInbox {
    pub fn new(config: InMemoryBoxConfig) -> Self {
        Self {
            entries: DashMap::new(),
            housekeeper: Housekeeper::new(config),
        }
    }

    pub fn config(&self) -> &InMemoryBoxConfig {
        self.housekeeper.config()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expired(&self, entry: &InboxEntry, now: DateTime<Utc>) -> bool {
        let ttl = entry.expire_after.unwrap_or(self.config().entry_ttl);
        outlived(entry.created_at, ttl, now)
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !self.expired(e, now));
        before.saturating_sub(self.entries.len())
    }

    fn maintain(&self, now: DateTime<Utc>) {
        if self.housekeeper.scan_due(now) {
            let removed = self.housekeeper.exclusive(|| self.remove_expired(now));
            if removed > 0 {
                debug!(removed, "expired inbox entries");
            }
        }

        if let Some(excess) = self.housekeeper.overflow(self.entries.len()) {
            let removed = self.housekeeper.exclusive(|| {
                let mut oldest: Vec<(DateTime<Utc>, InboxKey)> = self
                    .entries
                    .iter()
                    .map(|e| (e.created_at, e.key().clone()))
                    .collect();
                oldest.sort();
                oldest
                    .into_iter()
                    .take(excess)
                    .filter(|(_, key)| self.entries.remove(key).is_some())
                    .count()
            });
            if removed > 0 {
                debug!(removed, remaining = self.entries.len(), "compacted inbox");
            }
        }
    }
}

impl Default for InMemoryInbox {
    fn default() -> Self {
        Self::new(InMemoryBoxConfig::default())
    }
}

impl std::fmt::Debug for InMemoryInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryInbox")
            .field("entries", &self.entries.len())
            .field("config", self.config())
            .finish()
    }
}

impl InboxStore for InMemoryInbox {
    fn add(
        &self,
        key: InboxKey,
        body: String,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| InboxEntry {
                key,
                body,
                created_at,
                expire_after: ttl,
            });
        self.maintain(Utc::now());
        Ok(())
    }

    fn exists(&self, key: &InboxKey) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn get(&self, key: &InboxKey) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.body.clone()))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.remove_expired(now))
    }
}

#[async_trait]
impl AsyncInboxStore for InMemoryInbox {
    async fn add(
        &self,
        key: InboxKey,
        body: String,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        InboxStore::add(self, key, body, created_at, ttl)
    }

    async fn exists(&self, key: &InboxKey) -> Result<bool> {
        InboxStore::exists(self, key)
    }

    async fn get(&self, key: &InboxKey) -> Result<Option<String>> {
        InboxStore::get(self, key)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        InboxStore::purge_expired(self, now)
    }
}
