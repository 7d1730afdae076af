//! Inbox: a record of which requests have been handled, per context.
//!
//! An inbox entry is keyed by `(request id, context key)`. The context key lets
//! several handlers of the same event track it independently. Insertion is
//! lenient (adding a known key is a no-op) while lookup is strict
//! ([`Inbox::get`] fails with [`PostboxError::RequestNotFound`]).
//!
//! Entries may carry a time-to-live; expired entries are purged by the inbox
//! expiry sweep. Purging is housekeeping only: a duplicate that arrives after
//! its entry was purged is handled again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Request, RequestId};
use crate::error::{PostboxError, Result};

/// What an inbox node does when a once-only request has been seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnceOnlyAction {
    /// Fail with [`PostboxError::Duplicate`] before the handler runs.
    #[default]
    Throw,
    /// Log a warning and return the request without running the rest of the chain.
    Warn,
}

/// Composite inbox key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InboxKey {
    pub id: RequestId,
    pub context_key: String,
}

impl InboxKey {
    pub fn new(id: impl Into<RequestId>, context_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_key: context_key.into(),
        }
    }
}

impl fmt::Display for InboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.context_key)
    }
}

/// A stored inbox record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxEntry {
    pub key: InboxKey,
    /// The request, serialized as JSON.
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub expire_after: Option<Duration>,
}

impl InboxEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expire_after {
            Some(ttl) => now
                .signed_duration_since(self.created_at)
                .to_std()
                .is_ok_and(|age| age >= ttl),
            None => false,
        }
    }
}

// =============================================================================
// Store traits
// =============================================================================

/// Blocking inbox storage.
pub trait InboxStore: Send + Sync {
    /// Record `key` unless it is already present. Never fails on duplicates.
    fn add(
        &self,
        key: InboxKey,
        body: String,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    fn exists(&self, key: &InboxKey) -> anyhow::Result<bool>;

    fn get(&self, key: &InboxKey) -> anyhow::Result<Option<String>>;

    /// Remove entries whose time-to-live has elapsed at `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize>;
}

/// Non-blocking inbox storage. Same contract as [`InboxStore`].
#[async_trait]
pub trait AsyncInboxStore: Send + Sync {
    async fn add(
        &self,
        key: InboxKey,
        body: String,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    async fn exists(&self, key: &InboxKey) -> anyhow::Result<bool>;

    async fn get(&self, key: &InboxKey) -> anyhow::Result<Option<String>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize>;
}

// =============================================================================
// Facades
// =============================================================================

/// Typed access to a blocking inbox store.
///
/// # Example
///
/// ```ignore
/// let inbox = Inbox::new(Arc::new(InMemoryInbox::default()));
/// inbox.add(&command, "ctx1", None)?;
/// let seen: GreetingCommand = inbox.get(command.id(), "ctx1")?;
/// ```
#[derive(Clone)]
pub struct Inbox {
    store: Arc<dyn InboxStore>,
}

impl Inbox {
    pub fn new(store: Arc<dyn InboxStore>) -> Self {
        Self { store }
    }

    pub fn add<R: Request>(&self, request: &R, context_key: &str, ttl: Option<Duration>) -> Result<()> {
        let body = serde_json::to_string(request)?;
        self.store
            .add(InboxKey::new(request.id().clone(), context_key), body, Utc::now(), ttl)
            .map_err(PostboxError::store)
    }

    pub fn exists(&self, id: &RequestId, context_key: &str) -> Result<bool> {
        self.store
            .exists(&InboxKey::new(id.clone(), context_key))
            .map_err(PostboxError::store)
    }

    /// The recorded request, or [`PostboxError::RequestNotFound`].
    pub fn get<R: Request>(&self, id: &RequestId, context_key: &str) -> Result<R> {
        let body = self
            .store
            .get(&InboxKey::new(id.clone(), context_key))
            .map_err(PostboxError::store)?
            .ok_or_else(|| PostboxError::RequestNotFound {
                id: id.clone(),
                context_key: context_key.to_string(),
            })?;
        Ok(serde_json::from_str(&body)?)
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired(Utc::now()).map_err(PostboxError::store)
    }
}

/// Typed access to a non-blocking inbox store.
#[derive(Clone)]
pub struct AsyncInbox {
    store: Arc<dyn AsyncInboxStore>,
}

impl AsyncInbox {
    pub fn new(store: Arc<dyn AsyncInboxStore>) -> Self {
        Self { store }
    }

    pub async fn add<R: Request>(
        &self,
        request: &R,
        context_key: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let body = serde_json::to_string(request)?;
        self.store
            .add(InboxKey::new(request.id().clone(), context_key), body, Utc::now(), ttl)
            .await
            .map_err(PostboxError::store)
    }

    pub async fn exists(&self, id: &RequestId, context_key: &str) -> Result<bool> {
        self.store
            .exists(&InboxKey::new(id.clone(), context_key))
            .await
            .map_err(PostboxError::store)
    }

    pub async fn get<R: Request>(&self, id: &RequestId, context_key: &str) -> Result<R> {
        let body = self
            .store
            .get(&InboxKey::new(id.clone(), context_key))
            .await
            .map_err(PostboxError::store)?
            .ok_or_else(|| PostboxError::RequestNotFound {
                id: id.clone(),
                context_key: context_key.to_string(),
            })?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.store
            .purge_expired(Utc::now())
            .await
            .map_err(PostboxError::store)
    }
}
