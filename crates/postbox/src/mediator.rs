//! Moves messages from the outbox to their producers.
//!
//! The [`OutboxProducerMediator`] owns the outbound path: it deposits mapped
//! messages into the outbox and dispatches outstanding ones, guarded by the
//! named retry policy and the per-topic circuit breaker.
//!
//! # Dispatch of one entry
//!
//! ```text
//! get(id) ──► missing ──────────────► MessageNotFound
//!    │
//!    ├──► already dispatched ───────► skipped
//!    ├──► topic breaker open ───────► skipped, left outstanding
//!    ▼
//! producer.send under retry policy
//!    ├──► ok ──► record_success ──► mark_dispatched_if_pending
//!    └──► exhausted ──► record_failure, left outstanding for the sweeper
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::circuit_breaker::OutboxCircuitBreaker;
use crate::config::{CircuitBreakerConfig, OutboxConfig};
use crate::core::{MessageId, Request};
use crate::error::{ConfigurationError, PostboxError, Result};
use crate::mapper::MapperRegistry;
use crate::message::Message;
use crate::outbox::{AsyncOutboxStore, AsyncOutboxWriter, OutboxEntry, OutboxStore, OutboxWriter};
use crate::policy::PolicyRegistry;
use crate::producer::ProducerRegistry;

// =============================================================================
// DispatchReport
// =============================================================================

/// What happened to each id of a clear or sweep.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Sent and marked dispatched by this call.
    pub dispatched: Vec<MessageId>,
    /// Already dispatched, or marked by a concurrent clear first.
    pub already_dispatched: Vec<MessageId>,
    /// Not attempted because the topic's breaker is open.
    pub skipped_tripped: Vec<MessageId>,
    /// Retries exhausted; still outstanding.
    pub failed: Vec<MessageId>,
    /// Could not be attempted at all, e.g. no producer for the topic.
    /// Still outstanding.
    pub errored: Vec<DispatchError>,
}

/// An entry the dispatcher could not attempt, and why.
#[derive(Debug)]
pub struct DispatchError {
    pub id: MessageId,
    pub error: PostboxError,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.errored.is_empty()
    }

    pub fn total(&self) -> usize {
        self.dispatched.len()
            + self.already_dispatched.len()
            + self.skipped_tripped.len()
            + self.failed.len()
            + self.errored.len()
    }

    pub fn merge(&mut self, other: DispatchReport) {
        self.dispatched.extend(other.dispatched);
        self.already_dispatched.extend(other.already_dispatched);
        self.skipped_tripped.extend(other.skipped_tripped);
        self.failed.extend(other.failed);
        self.errored.extend(other.errored);
    }

    /// Fail with the first entry's error if any entry errored, otherwise with
    /// [`PostboxError::DeliveryFailed`] if any delivery was exhausted.
    pub fn into_result(mut self) -> Result<Self> {
        if !self.errored.is_empty() {
            return Err(self.errored.swap_remove(0).error);
        }
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(PostboxError::DeliveryFailed { ids: self.failed })
        }
    }
}

enum Outcome {
    Dispatched,
    AlreadyDispatched,
    Tripped,
    Failed,
}

impl DispatchReport {
    fn record(&mut self, id: MessageId, outcome: Result<Outcome>) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(message_id = %id, error = %error, "message could not be dispatched, it stays outstanding");
                self.errored.push(DispatchError { id, error });
                return;
            }
        };
        match outcome {
            Outcome::Dispatched => self.dispatched.push(id),
            Outcome::AlreadyDispatched => self.already_dispatched.push(id),
            Outcome::Tripped => self.skipped_tripped.push(id),
            Outcome::Failed => self.failed.push(id),
        }
    }
}

// =============================================================================
// OutboxProducerMediator
// =============================================================================

/// Deposits messages into the outbox and dispatches them to producers.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryOutbox::default());
/// let mediator = OutboxProducerMediator::new(producers, mappers)
///     .with_outbox(store.clone())
///     .with_async_outbox(store);
///
/// let id = mediator.deposit(&command)?;
/// mediator.clear_outbox(&[id])?.into_result()?;
/// ```
pub struct OutboxProducerMediator {
    outbox: Option<Arc<dyn OutboxStore>>,
    async_outbox: Option<Arc<dyn AsyncOutboxStore>>,
    producers: Arc<ProducerRegistry>,
    mappers: Arc<MapperRegistry>,
    policies: Arc<PolicyRegistry>,
    breaker: Arc<OutboxCircuitBreaker>,
    config: OutboxConfig,
}

impl OutboxProducerMediator {
    pub fn new(producers: ProducerRegistry, mappers: MapperRegistry) -> Self {
        Self {
            outbox: None,
            async_outbox: None,
            producers: Arc::new(producers),
            mappers: Arc::new(mappers),
            policies: Arc::new(PolicyRegistry::default()),
            breaker: Arc::new(OutboxCircuitBreaker::new(CircuitBreakerConfig::default())),
            config: OutboxConfig::default(),
        }
    }

    pub fn with_outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(store);
        self
    }

    pub fn with_async_outbox(mut self, store: Arc<dyn AsyncOutboxStore>) -> Self {
        self.async_outbox = Some(store);
        self
    }

    pub fn with_policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<OutboxCircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breaker(&self) -> &Arc<OutboxCircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    fn outbox(&self) -> Result<&Arc<dyn OutboxStore>> {
        self.outbox
            .as_ref()
            .ok_or_else(|| ConfigurationError::NoOutbox { mode: "blocking" }.into())
    }

    fn async_outbox(&self) -> Result<&Arc<dyn AsyncOutboxStore>> {
        self.async_outbox
            .as_ref()
            .ok_or_else(|| ConfigurationError::NoOutbox { mode: "async" }.into())
    }

    // -------------------------------------------------------------------------
    // Deposit
    // -------------------------------------------------------------------------

    /// Map `request` to the message it is posted as.
    pub fn create_message<R: Request>(&self, request: &R) -> Result<Message> {
        self.mappers.wrap(request)
    }

    /// Map and store `request`. Returns the message id.
    pub fn deposit<R: Request>(&self, request: &R) -> Result<MessageId> {
        let outbox = self.outbox()?;
        self.check_limit(outbox.outstanding_count().map_err(PostboxError::store)?)?;

        let entry = OutboxEntry::new(self.create_message(request)?);
        let id = entry.message_id.clone();
        outbox.add(entry).map_err(PostboxError::store)?;
        debug!(message_id = %id, request_type = R::request_type(), "deposited message");
        Ok(id)
    }

    pub async fn deposit_async<R: Request>(&self, request: &R) -> Result<MessageId> {
        let outbox = self.async_outbox()?;
        self.check_limit(outbox.outstanding_count().await.map_err(PostboxError::store)?)?;

        let entry = OutboxEntry::new(self.create_message(request)?);
        let id = entry.message_id.clone();
        outbox.add(entry).await.map_err(PostboxError::store)?;
        debug!(message_id = %id, request_type = R::request_type(), "deposited message");
        Ok(id)
    }

    /// Map `request` and write it through a caller-owned transaction.
    ///
    /// The outstanding limit is checked against the configured outbox, when
    /// there is one; the write itself goes only to `writer`.
    pub fn deposit_with<R: Request>(&self, request: &R, writer: &mut dyn OutboxWriter) -> Result<MessageId> {
        if let Some(outbox) = &self.outbox {
            self.check_limit(outbox.outstanding_count().map_err(PostboxError::store)?)?;
        }
        let entry = OutboxEntry::new(self.create_message(request)?);
        let id = entry.message_id.clone();
        writer.write(entry).map_err(PostboxError::store)?;
        debug!(message_id = %id, request_type = R::request_type(), "wrote message to transaction");
        Ok(id)
    }

    pub async fn deposit_with_async<R: Request>(
        &self,
        request: &R,
        writer: &mut dyn AsyncOutboxWriter,
    ) -> Result<MessageId> {
        if let Some(outbox) = &self.async_outbox {
            self.check_limit(outbox.outstanding_count().await.map_err(PostboxError::store)?)?;
        }
        let entry = OutboxEntry::new(self.create_message(request)?);
        let id = entry.message_id.clone();
        writer.write(entry).await.map_err(PostboxError::store)?;
        debug!(message_id = %id, request_type = R::request_type(), "wrote message to transaction");
        Ok(id)
    }

    fn check_limit(&self, outstanding: usize) -> Result<()> {
        match self.config.max_outstanding_messages {
            Some(limit) if outstanding >= limit => {
                warn!(outstanding, limit, "outbox limit reached, refusing deposit");
                Err(PostboxError::OutboxLimitReached { limit })
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Clear
    // -------------------------------------------------------------------------

    /// Dispatch the given messages.
    ///
    /// Every id is looked up before anything is sent, so a missing id fails
    /// the whole call with [`PostboxError::MessageNotFound`] and sends
    /// nothing. Per-message problems are reported, not raised.
    pub fn clear_outbox(&self, ids: &[MessageId]) -> Result<DispatchReport> {
        let outbox = self.outbox()?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = outbox
                .get(id)
                .map_err(PostboxError::store)?
                .ok_or_else(|| PostboxError::MessageNotFound { id: id.clone() })?;
            entries.push(entry);
        }

        let mut report = DispatchReport::default();
        for entry in &entries {
            report.record(entry.message_id.clone(), self.dispatch(outbox.as_ref(), entry));
        }
        Ok(report)
    }

    pub async fn clear_outbox_async(&self, ids: &[MessageId]) -> Result<DispatchReport> {
        let outbox = self.async_outbox()?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = outbox
                .get(id)
                .await
                .map_err(PostboxError::store)?
                .ok_or_else(|| PostboxError::MessageNotFound { id: id.clone() })?;
            entries.push(entry);
        }

        let mut report = DispatchReport::default();
        for entry in &entries {
            let outcome = self.dispatch_async(outbox.as_ref(), entry).await;
            report.record(entry.message_id.clone(), outcome);
        }
        Ok(report)
    }

    /// Re-drive up to `limit` undispatched entries older than `min_age`.
    ///
    /// Topics whose breaker is open are left out of the query, so their
    /// backlog never fills the batch.
    pub async fn clear_outstanding_async(&self, min_age: Duration, limit: usize) -> Result<DispatchReport> {
        let outbox = self.async_outbox()?;
        let tripped = self.breaker.tripped_topics();
        let entries = outbox
            .get_outstanding(ago(min_age), limit, &tripped)
            .await
            .map_err(PostboxError::store)?;

        let mut report = DispatchReport::default();
        for entry in &entries {
            let outcome = self.dispatch_async(outbox.as_ref(), entry).await;
            report.record(entry.message_id.clone(), outcome);
        }
        Ok(report)
    }

    /// Delete dispatched entries older than `retention`.
    pub async fn purge_dispatched_async(&self, retention: Duration) -> Result<usize> {
        let outbox = self.async_outbox()?;
        outbox
            .purge_dispatched(ago(retention))
            .await
            .map_err(PostboxError::store)
    }

    pub fn outstanding_count(&self) -> Result<usize> {
        self.outbox()?.outstanding_count().map_err(PostboxError::store)
    }

    pub async fn outstanding_count_async(&self) -> Result<usize> {
        self.async_outbox()?
            .outstanding_count()
            .await
            .map_err(PostboxError::store)
    }

    fn dispatch(&self, outbox: &dyn OutboxStore, entry: &OutboxEntry) -> Result<Outcome> {
        let Some(message) = self.dispatchable(entry)? else {
            return Ok(Outcome::AlreadyDispatched);
        };
        let topic = message.topic();
        if self.breaker.is_tripped(topic) {
            warn!(message_id = %entry.message_id, %topic, "circuit open, leaving message outstanding");
            return Ok(Outcome::Tripped);
        }

        let producer = self.producers.lookup_by(topic)?;
        let policy = self.policies.get(&self.config.retry_policy)?;
        let sent = policy.execute(
            |attempt| {
                debug!(message_id = %entry.message_id, %topic, attempt, "sending message");
                producer.send(message)
            },
            |_| true,
        );

        match sent {
            Ok(()) => {
                self.breaker.record_success(topic);
                let marked = outbox
                    .mark_dispatched_if_pending(&entry.message_id, Utc::now())
                    .map_err(PostboxError::store)?;
                Ok(if marked {
                    Outcome::Dispatched
                } else {
                    Outcome::AlreadyDispatched
                })
            }
            Err(e) => {
                error!(message_id = %entry.message_id, %topic, error = %e, "delivery failed, message stays outstanding");
                self.breaker.record_failure(topic);
                Ok(Outcome::Failed)
            }
        }
    }

    async fn dispatch_async(&self, outbox: &dyn AsyncOutboxStore, entry: &OutboxEntry) -> Result<Outcome> {
        let Some(message) = self.dispatchable(entry)? else {
            return Ok(Outcome::AlreadyDispatched);
        };
        let topic = message.topic();
        if self.breaker.is_tripped(topic) {
            warn!(message_id = %entry.message_id, %topic, "circuit open, leaving message outstanding");
            return Ok(Outcome::Tripped);
        }

        let producer = self.producers.lookup_by(topic)?;
        let policy = self.policies.get(&self.config.retry_policy)?;
        let sent = policy
            .execute_async(
                |attempt| {
                    debug!(message_id = %entry.message_id, %topic, attempt, "sending message");
                    let producer = Arc::clone(&producer);
                    async move { producer.send_async(message).await }
                },
                |_| true,
            )
            .await;

        match sent {
            Ok(()) => {
                self.breaker.record_success(topic);
                let marked = outbox
                    .mark_dispatched_if_pending(&entry.message_id, Utc::now())
                    .await
                    .map_err(PostboxError::store)?;
                Ok(if marked {
                    Outcome::Dispatched
                } else {
                    Outcome::AlreadyDispatched
                })
            }
            Err(e) => {
                error!(message_id = %entry.message_id, %topic, error = %e, "delivery failed, message stays outstanding");
                self.breaker.record_failure(topic);
                Ok(Outcome::Failed)
            }
        }
    }

    /// The message to send, or `None` if the entry needs no dispatch.
    fn dispatchable<'e>(&self, entry: &'e OutboxEntry) -> Result<Option<&'e Message>> {
        if entry.is_dispatched() {
            debug!(message_id = %entry.message_id, "already dispatched");
            return Ok(None);
        }
        if entry.message.is_empty() {
            return Err(PostboxError::MessageNotFound {
                id: entry.message_id.clone(),
            });
        }
        Ok(Some(&entry.message))
    }
}

/// The instant `age` before now, clamped to the earliest representable time.
fn ago(age: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl std::fmt::Debug for OutboxProducerMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProducerMediator")
            .field("outbox", &self.outbox.is_some())
            .field("async_outbox", &self.async_outbox.is_some())
            .field("producers", &self.producers)
            .field("config", &self.config)
            .finish()
    }
}
