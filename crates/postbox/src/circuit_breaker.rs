//! Per-topic circuit breaker for outbox dispatch.
//!
//! Each topic has its own [`BreakerState`] behind its own lock, so a topic
//! that keeps failing never slows down or trips another. There is no timer:
//! an open breaker closes lazily the next time [`is_tripped`] is asked after
//! the cooldown has passed. The first attempt after that is a trial; a single
//! failure re-opens the breaker, a success closes it for good.
//!
//! [`is_tripped`]: OutboxCircuitBreaker::is_tripped

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::core::RoutingKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
}

/// Breaker bookkeeping for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }
}

/// Circuit breaker keyed by topic.
#[derive(Debug, Default)]
pub struct OutboxCircuitBreaker {
    config: CircuitBreakerConfig,
    topics: DashMap<RoutingKey, Arc<Mutex<BreakerState>>>,
}

impl OutboxCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            topics: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// True while the topic's breaker is open. Heals an expired breaker.
    pub fn is_tripped(&self, topic: &RoutingKey) -> bool {
        let Some(slot) = self.existing(topic) else {
            return false;
        };
        let mut state = lock(&slot);
        self.heal_if_cooled(topic, &mut state, Utc::now());
        state.state == CircuitState::Open
    }

    /// Count one exhausted delivery. Returns the state afterwards.
    pub fn record_failure(&self, topic: &RoutingKey) -> CircuitState {
        let slot = self.slot(topic);
        let mut state = lock(&slot);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.state == CircuitState::Closed
            && state.consecutive_failures >= self.config.failure_threshold
        {
            state.state = CircuitState::Open;
            state.opened_at = Some(Utc::now());
            warn!(
                %topic,
                failures = state.consecutive_failures,
                cooldown = ?self.config.cooldown,
                "circuit breaker opened"
            );
        }
        state.state
    }

    /// Reset the failure count and close the breaker.
    pub fn record_success(&self, topic: &RoutingKey) {
        let Some(slot) = self.existing(topic) else {
            return;
        };
        let mut state = lock(&slot);
        if state.state == CircuitState::Open {
            info!(%topic, "circuit breaker closed");
        }
        *state = BreakerState::default();
    }

    /// Forget everything about the topic.
    pub fn reset(&self, topic: &RoutingKey) {
        if let Some(slot) = self.existing(topic) {
            *lock(&slot) = BreakerState::default();
        }
    }

    /// Topics whose breaker is currently open.
    pub fn tripped_topics(&self) -> Vec<RoutingKey> {
        let topics: Vec<RoutingKey> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.into_iter().filter(|t| self.is_tripped(t)).collect()
    }

    /// Snapshot of the topic's state, after lazy healing.
    pub fn state(&self, topic: &RoutingKey) -> BreakerState {
        match self.existing(topic) {
            Some(slot) => {
                let mut state = lock(&slot);
                self.heal_if_cooled(topic, &mut state, Utc::now());
                state.clone()
            }
            None => BreakerState::default(),
        }
    }

    fn heal_if_cooled(&self, topic: &RoutingKey, state: &mut BreakerState, now: DateTime<Utc>) {
        if state.state != CircuitState::Open {
            return;
        }
        let cooled = state
            .opened_at
            .and_then(|opened| now.signed_duration_since(opened).to_std().ok())
            .is_some_and(|elapsed| elapsed >= self.config.cooldown);
        if cooled {
            state.state = CircuitState::Closed;
            state.opened_at = None;
            // One more failure re-opens the breaker.
            state.consecutive_failures = self.config.failure_threshold.saturating_sub(1);
            info!(%topic, "circuit breaker cooled down, allowing a trial");
        }
    }

    // Clone the Arc out so the shard lock is not held while the topic lock is.
    fn existing(&self, topic: &RoutingKey) -> Option<Arc<Mutex<BreakerState>>> {
        self.topics.get(topic).map(|slot| Arc::clone(slot.value()))
    }

    fn slot(&self, topic: &RoutingKey) -> Arc<Mutex<BreakerState>> {
        if let Some(slot) = self.existing(topic) {
            return slot;
        }
        Arc::clone(self.topics.entry(topic.clone()).or_default().value())
    }
}

fn lock(slot: &Mutex<BreakerState>) -> MutexGuard<'_, BreakerState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
