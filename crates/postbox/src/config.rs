//! Configuration for the dispatcher, outbox, breaker and sweepers.
//!
//! Every struct here implements `Default` and deserializes with
//! `#[serde(default)]`, so a host can load a partial document from any serde
//! format and get sensible values for everything it leaves out.
//!
//! # Example
//!
//! ```ignore
//! use postbox_core::{OutboxConfig, SweeperConfig};
//! use std::time::Duration;
//!
//! let outbox = OutboxConfig::default().with_max_outstanding_messages(10_000);
//! let sweeper = SweeperConfig::default()
//!     .with_interval(Duration::from_secs(1))
//!     .with_min_age(Duration::from_millis(500));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inbox::OnceOnlyAction;
use crate::pipeline::DecoratorDescriptor;
use crate::policy::DEFAULT_RETRY_POLICY;
use crate::task::MIN_INTERVAL;

// =============================================================================
// CircuitBreakerConfig
// =============================================================================

/// Thresholds for the per-topic outbox circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive exhausted deliveries after which a topic trips open.
    pub failure_threshold: u32,
    /// How long a tripped topic stays open before the next attempt is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

// =============================================================================
// OutboxConfig
// =============================================================================

/// Configuration of the outbox producer mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Name of the retry policy used for producer sends.
    pub retry_policy: String,
    /// Refuse new deposits once this many entries are outstanding.
    pub max_outstanding_messages: Option<usize>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retry_policy: DEFAULT_RETRY_POLICY.to_string(),
            max_outstanding_messages: None,
        }
    }
}

impl OutboxConfig {
    pub fn with_retry_policy(mut self, name: impl Into<String>) -> Self {
        self.retry_policy = name.into();
        self
    }

    pub fn with_max_outstanding_messages(mut self, limit: usize) -> Self {
        self.max_outstanding_messages = Some(limit);
        self
    }
}

// =============================================================================
// SweeperConfig
// =============================================================================

/// Configuration of the background outbox sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// How often to look for outstanding entries.
    pub interval: Duration,
    /// Only entries older than this are swept, so an in-flight clear is not raced.
    pub min_age: Duration,
    /// Maximum entries re-driven per sweep.
    pub batch_size: usize,
    /// Delete dispatched entries older than this after each sweep.
    pub purge_dispatched_after: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_age: Duration::from_secs(5),
            batch_size: 100,
            purge_dispatched_after: None,
        }
    }
}

impl SweeperConfig {
    /// Time between ticks, at least [`MIN_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_purge_dispatched_after(mut self, retention: Duration) -> Self {
        self.purge_dispatched_after = Some(retention);
        self
    }
}

// =============================================================================
// InboxSweepConfig
// =============================================================================

/// Configuration of the inbox expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxSweepConfig {
    pub interval: Duration,
}

impl Default for InboxSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
        }
    }
}

impl InboxSweepConfig {
    /// Time between ticks, at least [`MIN_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }
}

// =============================================================================
// InboxConfiguration
// =============================================================================

/// How the context key of a global inbox node is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKeyStrategy {
    /// Use the name of the core handler, so each handler has its own context.
    #[default]
    HandlerName,
    /// Use the same context key for every handler.
    Fixed(String),
}

impl ContextKeyStrategy {
    pub fn context_key(&self, handler_name: &str) -> String {
        match self {
            ContextKeyStrategy::HandlerName => handler_name.to_string(),
            ContextKeyStrategy::Fixed(key) => key.clone(),
        }
    }
}

/// Settings for the inbox node the pipeline builder inserts into every chain.
///
/// Handlers that declare their own inbox descriptor, or carry the
/// [`DecoratorDescriptor::no_global_inbox`] marker, are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfiguration {
    pub once_only: bool,
    pub action_on_exists: OnceOnlyAction,
    pub context: ContextKeyStrategy,
    pub expire_after: Option<Duration>,
}

impl Default for InboxConfiguration {
    fn default() -> Self {
        Self {
            once_only: true,
            action_on_exists: OnceOnlyAction::Throw,
            context: ContextKeyStrategy::HandlerName,
            expire_after: None,
        }
    }
}

impl InboxConfiguration {
    pub fn with_action(mut self, action: OnceOnlyAction) -> Self {
        self.action_on_exists = action;
        self
    }

    pub fn with_context(mut self, context: ContextKeyStrategy) -> Self {
        self.context = context;
        self
    }

    pub fn with_expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }

    pub fn with_once_only(mut self, once_only: bool) -> Self {
        self.once_only = once_only;
        self
    }

    /// The inbox descriptor to place at the head of `handler_name`'s chain.
    pub fn descriptor_for(&self, handler_name: &str) -> DecoratorDescriptor {
        let descriptor = DecoratorDescriptor::use_inbox(
            i32::MIN,
            self.context.context_key(handler_name),
            self.once_only,
            self.action_on_exists,
        );
        match self.expire_after {
            Some(ttl) => descriptor.with_expire_after(ttl),
            None => descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{link_types, HandlerTiming};

    #[test]
    fn test_defaults() {
        let breaker = CircuitBreakerConfig::default();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.cooldown, Duration::from_secs(60));

        let sweeper = SweeperConfig::default();
        assert_eq!(sweeper.interval, Duration::from_secs(5));
        assert_eq!(sweeper.min_age, Duration::from_secs(5));
        assert_eq!(sweeper.batch_size, 100);
        assert!(sweeper.purge_dispatched_after.is_none());

        let outbox = OutboxConfig::default();
        assert_eq!(outbox.retry_policy, DEFAULT_RETRY_POLICY);
        assert!(outbox.max_outstanding_messages.is_none());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: SweeperConfig =
            serde_json::from_str(r#"{"batch_size": 10}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_is_raised_to_minimum() {
        assert_eq!(SweeperConfig::default().with_interval(Duration::ZERO).interval, MIN_INTERVAL);
        assert_eq!(InboxSweepConfig::default().with_interval(Duration::ZERO).interval, MIN_INTERVAL);
        assert_eq!(
            SweeperConfig::default().with_interval(Duration::from_secs(2)).interval,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_context_key_strategy() {
        assert_eq!(
            ContextKeyStrategy::HandlerName.context_key("GreetingHandler"),
            "GreetingHandler"
        );
        assert_eq!(
            ContextKeyStrategy::Fixed("shared".into()).context_key("GreetingHandler"),
            "shared"
        );
    }

    #[test]
    fn test_inbox_configuration_descriptor() {
        let config = InboxConfiguration::default()
            .with_action(OnceOnlyAction::Warn)
            .with_expire_after(Duration::from_secs(30));
        let descriptor = config.descriptor_for("GreetingHandler");

        assert_eq!(descriptor.link_type, link_types::INBOX);
        assert_eq!(descriptor.timing, HandlerTiming::Before);
        assert_eq!(descriptor.step, i32::MIN);
        assert_eq!(descriptor.params[1], serde_json::json!("GreetingHandler"));
        assert_eq!(descriptor.params[2], serde_json::json!("warn"));
        assert_eq!(descriptor.params[3], serde_json::json!(30_000));
    }
}
