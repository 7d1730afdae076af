//! Named retry policies.
//!
//! Policies are looked up by name at the point of use: by the outbox mediator
//! for every producer send, and by `postbox.policy` decorator nodes for the
//! rest of their chain. An unknown name is a [`ConfigurationError`] raised
//! when the lookup happens, not when the registry is built.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigurationError;

/// Name of the policy registered by [`PolicyRegistry::default`].
pub const DEFAULT_RETRY_POLICY: &str = "postbox.retry";

// =============================================================================
// RetryPolicy
// =============================================================================

/// Bounded retry with exponential backoff.
///
/// `max_attempts` counts the first try, so `max_attempts: 1` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Spread each delay randomly over 50%..150% of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries `max_attempts` times with the default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Try once, never retry.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.multiplier = multiplier.max(1.0);
        self.max_backoff = max;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Nominal delay after the given failed attempt (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nominal = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = nominal.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(self.max_backoff)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_for(attempt);
        if self.jitter {
            Duration::try_from_secs_f64(delay.as_secs_f64() * (0.5 + fastrand::f64()))
                .unwrap_or(Duration::MAX)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, `retryable` rejects the error, or the
    /// attempts run out. Sleeps the calling thread between attempts.
    pub fn execute<T, E, F, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, max_attempts = self.max_attempts, ?delay, error = %e, "attempt failed, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Async twin of [`execute`](Self::execute); waits with `tokio::time::sleep`.
    pub async fn execute_async<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, max_attempts = self.max_attempts, ?delay, error = %e, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// PolicyRegistry
// =============================================================================

/// Retry policies by name.
///
/// # Example
///
/// ```ignore
/// use postbox_core::{PolicyRegistry, RetryPolicy};
///
/// let policies = PolicyRegistry::default()
///     .with_policy("payments", RetryPolicy::new(5).without_jitter());
/// assert!(policies.get("payments").is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, RetryPolicy>,
}

impl PolicyRegistry {
    /// An empty registry. Note that the outbox looks up
    /// [`DEFAULT_RETRY_POLICY`] unless configured otherwise.
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, name: impl Into<String>, policy: RetryPolicy) -> Self {
        self.insert(name, policy);
        self
    }

    /// Register or replace a policy.
    pub fn insert(&mut self, name: impl Into<String>, policy: RetryPolicy) {
        self.policies.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Result<&RetryPolicy, ConfigurationError> {
        self.policies
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownPolicy {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}

impl Default for PolicyRegistry {
    /// A registry holding the default retry policy under [`DEFAULT_RETRY_POLICY`].
    fn default() -> Self {
        Self::new().with_policy(DEFAULT_RETRY_POLICY, RetryPolicy::default())
    }
}
