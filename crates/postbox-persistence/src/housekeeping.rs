//! Expiry scans and capacity compaction shared by the in-memory stores.

use std::sync::{Mutex, PoisonError, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Limits for an in-memory box.
///
/// Expiry is checked lazily: a write triggers a scan when at least
/// `expiration_scan_interval` has passed since the previous one. When a write
/// finds `entry_limit` entries, the oldest evictable entries are removed until
/// roughly `compaction_percentage` of the box is left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryBoxConfig {
    pub entry_ttl: Duration,
    pub expiration_scan_interval: Duration,
    pub entry_limit: usize,
    pub compaction_percentage: f64,
}

impl Default for InMemoryBoxConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(5 * 60),
            expiration_scan_interval: Duration::from_secs(10 * 60),
            entry_limit: 2048,
            compaction_percentage: 0.5,
        }
    }
}

impl InMemoryBoxConfig {
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn with_expiration_scan_interval(mut self, interval: Duration) -> Self {
        self.expiration_scan_interval = interval;
        self
    }

    pub fn with_entry_limit(mut self, limit: usize) -> Self {
        self.entry_limit = limit;
        self
    }

    /// Fraction of the box kept after compaction, clamped to `0.0..=1.0`.
    pub fn with_compaction_percentage(mut self, percentage: f64) -> Self {
        self.compaction_percentage = percentage.clamp(0.0, 1.0);
        self
    }
}

pub(crate) struct Housekeeper {
    config: InMemoryBoxConfig,
    last_scan: Mutex<DateTime<Utc>>,
    running: Mutex<()>,
}

impl Housekeeper {
    pub(crate) fn new(config: InMemoryBoxConfig) -> Self {
        Self {
            config,
            last_scan: Mutex::new(Utc::now()),
            running: Mutex::new(()),
        }
    }

    pub(crate) fn config(&self) -> &InMemoryBoxConfig {
        &self.config
    }

    /// True at most once per scan interval.
    pub(crate) fn scan_due(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.last_scan.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.signed_duration_since(*last).to_std().unwrap_or_default();
        if elapsed < self.config.expiration_scan_interval {
            return false;
        }
        *last = now;
        true
    }

    /// How many entries a box holding `count` should shed, if any.
    pub(crate) fn overflow(&self, count: usize) -> Option<usize> {
        if count < self.config.entry_limit {
            return None;
        }
        let keep = (count as f64 * self.config.compaction_percentage) as usize;
        Some(self.config.entry_limit.saturating_sub(keep).max(1))
    }

    /// Run `cleanup` unless another cleanup is already running.
    pub(crate) fn exclusive(&self, cleanup: impl FnOnce() -> usize) -> usize {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };
        cleanup()
    }
}

/// Whether something written at `written` has outlived `ttl` at `now`.
pub(crate) fn outlived(written: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(written)
        .to_std()
        .is_ok_and(|age| age >= ttl)
}
