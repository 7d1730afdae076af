//! Re-drives outbox entries that nobody cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use postbox_core::{spawn_periodic, DispatchReport, OutboxProducerMediator, Result, SweeperConfig, TaskHandle};
use tracing::{debug, error, info, warn};

/// Periodically dispatches outstanding outbox entries.
///
/// Each sweep takes up to `batch_size` entries older than `min_age` and runs
/// them through the same dispatch path as `clear_outbox`. Topics with an open
/// breaker are left out of the batch, an entry that cannot be dispatched is
/// reported without stopping the rest, and each entry is marked dispatched at
/// most once even when a manual clear races the sweep.
///
/// # Example
///
/// ```ignore
/// let sweeper = Arc::new(OutboxSweeper::new(mediator, SweeperConfig::default()));
/// let handle = sweeper.start();
/// // ...
/// handle.shutdown().await;
/// ```
#[derive(Debug)]
pub struct OutboxSweeper {
    mediator: Arc<OutboxProducerMediator>,
    config: SweeperConfig,
    sweeping: AtomicBool,
}

/// Clears the in-progress flag when a sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboxSweeper {
    pub fn new(mediator: Arc<OutboxProducerMediator>, config: SweeperConfig) -> Self {
        Self {
            mediator,
            config,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run one sweep now.
    ///
    /// Returns `None` without doing anything if another sweep is running.
    pub async fn sweep(&self) -> Result<Option<DispatchReport>> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("outbox sweep already in progress, skipping");
            return Ok(None);
        }
        let _guard = SweepGuard(&self.sweeping);

        let report = self
            .mediator
            .clear_outstanding_async(self.config.min_age, self.config.batch_size)
            .await?;

        if let Some(retention) = self.config.purge_dispatched_after {
            let purged = self.mediator.purge_dispatched_async(retention).await?;
            if purged > 0 {
                debug!(purged, ?retention, "purged dispatched outbox entries");
            }
        }
        Ok(Some(report))
    }

    /// Sweep every `interval` until the handle is shut down.
    pub fn start(self: Arc<Self>) -> TaskHandle {
        info!(
            interval = ?self.config.interval,
            min_age = ?self.config.min_age,
            batch_size = self.config.batch_size,
            "starting outbox sweeper"
        );
        let interval = self.config.interval;
        spawn_periodic("outbox-sweeper", interval, move || {
            let sweeper = Arc::clone(&self);
            async move { sweeper.tick().await }
        })
    }

    async fn tick(&self) {
        match self.sweep().await {
            Ok(Some(report)) if report.total() > 0 => {
                if report.is_clean() {
                    info!(
                        dispatched = report.dispatched.len(),
                        skipped_tripped = report.skipped_tripped.len(),
                        "outbox sweep finished"
                    );
                } else {
                    warn!(
                        dispatched = report.dispatched.len(),
                        failed = report.failed.len(),
                        errored = report.errored.len(),
                        skipped_tripped = report.skipped_tripped.len(),
                        "outbox sweep left messages outstanding"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "outbox sweep failed"),
        }
    }
}
