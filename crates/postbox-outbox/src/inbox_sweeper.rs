//! Periodic purge of expired inbox entries.

use std::sync::Arc;

use postbox_core::{spawn_periodic, AsyncInbox, AsyncInboxStore, InboxSweepConfig, Result, TaskHandle};
use tracing::{debug, error, info};

/// Removes inbox entries whose time-to-live has elapsed.
///
/// Housekeeping only: a duplicate arriving after its entry was purged is
/// handled again.
#[derive(Clone)]
pub struct InboxExpirySweeper {
    inbox: AsyncInbox,
    config: InboxSweepConfig,
}

impl InboxExpirySweeper {
    pub fn new(store: Arc<dyn AsyncInboxStore>, config: InboxSweepConfig) -> Self {
        Self {
            inbox: AsyncInbox::new(store),
            config,
        }
    }

    /// Purge now. Returns how many entries were removed.
    pub async fn sweep(&self) -> Result<usize> {
        let purged = self.inbox.purge_expired().await?;
        if purged > 0 {
            debug!(purged, "purged expired inbox entries");
        }
        Ok(purged)
    }

    pub fn start(self) -> TaskHandle {
        info!(interval = ?self.config.interval, "starting inbox expiry sweeper");
        let interval = self.config.interval;
        spawn_periodic("inbox-expiry-sweeper", interval, move || {
            let sweeper = self.clone();
            async move {
                if let Err(e) = sweeper.sweep().await {
                    error!(error = %e, "inbox expiry sweep failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for InboxExpirySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxExpirySweeper")
            .field("config", &self.config)
            .finish()
    }
}
