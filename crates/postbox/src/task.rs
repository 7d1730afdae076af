//! Background periodic tasks.
//!
//! Sweepers run their tick on a fixed interval in a spawned tokio task and
//! stop through the returned [`TaskHandle`]. A tick that is running when
//! shutdown is requested finishes first; the loop exits before the next one.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest interval a periodic task runs at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a task started with [`spawn_periodic`].
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the task to stop and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            if e.is_panic() {
                tracing::error!(task = self.name, "periodic task panicked");
            }
        }
        info!(task = self.name, "periodic task stopped");
    }

    /// Stop the task at its next await point without waiting.
    pub fn abort(self) {
        self.join.abort();
    }
}

/// Run `tick` every `interval` until the handle is shut down.
///
/// An interval shorter than [`MIN_INTERVAL`] is raised to it.
///
/// The first tick fires immediately. Ticks never overlap within one task; a
/// slow tick delays the next rather than queueing extra ticks.
///
/// # Example
///
/// ```ignore
/// let handle = spawn_periodic("heartbeat", Duration::from_secs(1), || async {
///     tracing::info!("still alive");
/// });
/// handle.shutdown().await;
/// ```
pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if interval < MIN_INTERVAL {
        warn!(task = name, ?interval, min = ?MIN_INTERVAL, "interval too short, using the minimum");
    }
    let interval = interval.max(MIN_INTERVAL);
    let (shutdown, mut stop) = watch::channel(false);
    let join = tokio::spawn(async move {
        info!(task = name, ?interval, "periodic task started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(task = name, "periodic task received shutdown");
                        break;
                    }
                }
                _ = ticker.tick() => tick().await,
            }
        }
    });
    TaskHandle {
        name,
        shutdown,
        join,
    }
}
