//! Background eviction of expired local windows.
//!
//! Purely a memory bound: expired entries are already ignored by the store,
//! so sweeping never changes a decision.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::local::LocalStore;

/// Lower bound on the sweep interval.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Pick a sweep interval: the smallest window, clamped to `[1s, max]`.
pub fn sweep_interval(smallest_window: Duration, max: Duration) -> Duration {
    smallest_window.clamp(MIN_INTERVAL, max.max(MIN_INTERVAL))
}

/// Periodically evicts expired entries from a [`LocalStore`].
pub struct Sweeper;

impl Sweeper {
    /// Start sweeping `store` every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<LocalStore>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(interval = ?interval, "Starting window sweeper");
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Window sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = store.sweep();
                        if evicted > 0 {
                            debug!(evicted = evicted, remaining = store.len(), "Swept expired windows");
                        }
                    }
                }
            }
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running sweeper. Dropping it also stops the sweeper.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
