//! Periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lifecycle::LifecycleManager;

/// Run [`LifecycleManager::sweep`] every `period` until `cancel` fires.
///
/// Expiry is also enforced lazily on join and update, so the sweep only
/// bounds how long an idle expired session goes unannounced.
pub fn spawn_sweeper(
    lifecycle: Arc<LifecycleManager>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = lifecycle.sweep();
                }
                () = cancel.cancelled() => {
                    debug!("session sweeper stopped");
                    return;
                }
            }
        }
    })
}
