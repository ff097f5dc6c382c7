//! Expiration Sweep Task
//!
//! Background task that periodically reclaims idle cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{sweep, Guarded};

/// Shortest cadence the sweep accepts.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running sweep task.
///
/// Dropping the handle closes the stop channel, which also ends the task at
/// its next wake.
#[derive(Debug)]
pub struct SweepHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Signals the task to stop and waits until it has exited.
    pub async fn shutdown(self) {
        // The receiver is gone only if the task already ended
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            warn!("Sweep task ended abnormally: {}", err);
        }
    }
}

/// Spawns the background sweep over `state`.
///
/// The task wakes every `interval`, takes the lock once, expires every due
/// entry and reclaims the idle ones. It exits when stopped through the
/// returned handle.
///
/// # Arguments
/// * `state` - Lock shared with the cache's owner
/// * `ttl` - Window granted to entries the sweep reschedules
/// * `interval` - Time between two passes
pub fn spawn_sweep_task<S: Guarded>(
    state: Arc<Mutex<S>>,
    ttl: Duration,
    interval: Duration,
) -> SweepHandle {
    let (stop, mut stopped) = oneshot::channel::<()>();
    let interval = interval.max(MIN_INTERVAL);

    let task = tokio::spawn(async move {
        debug!("Sweep task running with interval of {:?}", interval);

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = {
                        let mut guard = state.lock().await;
                        // Stamped under the lock, after any touch that held it
                        sweep(&mut *guard, ttl, Instant::now())
                    };

                    if outcome.reclaimed > 0 {
                        info!(
                            "Cache sweep: reclaimed {} of {} due entries",
                            outcome.reclaimed, outcome.processed
                        );
                    } else {
                        debug!("Cache sweep: {} due entries, none idle", outcome.processed);
                    }
                }
                _ = &mut stopped => {
                    debug!("Sweep task stopping");
                    break;
                }
            }
        }
    });

    SweepHandle { stop, task }
}
