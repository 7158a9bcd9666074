//! Periodic pool occupancy reporting

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::registry::PoolRegistry;

/// Logs the registry's pool report at a fixed interval until the returned
/// sender is dropped or sends `true`.
pub fn spawn_stats_reporter(
    registry: Arc<PoolRegistry>,
    interval: Duration,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!(report = %registry.report(), "pool statistics");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    (shutdown_tx, handle)
}
