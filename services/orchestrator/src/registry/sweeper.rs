//! Periodic dead-engine sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::EngineRegistry;

/// Run `cleanup_dead_engines` every `interval` until shutdown.
pub async fn run_cleanup_loop(
    registry: Arc<EngineRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs_f64(), "Starting registry cleanup loop");

    let period = interval.max(Duration::from_millis(1));
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let removed = registry.cleanup_dead_engines();
                if removed > 0 {
                    info!(removed, remaining = registry.len(), "Registry cleanup removed engines");
                } else {
                    debug!(remaining = registry.len(), "Registry cleanup found nothing to remove");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Registry cleanup loop shutting down");
                    break;
                }
            }
        }
    }
}
