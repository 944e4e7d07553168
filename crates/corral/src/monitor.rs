//! Per-session heartbeat monitor.
//!
//! Ticks on a fixed interval and flags the host overdue when its last
//! inbound message is older than the threshold. The monitor never tears the
//! session down; it only surfaces staleness so host selection and external
//! observers can react. Cleanup stays with the session's teardown path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::HostRegistry;

pub(crate) fn spawn_overdue_monitor(
    registry: Arc<HostRegistry>,
    host_id: String,
    session_id: Uuid,
    check_interval: Duration,
    overdue_threshold: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick fires immediately

        debug!(host_id, "heartbeat monitor started (interval: {check_interval:?})");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if registry.mark_overdue_if_stale(&host_id, session_id, overdue_threshold) {
                        warn!(
                            host_id,
                            threshold_secs = overdue_threshold.as_secs(),
                            "host heartbeat overdue"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!(host_id, "heartbeat monitor shutting down");
                    break;
                }
            }
        }
    })
}
