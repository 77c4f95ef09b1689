use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::metrics::MetricsCollector;
use crate::shutdown::ShutdownSignal;
use crate::storage::TrafficStore;
use crate::tracker::ConnectionTracker;

/// Periodic health loop: probe the store, persist a health-check row and
/// refresh the active-connections snapshot. A failing tick is logged and
/// retried on the next one; the loop itself never dies early.
pub fn spawn_health_loop(
    store: TrafficStore,
    tracker: ConnectionTracker,
    collector: MetricsCollector,
    interval_secs: u64,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    run_health_check(&store, &tracker, &collector).await;
                }
                _ = shutdown.recv() => {
                    debug!("Health loop stopped");
                    break;
                }
            }
        }
    })
}

async fn run_health_check(
    store: &TrafficStore,
    tracker: &ConnectionTracker,
    collector: &MetricsCollector,
) {
    let store_ok = store.ping().await.is_ok();
    let active = tracker.active_count().await;
    let queue_depth = collector.memory_queue_depth().await;
    let dropped = collector.dropped_updates().await;

    metrics::gauge!("qgate_active_connections").set(active as f64);
    metrics::gauge!("qgate_memory_queue_depth").set(queue_depth as f64);
    metrics::gauge!("qgate_store_available").set(if store_ok { 1.0 } else { 0.0 });

    if !store_ok {
        warn!(queue_depth, "Health check: store unreachable");
        return;
    }

    if let Err(err) = store
        .replace_active_connections(&tracker.snapshot().await)
        .await
    {
        warn!(error = %err, "Failed to refresh active-connections snapshot");
    }

    if let Err(err) = store
        .record_health(store_ok, active, queue_depth, dropped)
        .await
    {
        warn!(error = %err, "Failed to persist health check");
    } else {
        debug!(active, queue_depth, "Health check recorded");
    }
}

/// Shared by monitoring tests and the health loop
pub async fn store_status(store: &TrafficStore) -> &'static str {
    if store.ping().await.is_ok() {
        "healthy"
    } else {
        "degraded"
    }
}
