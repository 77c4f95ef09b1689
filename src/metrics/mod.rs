//! Metrics collection with backpressure-safe persistence.
//!
//! Request-handling tasks never touch the store for metrics. `record()`
//! bumps in-process counters and enqueues named metric operations down an
//! unbounded channel; a background flush task batches them into one store
//! transaction per interval (or earlier when the batch grows past the
//! threshold). When the store refuses a batch it is parked in the bounded
//! [`MemoryQueue`] and a separate drain task retries it with backoff. The
//! snapshot keeps serving from in-process state when the store is down.

pub mod queue;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::error::QgateResult;
use crate::shutdown::ShutdownSignal;
use crate::storage::{DomainDelta, DomainStat, MetricOp, MetricSample, TrafficStore};
use crate::tracker::ConnectionTracker;

pub use queue::{MemoryQueue, MemoryQueueItem, QueuedKind};

/// Write-side seam between the collector and the persistent store
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn apply(&self, ops: &[MetricOp], domains: &[DomainDelta]) -> QgateResult<()>;

    async fn log_error(&self, source: &str, message: &str) -> QgateResult<()> {
        let _ = (source, message);
        Ok(())
    }

    async fn fetch_metrics(&self) -> QgateResult<Vec<MetricSample>> {
        Ok(Vec::new())
    }

    async fn top_domains(&self, limit: i64) -> QgateResult<Vec<DomainStat>> {
        let _ = limit;
        Ok(Vec::new())
    }
}

#[async_trait]
impl MetricsSink for TrafficStore {
    async fn apply(&self, ops: &[MetricOp], domains: &[DomainDelta]) -> QgateResult<()> {
        self.apply_metric_batch(ops, domains).await
    }

    async fn log_error(&self, source: &str, message: &str) -> QgateResult<()> {
        TrafficStore::log_error(self, source, message).await
    }

    async fn fetch_metrics(&self) -> QgateResult<Vec<MetricSample>> {
        TrafficStore::fetch_metrics(self).await
    }

    async fn top_domains(&self, limit: i64) -> QgateResult<Vec<DomainStat>> {
        TrafficStore::top_domains(self, limit).await
    }
}

/// What kind of exchange completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Http,
    Tunnel,
}

/// One completed exchange, as seen by the collector
#[derive(Debug, Clone)]
pub struct ExchangeEvent {
    pub domain: String,
    pub kind: ExchangeKind,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency_ms: f64,
    pub is_error: bool,
}

/// Requests turned away before any exchange happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    RateLimited,
    BadRequest,
    MethodNotAllowed,
    PayloadTooLarge,
}

impl RejectionKind {
    fn metric_name(&self) -> &'static str {
        match self {
            RejectionKind::RateLimited => "rate_limited_total",
            RejectionKind::BadRequest => "bad_requests_total",
            RejectionKind::MethodNotAllowed => "method_not_allowed_total",
            RejectionKind::PayloadTooLarge => "payload_too_large_total",
        }
    }
}

#[derive(Debug)]
enum QueuedUpdate {
    Metric(MetricOp),
    Domain(DomainDelta),
}

#[derive(Default)]
struct LocalCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    rate_limited: AtomicU64,
    tunnels: AtomicU64,
    http_requests: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Copy of the in-process counters, always available
#[derive(Debug, Clone, Serialize)]
pub struct ProcessCounters {
    pub requests: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub tunnels: u64,
    pub http_requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Point-in-time view for the monitoring surface
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: Vec<MetricSample>,
    pub top_domains: Vec<DomainStat>,
    pub active_connections: usize,
    pub memory_queue_depth: usize,
    pub dropped_updates: u64,
    pub store_available: bool,
    pub process: ProcessCounters,
}

struct CollectorInner {
    config: MetricsConfig,
    sink: Arc<dyn MetricsSink>,
    tracker: ConnectionTracker,
    overflow: Mutex<MemoryQueue>,
    counters: LocalCounters,
}

/// Handle used by request tasks and the monitoring surface
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
    tx: mpsc::UnboundedSender<QueuedUpdate>,
}

/// Owns the receive side; spawns the flush and drain tasks
pub struct MetricsWorker {
    inner: Arc<CollectorInner>,
    rx: mpsc::UnboundedReceiver<QueuedUpdate>,
}

/// Build the collector and its worker half
pub fn collector(
    config: MetricsConfig,
    sink: Arc<dyn MetricsSink>,
    tracker: ConnectionTracker,
) -> (MetricsCollector, MetricsWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inner = Arc::new(CollectorInner {
        overflow: Mutex::new(MemoryQueue::new(config.queue_capacity)),
        config,
        sink,
        tracker,
        counters: LocalCounters::default(),
    });

    (
        MetricsCollector {
            inner: Arc::clone(&inner),
            tx,
        },
        MetricsWorker { inner, rx },
    )
}

impl MetricsCollector {
    /// Record one completed exchange. Non-blocking: everything persistent
    /// goes through the flush queue.
    pub fn record(&self, event: &ExchangeEvent) {
        let counters = &self.inner.counters;
        counters.requests.fetch_add(1, Ordering::Relaxed);
        counters.bytes_sent.fetch_add(event.bytes_sent, Ordering::Relaxed);
        counters
            .bytes_received
            .fetch_add(event.bytes_received, Ordering::Relaxed);
        if event.is_error {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }

        let kind_metric = match event.kind {
            ExchangeKind::Http => {
                counters.http_requests.fetch_add(1, Ordering::Relaxed);
                "http_requests_total"
            }
            ExchangeKind::Tunnel => {
                counters.tunnels.fetch_add(1, Ordering::Relaxed);
                "tunnels_total"
            }
        };

        metrics::counter!("qgate_requests_total").increment(1);
        metrics::counter!("qgate_bytes_sent_total").increment(event.bytes_sent);
        metrics::counter!("qgate_bytes_received_total").increment(event.bytes_received);
        metrics::histogram!("qgate_exchange_duration_ms").record(event.latency_ms);
        if event.is_error {
            metrics::counter!("qgate_errors_total").increment(1);
        }

        let mut ops = vec![
            MetricOp::Increment {
                name: "total_requests".to_string(),
                value: 1.0,
            },
            MetricOp::Increment {
                name: kind_metric.to_string(),
                value: 1.0,
            },
            MetricOp::Increment {
                name: "total_bytes_sent".to_string(),
                value: event.bytes_sent as f64,
            },
            MetricOp::Increment {
                name: "total_bytes_received".to_string(),
                value: event.bytes_received as f64,
            },
        ];
        if event.is_error {
            ops.push(MetricOp::Increment {
                name: "total_errors".to_string(),
                value: 1.0,
            });
        }

        for op in ops {
            let _ = self.tx.send(QueuedUpdate::Metric(op));
        }
        let _ = self.tx.send(QueuedUpdate::Domain(DomainDelta {
            domain: event.domain.clone(),
            bytes_sent: event.bytes_sent as i64,
            bytes_received: event.bytes_received as i64,
            latency_ms: event.latency_ms,
            is_error: event.is_error,
            seen_at: chrono::Utc::now(),
        }));
    }

    /// Count a request rejected before any exchange (taxonomy: counted, not
    /// logged as an error)
    pub fn record_rejection(&self, kind: RejectionKind) {
        if matches!(kind, RejectionKind::RateLimited) {
            self.inner
                .counters
                .rate_limited
                .fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            "qgate_rejected_total",
            &[("kind", String::from(kind.metric_name()))]
        )
        .increment(1);
        let _ = self.tx.send(QueuedUpdate::Metric(MetricOp::Increment {
            name: kind.metric_name().to_string(),
            value: 1.0,
        }));
    }

    /// Current overflow-queue depth
    pub async fn memory_queue_depth(&self) -> usize {
        self.inner.overflow.lock().await.depth()
    }

    /// Total updates dropped by the bounded overflow queue
    pub async fn dropped_updates(&self) -> u64 {
        self.inner.overflow.lock().await.dropped()
    }

    /// Read everything the monitoring surface needs. Degrades to in-process
    /// counters when the store is unreachable instead of failing.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let (metrics, top_domains, store_available) =
            match self.inner.sink.fetch_metrics().await {
                Ok(metrics) => match self.inner.sink.top_domains(10).await {
                    Ok(domains) => (metrics, domains, true),
                    Err(_) => (metrics, Vec::new(), false),
                },
                Err(_) => (Vec::new(), Vec::new(), false),
            };

        let active_connections = self.inner.tracker.active_count().await;
        let overflow = self.inner.overflow.lock().await;
        let counters = &self.inner.counters;

        MetricsSnapshot {
            metrics,
            top_domains,
            active_connections,
            memory_queue_depth: overflow.depth(),
            dropped_updates: overflow.dropped(),
            store_available,
            process: ProcessCounters {
                requests: counters.requests.load(Ordering::Relaxed),
                errors: counters.errors.load(Ordering::Relaxed),
                rate_limited: counters.rate_limited.load(Ordering::Relaxed),
                tunnels: counters.tunnels.load(Ordering::Relaxed),
                http_requests: counters.http_requests.load(Ordering::Relaxed),
                bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
                bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            },
        }
    }
}

impl MetricsWorker {
    /// Spawn the flush and drain loops. Both stop on the shutdown broadcast
    /// and are joined by the caller.
    pub fn spawn(
        self,
        flush_shutdown: broadcast::Receiver<ShutdownSignal>,
        drain_shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let MetricsWorker { inner, rx } = self;
        let flush = tokio::spawn(flush_loop(Arc::clone(&inner), rx, flush_shutdown));
        let drain = tokio::spawn(drain_loop(inner, drain_shutdown));
        (flush, drain)
    }
}

async fn flush_loop(
    inner: Arc<CollectorInner>,
    mut rx: mpsc::UnboundedReceiver<QueuedUpdate>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let mut tick = interval(Duration::from_secs(inner.config.flush_interval));
    let mut ops: Vec<MetricOp> = Vec::new();
    let mut domains: Vec<DomainDelta> = Vec::new();

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(QueuedUpdate::Metric(op)) => {
                    ops.push(op);
                    if ops.len() + domains.len() >= inner.config.flush_threshold {
                        flush_batch(&inner, &mut ops, &mut domains).await;
                    }
                }
                Some(QueuedUpdate::Domain(delta)) => {
                    domains.push(delta);
                    if ops.len() + domains.len() >= inner.config.flush_threshold {
                        flush_batch(&inner, &mut ops, &mut domains).await;
                    }
                }
                None => {
                    flush_batch(&inner, &mut ops, &mut domains).await;
                    break;
                }
            },
            _ = tick.tick() => {
                flush_batch(&inner, &mut ops, &mut domains).await;
            }
            _ = shutdown.recv() => {
                // Pick up whatever was enqueued before the signal
                while let Ok(update) = rx.try_recv() {
                    match update {
                        QueuedUpdate::Metric(op) => ops.push(op),
                        QueuedUpdate::Domain(delta) => domains.push(delta),
                    }
                }
                flush_batch(&inner, &mut ops, &mut domains).await;
                debug!("Metrics flush loop stopped");
                break;
            }
        }
    }
}

async fn flush_batch(
    inner: &CollectorInner,
    ops: &mut Vec<MetricOp>,
    domains: &mut Vec<DomainDelta>,
) {
    if ops.is_empty() && domains.is_empty() {
        return;
    }

    // Fresh gauge rides along with every batch
    ops.push(MetricOp::Set {
        name: "active_connections".to_string(),
        value: inner.tracker.active_count().await as f64,
    });

    let batch_ops = std::mem::take(ops);
    let batch_domains = std::mem::take(domains);

    match inner.sink.apply(&batch_ops, &batch_domains).await {
        Ok(()) => {
            debug!(
                ops = batch_ops.len(),
                domains = batch_domains.len(),
                "Flushed metric batch"
            );
        }
        Err(err) => {
            warn!(error = %err, "Metric flush failed, parking batch in memory queue");
            let mut overflow = inner.overflow.lock().await;
            overflow.push_ops(&batch_ops);
            overflow.push_domains(&batch_domains);
            metrics::gauge!("qgate_memory_queue_depth").set(overflow.depth() as f64);
            drop(overflow);
            // Best effort; the store that just failed will usually refuse this too
            let _ = inner
                .sink
                .log_error("metrics_flush", &err.to_string())
                .await;
        }
    }
}

async fn drain_loop(inner: Arc<CollectorInner>, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
    let mut tick = interval(Duration::from_secs(inner.config.drain_interval));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                drain_once(&inner).await;
            }
            _ = shutdown.recv() => {
                drain_once(&inner).await;
                debug!("Memory queue drain loop stopped");
                break;
            }
        }
    }
}

/// Move as much of the overflow queue back into the store as the retry
/// budget allows. Chunks keep transactions small; a failed chunk goes back
/// to the front so ordering and the bound are preserved.
async fn drain_once(inner: &CollectorInner) {
    loop {
        let (items, domains) = {
            let mut overflow = inner.overflow.lock().await;
            if overflow.is_empty() {
                return;
            }
            overflow.take_front(256)
        };

        let ops: Vec<MetricOp> = items.iter().map(MemoryQueueItem::to_op).collect();
        let mut applied = false;

        for attempt in 0..inner.config.drain_max_retries {
            match inner.sink.apply(&ops, &domains).await {
                Ok(()) => {
                    applied = true;
                    break;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Memory queue drain attempt failed");
                    sleep(Duration::from_millis(100 * (1 << attempt))).await;
                }
            }
        }

        if applied {
            let depth = inner.overflow.lock().await.depth();
            metrics::gauge!("qgate_memory_queue_depth").set(depth as f64);
            debug!(ops = ops.len(), domains = domains.len(), "Drained memory queue chunk");
        } else {
            let mut overflow = inner.overflow.lock().await;
            overflow.requeue_front(items, domains);
            let depth = overflow.depth();
            drop(overflow);
            warn!(depth, "Memory queue drain exhausted retries, will retry next tick");
            return;
        }
    }
}
