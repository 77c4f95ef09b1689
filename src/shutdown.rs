use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Graceful shutdown coordinator.
///
/// Every long-lived task (accept loop, metrics flush/drain, health loop,
/// monitoring server) subscribes for the signal and holds a [`TaskHandle`]
/// while doing work; `shutdown()` broadcasts, then waits for the active-task
/// count to reach zero within the grace period before returning.
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    active_tasks: Arc<AtomicUsize>,
    shutdown_initiated: Arc<AtomicBool>,
    grace: Duration,
}

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Drain in-flight work, then stop
    Graceful,
    /// Stop now; in-flight sockets are dropped
    Immediate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "GRACEFUL"),
            ShutdownSignal::Immediate => write!(f, "IMMEDIATE"),
        }
    }
}

/// RAII guard counting one active task
#[derive(Debug)]
pub struct TaskHandle {
    active_tasks: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl TaskHandle {
    fn new(active_tasks: Arc<AtomicUsize>) -> Self {
        active_tasks.fetch_add(1, Ordering::SeqCst);
        Self {
            active_tasks,
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ShutdownManager {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            active_tasks: Arc::new(AtomicUsize::new(0)),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            grace,
        }
    }

    /// Subscribe for the shutdown broadcast
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Track one unit of in-flight work for the grace-period wait
    pub fn task_handle(&self) -> TaskHandle {
        TaskHandle::new(Arc::clone(&self.active_tasks))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Broadcast the signal and, for a graceful shutdown, wait out the grace
    /// period for in-flight tasks. Idempotent.
    pub async fn shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already initiated");
            return;
        }

        info!(signal = %signal, "Initiating shutdown");
        // No receivers just means every task already exited
        let _ = self.shutdown_tx.send(signal);

        if matches!(signal, ShutdownSignal::Graceful) {
            self.wait_for_active_tasks().await;
        }

        let remaining = self.active_tasks();
        if remaining > 0 {
            warn!(remaining, "Forcing shutdown with tasks still active");
        } else {
            info!("Shutdown complete");
        }
    }

    async fn wait_for_active_tasks(&self) {
        let check_interval = Duration::from_millis(100);
        let deadline = Instant::now() + self.grace;

        while self.active_tasks() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    active = self.active_tasks(),
                    grace = ?self.grace,
                    "Grace period expired with tasks still active"
                );
                return;
            }
            sleep(check_interval).await;
        }
    }
}
