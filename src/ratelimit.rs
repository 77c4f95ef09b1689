use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// Per-client sliding-window admission control.
///
/// One mutex-guarded map owns all client windows; a window is a bounded
/// deque of admission timestamps. A rejected request records nothing, so a
/// client hammering the gateway cannot extend its own penalty.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<IpAddr, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit or reject a request from `client`. Safe to call concurrently
    /// from any number of connection tasks.
    pub async fn admit(&self, client: IpAddr) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let mut map = self.windows.lock().await;
        let entries = map.entry(client).or_default();

        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.config.max_requests {
            debug!(client = %client, "admission rejected: window full");
            return false;
        }

        entries.push_back(now);
        true
    }

    /// Drop clients whose whole window has expired. Called periodically so
    /// one-off clients do not accumulate forever.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let mut map = self.windows.lock().await;
        map.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|last| now.duration_since(*last) < window)
        });
    }

    /// Number of clients currently tracked
    pub async fn tracked_clients(&self) -> usize {
        self.windows.lock().await.len()
    }
}
