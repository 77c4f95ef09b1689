use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Metrics batching and overflow-queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Seconds between background flushes of queued metric updates
    pub flush_interval: u64,
    /// Queued updates that trigger an early flush
    pub flush_threshold: usize,
    /// Capacity of the in-memory overflow queue
    pub queue_capacity: usize,
    /// Seconds between attempts to drain the overflow queue
    pub drain_interval: u64,
    /// Attempts per drain cycle before giving up until the next tick
    pub drain_max_retries: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval: 5,
            flush_threshold: 256,
            queue_capacity: 4096,
            drain_interval: 10,
            drain_max_retries: 3,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.flush_interval == 0 {
            return Err(anyhow::anyhow!(
                "Metrics flush_interval must be greater than 0"
            ));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!(
                "Metrics queue_capacity must be greater than 0"
            ));
        }
        if self.drain_interval == 0 {
            return Err(anyhow::anyhow!(
                "Metrics drain_interval must be greater than 0"
            ));
        }
        Ok(())
    }
}

/// Monitoring endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    pub health_endpoint: String,
    pub metrics_endpoint: String,
    /// Seconds between health-check snapshots written to the store
    pub health_interval: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8081".parse().unwrap(),
            health_endpoint: "/health".to_string(),
            metrics_endpoint: "/metrics".to_string(),
            health_interval: 30,
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.health_endpoint.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Health endpoint must start with '/': {}",
                self.health_endpoint
            ));
        }

        if !self.metrics_endpoint.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Metrics endpoint must start with '/': {}",
                self.metrics_endpoint
            ));
        }

        if self.health_interval == 0 {
            return Err(anyhow::anyhow!(
                "Monitoring health_interval must be greater than 0"
            ));
        }

        Ok(())
    }
}
