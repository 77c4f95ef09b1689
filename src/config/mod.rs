//! Configuration management for the qgate gateway.
//!
//! TOML configuration files with `${VAR}` / `${VAR:-default}` environment
//! variable expansion, defaults applied after parsing, and validation before
//! the server starts. Every externally observable knob (bind address, store
//! URL, rate-limit threshold, connection bounds, timeouts) lives here; the
//! rest of the code takes configuration, it never invents it.

pub mod metrics;
pub mod routing;
pub mod server;
pub mod storage;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{info, warn};

pub use metrics::{MetricsConfig, MonitoringConfig};
pub use routing::{RoutingConfig, TopologyEntry};
pub use server::{RateLimitConfig, ServerConfig};
pub use storage::{ProofConfig, StorageConfig};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub proof: ProofConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_defaults();
        config.validate()?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Load configuration from a TOML file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let expanded_content = expand_env_vars(&content);
        let mut config: Config = toml::from_str(&expanded_content)?;

        config.apply_defaults();
        config.validate()?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Apply default values where the file left gaps
    fn apply_defaults(&mut self) {
        let defaults = ServerConfig::default();
        if self.server.max_connections.is_none() {
            self.server.max_connections = defaults.max_connections;
        }
        if self.server.read_timeout.is_none() {
            self.server.read_timeout = defaults.read_timeout;
        }
        if self.server.connect_timeout.is_none() {
            self.server.connect_timeout = defaults.connect_timeout;
        }
        if self.server.request_timeout.is_none() {
            self.server.request_timeout = defaults.request_timeout;
        }
        if self.server.tunnel_idle_timeout.is_none() {
            self.server.tunnel_idle_timeout = defaults.tunnel_idle_timeout;
        }
        if self.server.max_request_bytes.is_none() {
            self.server.max_request_bytes = defaults.max_request_bytes;
        }
        if self.server.shutdown_grace.is_none() {
            self.server.shutdown_grace = defaults.shutdown_grace;
        }

        if self.storage.max_connections.is_none() {
            self.storage.max_connections = Some(10);
        }
        if self.storage.busy_retries.is_none() {
            self.storage.busy_retries = Some(3);
        }
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.storage.validate()?;
        self.rate_limit.validate()?;
        self.routing.validate()?;
        self.metrics.validate()?;
        self.monitoring.validate()?;
        self.proof.validate()?;

        if !self.rate_limit.enabled {
            warn!("Rate limiting is disabled - all clients are admitted");
        }

        if self.routing.topology.is_none() {
            info!("No topology configured - route selection will be simulated");
        }

        if self.monitoring.enabled && self.monitoring.bind == self.server.bind {
            return Err(anyhow::anyhow!(
                "Monitoring bind address collides with the proxy bind address: {}",
                self.server.bind
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in configuration content.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_expr = &result[start + 2..start + end];
            let replacement = if let Some(default_pos) = var_expr.find(":-") {
                let var_name = &var_expr[..default_pos];
                let default_value = &var_expr[default_pos + 2..];
                env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            } else {
                env::var(var_expr).unwrap_or_default()
            };
            result.replace_range(start..start + end + 1, &replacement);
        } else {
            break;
        }
    }

    result
}
