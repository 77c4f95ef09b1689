use serde::{Deserialize, Serialize};

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind: std::net::SocketAddr,
    /// Upper bound on concurrently served connections
    pub max_connections: Option<usize>,
    /// Seconds allowed for reading the request head
    pub read_timeout: Option<u64>,
    /// Seconds allowed for dialing an upstream destination
    pub connect_timeout: Option<u64>,
    /// Seconds allowed for a full plain-HTTP exchange
    pub request_timeout: Option<u64>,
    /// Seconds a CONNECT tunnel may sit idle before being torn down
    pub tunnel_idle_timeout: Option<u64>,
    /// Largest accepted request body, in bytes
    pub max_request_bytes: Option<u64>,
    /// Grace period for in-flight work during shutdown, in seconds
    pub shutdown_grace: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".parse().unwrap(),
            max_connections: Some(1024),
            read_timeout: Some(30),
            connect_timeout: Some(10),
            request_timeout: Some(60),
            tunnel_idle_timeout: Some(300),
            max_request_bytes: Some(16 * 1024 * 1024),
            shutdown_grace: Some(30),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(max_connections) = self.max_connections {
            if max_connections == 0 {
                return Err(anyhow::anyhow!(
                    "Server max_connections must be greater than 0"
                ));
            }
        }

        for (name, value) in [
            ("read_timeout", self.read_timeout),
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("tunnel_idle_timeout", self.tunnel_idle_timeout),
        ] {
            if value == Some(0) {
                return Err(anyhow::anyhow!("Server {} must be greater than 0", name));
            }
        }

        Ok(())
    }
}

/// Per-client admission control configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests admitted per client IP per window
    pub max_requests: usize,
    /// Sliding window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled {
            if self.max_requests == 0 {
                return Err(anyhow::anyhow!(
                    "Rate limit max_requests must be greater than 0"
                ));
            }
            if self.window_secs == 0 {
                return Err(anyhow::anyhow!(
                    "Rate limit window_secs must be greater than 0"
                ));
            }
        }
        Ok(())
    }
}
