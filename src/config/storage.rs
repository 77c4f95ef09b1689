use serde::{Deserialize, Serialize};

/// Persistent store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// sqlx connection URL, e.g. `sqlite:data/traffic.db`
    pub url: String,
    pub max_connections: Option<u32>,
    pub connect_timeout: Option<u64>,
    /// Retry budget for "database is locked" conditions
    pub busy_retries: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/traffic.db".to_string(),
            max_connections: Some(10),
            connect_timeout: Some(30),
            busy_retries: Some(3),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("Storage URL cannot be empty"));
        }
        if self.max_connections == Some(0) {
            return Err(anyhow::anyhow!(
                "Storage max_connections must be greater than 0"
            ));
        }
        Ok(())
    }

    /// In-memory SQLite keeps its state per connection; a pool of several
    /// connections would see several unrelated databases.
    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Signing configuration for exchange provenance proofs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProofConfig {
    /// Secret mixed into the proof signature
    pub secret: String,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            secret: "qgate-dev-secret".to_string(),
        }
    }
}

impl ProofConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secret.is_empty() {
            return Err(anyhow::anyhow!("Proof secret cannot be empty"));
        }
        Ok(())
    }
}
