use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Active,
    Tunneling,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Active => "active",
            ConnectionState::Tunneling => "tunneling",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        }
    }
}

/// Handle for one tracked connection
pub type ConnId = u64;

/// Ephemeral bookkeeping for a live connection. Never outlives its socket;
/// the terminal summary lands in the traffic record and domain stats instead.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: ConnId,
    pub client: String,
    pub destination: Option<String>,
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Live-connection table: one lock, one owner.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    next_id: Arc<AtomicU64>,
    connections: Arc<Mutex<HashMap<ConnId, ConnectionRecord>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    pub async fn open(&self, client: impl Into<String>) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let record = ConnectionRecord {
            id,
            client: client.into(),
            destination: None,
            state: ConnectionState::New,
            bytes_sent: 0,
            bytes_received: 0,
            opened_at: now,
            updated_at: now,
        };
        self.connections.lock().await.insert(id, record);
        id
    }

    pub async fn set_state(&self, id: ConnId, state: ConnectionState) {
        if let Some(record) = self.connections.lock().await.get_mut(&id) {
            record.state = state;
            record.updated_at = Utc::now();
        }
    }

    pub async fn set_destination(&self, id: ConnId, destination: impl Into<String>) {
        if let Some(record) = self.connections.lock().await.get_mut(&id) {
            record.destination = Some(destination.into());
            record.updated_at = Utc::now();
        }
    }

    pub async fn add_bytes(&self, id: ConnId, sent: u64, received: u64) {
        if let Some(record) = self.connections.lock().await.get_mut(&id) {
            record.bytes_sent += sent;
            record.bytes_received += received;
            record.updated_at = Utc::now();
        }
    }

    /// Remove the connection from the table. Unconditional: called from both
    /// success and error paths, so the table cannot leak entries.
    pub async fn close(&self, id: ConnId) {
        self.connections.lock().await.remove(&id);
    }

    /// Current state of a connection, if it is still tracked
    pub async fn state(&self, id: ConnId) -> Option<ConnectionState> {
        self.connections.lock().await.get(&id).map(|r| r.state)
    }

    /// Connections currently doing work (active or tunneling)
    pub async fn active_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    ConnectionState::Active | ConnectionState::Tunneling
                )
            })
            .count()
    }

    /// Total tracked connections in any state
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Snapshot of the live table for health reporting
    pub async fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.connections.lock().await.values().cloned().collect()
    }
}
