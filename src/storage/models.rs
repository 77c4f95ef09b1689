use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pending traffic record, created when the request line has been parsed
/// and before any network work starts. Completion happens exactly once via
/// [`CompletedExchange`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub client_addr: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub protocol: String,
    /// Header snapshot as a JSON object
    pub headers: serde_json::Value,
    pub waypoints: Vec<u32>,
    pub strategy: String,
    pub routing_cost_ms: f64,
    pub classical_estimate_ms: f64,
    pub quantum_advantage: f64,
}

/// Terminal outcome of one proxied exchange, applied as a single
/// UPDATE-by-id against the pending record.
#[derive(Debug, Clone, Default)]
pub struct CompletedExchange {
    pub status: Option<u16>,
    pub response_size: Option<i64>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub duration_ms: i64,
    pub proof_root: Option<String>,
    pub proof_signature: Option<String>,
    pub error_message: Option<String>,
}

impl CompletedExchange {
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Metric mutation queued by the collector and applied in batches
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOp {
    Increment { name: String, value: f64 },
    Set { name: String, value: f64 },
}

impl MetricOp {
    pub fn name(&self) -> &str {
        match self {
            MetricOp::Increment { name, .. } | MetricOp::Set { name, .. } => name,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            MetricOp::Increment { value, .. } | MetricOp::Set { value, .. } => *value,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MetricOp::Increment { .. } => "counter",
            MetricOp::Set { .. } => "gauge",
        }
    }

    /// Display unit, derived from the metric name convention
    pub fn unit(&self) -> &'static str {
        let name = self.name();
        if name.contains("bytes") {
            "bytes"
        } else if name.ends_with("_ms") {
            "ms"
        } else {
            "count"
        }
    }
}

/// Stored metric row
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub kind: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-exchange contribution to a domain's aggregate row
#[derive(Debug, Clone)]
pub struct DomainDelta {
    pub domain: String,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub latency_ms: f64,
    pub is_error: bool,
    pub seen_at: DateTime<Utc>,
}

/// Condensed view of a stored traffic record
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: i64,
    pub host: String,
    pub method: String,
    pub strategy: String,
    pub status_code: Option<u16>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub duration_ms: i64,
    pub proof_signature: Option<String>,
    pub error: bool,
    pub error_message: Option<String>,
    pub completed: bool,
}

/// Aggregated per-domain statistics row
#[derive(Debug, Clone, Serialize)]
pub struct DomainStat {
    pub domain: String,
    pub request_count: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub min_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub error_count: i64,
    pub last_seen: DateTime<Utc>,
}
