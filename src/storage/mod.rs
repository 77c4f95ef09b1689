//! Persistence layer for traffic records, metrics, domain statistics and
//! operational bookkeeping.
//!
//! The store owns the `SqlitePool` and exposes insert/update/select
//! primitives; no other component touches SQL. "Database is locked" is a
//! retryable condition here, never a fatal one.

pub mod models;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{QgateError, QgateResult};
use crate::tracker::ConnectionRecord;

pub use models::{
    CompletedExchange, DomainDelta, DomainStat, MetricOp, MetricSample, RecordSummary,
    TrafficRecord,
};

/// Transactional store for all persisted gateway state
#[derive(Clone)]
pub struct TrafficStore {
    pool: SqlitePool,
    busy_retries: u32,
}

impl TrafficStore {
    /// Connect and create the schema if it does not exist yet
    pub async fn connect(config: &StorageConfig) -> QgateResult<Self> {
        // A :memory: database lives inside its one connection; pooling more
        // than one would split state across invisible databases.
        let max_connections = if config.is_memory() {
            1
        } else {
            config.max_connections.unwrap_or(10)
        };

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| QgateError::config(format!("invalid storage URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.connect_timeout.unwrap_or(30)));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            busy_retries: config.busy_retries.unwrap_or(3),
        };
        store.migrate().await?;
        info!("Traffic store ready at {}", config.url);
        Ok(store)
    }

    async fn migrate(&self) -> QgateResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS traffic_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                timestamp DATETIME NOT NULL,
                client_addr TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                protocol TEXT NOT NULL,
                headers TEXT NOT NULL,
                waypoints TEXT NOT NULL,
                strategy TEXT NOT NULL,
                routing_cost_ms REAL NOT NULL,
                classical_estimate_ms REAL NOT NULL,
                quantum_advantage REAL NOT NULL,
                status_code INTEGER,
                response_size INTEGER,
                bytes_sent INTEGER,
                bytes_received INTEGER,
                duration_ms INTEGER,
                proof_root TEXT,
                proof_signature TEXT,
                error INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_traffic_log_timestamp ON traffic_log(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_traffic_log_host ON traffic_log(host)",
            "CREATE INDEX IF NOT EXISTS idx_traffic_log_status ON traffic_log(status_code)",
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                name TEXT PRIMARY KEY,
                value REAL NOT NULL,
                unit TEXT NOT NULL,
                kind TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS domain_stats (
                domain TEXT PRIMARY KEY,
                request_count INTEGER NOT NULL DEFAULT 0,
                bytes_sent INTEGER NOT NULL DEFAULT 0,
                bytes_received INTEGER NOT NULL DEFAULT 0,
                min_latency_ms REAL NOT NULL DEFAULT 0,
                avg_latency_ms REAL NOT NULL DEFAULT 0,
                max_latency_ms REAL NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_seen DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS active_connections (
                conn_id INTEGER PRIMARY KEY,
                client_addr TEXT NOT NULL,
                destination TEXT,
                state TEXT NOT NULL,
                bytes_sent INTEGER NOT NULL,
                bytes_received INTEGER NOT NULL,
                opened_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS error_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS health_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME NOT NULL,
                store_ok INTEGER NOT NULL,
                active_connections INTEGER NOT NULL,
                memory_queue_depth INTEGER NOT NULL,
                dropped_updates INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Retry an operation while the store reports busy/locked
    async fn retrying<T, F, Fut>(&self, operation: F) -> QgateResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = QgateResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Err(err @ QgateError::DatabaseBusy { .. }) if attempt < self.busy_retries => {
                    attempt += 1;
                    debug!(attempt, "store busy, retrying");
                    sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Insert a pending traffic record; returns its monotonic id
    pub async fn insert_pending(&self, record: &TrafficRecord) -> QgateResult<i64> {
        let pool = self.pool.clone();
        let record = record.clone();
        self.retrying(move || {
            let pool = pool.clone();
            let record = record.clone();
            async move {
                let result = sqlx::query(
                    r#"
                    INSERT INTO traffic_log
                    (request_id, timestamp, client_addr, method, url, host, path, protocol,
                     headers, waypoints, strategy, routing_cost_ms, classical_estimate_ms,
                     quantum_advantage)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(record.request_id.to_string())
                .bind(record.timestamp)
                .bind(&record.client_addr)
                .bind(&record.method)
                .bind(&record.url)
                .bind(&record.host)
                .bind(&record.path)
                .bind(&record.protocol)
                .bind(record.headers.to_string())
                .bind(serde_json::to_string(&record.waypoints)?)
                .bind(&record.strategy)
                .bind(record.routing_cost_ms)
                .bind(record.classical_estimate_ms)
                .bind(record.quantum_advantage)
                .execute(&pool)
                .await?;
                Ok(result.last_insert_rowid())
            }
        })
        .await
    }

    /// Apply the terminal outcome to a pending record. Exactly one UPDATE by
    /// id; a second call flips nothing because `completed` is part of the
    /// WHERE clause.
    pub async fn complete_record(&self, id: i64, outcome: &CompletedExchange) -> QgateResult<()> {
        let pool = self.pool.clone();
        let outcome = outcome.clone();
        self.retrying(move || {
            let pool = pool.clone();
            let outcome = outcome.clone();
            async move {
                let result = sqlx::query(
                    r#"
                    UPDATE traffic_log SET
                        status_code = ?,
                        response_size = ?,
                        bytes_sent = ?,
                        bytes_received = ?,
                        duration_ms = ?,
                        proof_root = ?,
                        proof_signature = ?,
                        error = ?,
                        error_message = ?,
                        completed = 1
                    WHERE id = ? AND completed = 0
                    "#,
                )
                .bind(outcome.status.map(|s| s as i64))
                .bind(outcome.response_size)
                .bind(outcome.bytes_sent)
                .bind(outcome.bytes_received)
                .bind(outcome.duration_ms)
                .bind(&outcome.proof_root)
                .bind(&outcome.proof_signature)
                .bind(outcome.is_error() as i64)
                .bind(&outcome.error_message)
                .bind(id)
                .execute(&pool)
                .await?;

                if result.rows_affected() == 0 {
                    warn!(record = id, "complete_record matched no pending row");
                }
                Ok(())
            }
        })
        .await
    }

    /// Apply a batch of metric operations plus domain-stat upserts in one
    /// transaction. All-or-nothing keeps the domain/metric sum invariant.
    pub async fn apply_metric_batch(
        &self,
        ops: &[MetricOp],
        domains: &[DomainDelta],
    ) -> QgateResult<()> {
        let pool = self.pool.clone();
        let ops = ops.to_vec();
        let domains = domains.to_vec();
        self.retrying(move || {
            let pool = pool.clone();
            let ops = ops.clone();
            let domains = domains.clone();
            async move {
                let mut tx = pool.begin().await?;
                let now = Utc::now();

                for op in &ops {
                    match op {
                        MetricOp::Increment { name, value } => {
                            sqlx::query(
                                r#"
                                INSERT INTO metrics (name, value, unit, kind, updated_at)
                                VALUES (?, ?, ?, 'counter', ?)
                                ON CONFLICT(name) DO UPDATE SET
                                    value = value + excluded.value,
                                    updated_at = excluded.updated_at
                                "#,
                            )
                            .bind(name)
                            .bind(value)
                            .bind(op.unit())
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                        }
                        MetricOp::Set { name, value } => {
                            sqlx::query(
                                r#"
                                INSERT INTO metrics (name, value, unit, kind, updated_at)
                                VALUES (?, ?, ?, 'gauge', ?)
                                ON CONFLICT(name) DO UPDATE SET
                                    value = excluded.value,
                                    updated_at = excluded.updated_at
                                "#,
                            )
                            .bind(name)
                            .bind(value)
                            .bind(op.unit())
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                        }
                    }
                }

                for delta in &domains {
                    sqlx::query(
                        r#"
                        INSERT INTO domain_stats
                        (domain, request_count, bytes_sent, bytes_received,
                         min_latency_ms, avg_latency_ms, max_latency_ms, error_count, last_seen)
                        VALUES (?, 1, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(domain) DO UPDATE SET
                            request_count = request_count + 1,
                            bytes_sent = bytes_sent + excluded.bytes_sent,
                            bytes_received = bytes_received + excluded.bytes_received,
                            min_latency_ms = MIN(min_latency_ms, excluded.min_latency_ms),
                            avg_latency_ms = (avg_latency_ms * request_count + excluded.avg_latency_ms)
                                             / (request_count + 1),
                            max_latency_ms = MAX(max_latency_ms, excluded.max_latency_ms),
                            error_count = error_count + excluded.error_count,
                            last_seen = excluded.last_seen
                        "#,
                    )
                    .bind(&delta.domain)
                    .bind(delta.bytes_sent)
                    .bind(delta.bytes_received)
                    .bind(delta.latency_ms)
                    .bind(delta.latency_ms)
                    .bind(delta.latency_ms)
                    .bind(delta.is_error as i64)
                    .bind(delta.seen_at)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// All stored metric samples
    pub async fn fetch_metrics(&self) -> QgateResult<Vec<MetricSample>> {
        let rows = sqlx::query("SELECT name, value, unit, kind, updated_at FROM metrics ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| MetricSample {
                name: row.get("name"),
                value: row.get("value"),
                unit: row.get("unit"),
                kind: row.get("kind"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// One stored metric by name, if present
    pub async fn fetch_metric(&self, name: &str) -> QgateResult<Option<f64>> {
        let row = sqlx::query("SELECT value FROM metrics WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Highest-traffic domains, by request count
    pub async fn top_domains(&self, limit: i64) -> QgateResult<Vec<DomainStat>> {
        let rows = sqlx::query(
            r#"
            SELECT domain, request_count, bytes_sent, bytes_received,
                   min_latency_ms, avg_latency_ms, max_latency_ms, error_count, last_seen
            FROM domain_stats
            ORDER BY request_count DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DomainStat {
                domain: row.get("domain"),
                request_count: row.get("request_count"),
                bytes_sent: row.get("bytes_sent"),
                bytes_received: row.get("bytes_received"),
                min_latency_ms: row.get("min_latency_ms"),
                avg_latency_ms: row.get("avg_latency_ms"),
                max_latency_ms: row.get("max_latency_ms"),
                error_count: row.get("error_count"),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    /// Append an internal error-log entry
    pub async fn log_error(&self, source: &str, message: &str) -> QgateResult<()> {
        sqlx::query("INSERT INTO error_log (timestamp, source, message) VALUES (?, ?, ?)")
            .bind(Utc::now())
            .bind(source)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a periodic health-check row
    pub async fn record_health(
        &self,
        store_ok: bool,
        active_connections: usize,
        memory_queue_depth: usize,
        dropped_updates: u64,
    ) -> QgateResult<()> {
        sqlx::query(
            r#"
            INSERT INTO health_checks
            (timestamp, store_ok, active_connections, memory_queue_depth, dropped_updates)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(store_ok as i64)
        .bind(active_connections as i64)
        .bind(memory_queue_depth as i64)
        .bind(dropped_updates as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the active-connections snapshot with the current live table
    pub async fn replace_active_connections(
        &self,
        snapshot: &[ConnectionRecord],
    ) -> QgateResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM active_connections")
            .execute(&mut *tx)
            .await?;

        for record in snapshot {
            sqlx::query(
                r#"
                INSERT INTO active_connections
                (conn_id, client_addr, destination, state, bytes_sent, bytes_received,
                 opened_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id as i64)
            .bind(&record.client)
            .bind(&record.destination)
            .bind(record.state.as_str())
            .bind(record.bytes_sent as i64)
            .bind(record.bytes_received as i64)
            .bind(record.opened_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Most recent traffic records, newest first
    pub async fn recent_records(&self, limit: i64) -> QgateResult<Vec<RecordSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, host, method, strategy, status_code, bytes_sent, bytes_received,
                   duration_ms, proof_signature, error, error_message, completed
            FROM traffic_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RecordSummary {
                id: row.get("id"),
                host: row.get("host"),
                method: row.get("method"),
                strategy: row.get("strategy"),
                status_code: row.get::<Option<i64>, _>("status_code").map(|s| s as u16),
                bytes_sent: row.get::<Option<i64>, _>("bytes_sent").unwrap_or(0),
                bytes_received: row.get::<Option<i64>, _>("bytes_received").unwrap_or(0),
                duration_ms: row.get::<Option<i64>, _>("duration_ms").unwrap_or(0),
                proof_signature: row.get("proof_signature"),
                error: row.get::<i64, _>("error") != 0,
                error_message: row.get("error_message"),
                completed: row.get::<i64, _>("completed") != 0,
            })
            .collect())
    }

    /// Cheap reachability probe
    pub async fn ping(&self) -> QgateResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool (used by shutdown and failure-injection tests)
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::tracker::{ConnectionState, ConnectionTracker};
    use uuid::Uuid;

    async fn memory_store() -> TrafficStore {
        TrafficStore::connect(&StorageConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(5),
            connect_timeout: Some(5),
            busy_retries: Some(3),
        })
        .await
        .unwrap()
    }

    fn pending(host: &str) -> TrafficRecord {
        TrafficRecord {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            client_addr: "10.0.0.1:50123".to_string(),
            method: "GET".to_string(),
            url: format!("http://{}/", host),
            host: host.to_string(),
            path: "/".to_string(),
            protocol: "HTTP/1.1".to_string(),
            headers: serde_json::json!({"host": host}),
            waypoints: vec![17, 42],
            strategy: "entangled_regional[simulated]".to_string(),
            routing_cost_ms: 3.75,
            classical_estimate_ms: 12.0,
            quantum_advantage: 3.2,
        }
    }

    #[tokio::test]
    async fn test_record_ids_strictly_increase() {
        let store = memory_store().await;
        let a = store.insert_pending(&pending("a.example.com")).await.unwrap();
        let b = store.insert_pending(&pending("b.example.com")).await.unwrap();
        let c = store.insert_pending(&pending("c.example.com")).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_complete_record_applies_once() {
        let store = memory_store().await;
        let id = store.insert_pending(&pending("a.example.com")).await.unwrap();

        let outcome = CompletedExchange {
            status: Some(200),
            response_size: Some(2048),
            bytes_sent: 512,
            bytes_received: 2048,
            duration_ms: 42,
            proof_root: Some("ab".repeat(32)),
            proof_signature: Some("cd".repeat(32)),
            error_message: None,
        };
        store.complete_record(id, &outcome).await.unwrap();

        // Second completion is a no-op, not an overwrite
        let second = CompletedExchange {
            status: Some(500),
            duration_ms: 1,
            ..Default::default()
        };
        store.complete_record(id, &second).await.unwrap();

        let row = sqlx::query("SELECT status_code, completed, error FROM traffic_log WHERE id = ?")
            .bind(id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("status_code"), 200);
        assert_eq!(row.get::<i64, _>("completed"), 1);
        assert_eq!(row.get::<i64, _>("error"), 0);
    }

    #[tokio::test]
    async fn test_error_outcome_sets_flag() {
        let store = memory_store().await;
        let id = store.insert_pending(&pending("down.example.com")).await.unwrap();
        let outcome = CompletedExchange {
            status: Some(502),
            duration_ms: 5_000,
            error_message: Some("connect timeout".to_string()),
            ..Default::default()
        };
        store.complete_record(id, &outcome).await.unwrap();

        let row = sqlx::query("SELECT error, error_message FROM traffic_log WHERE id = ?")
            .bind(id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("error"), 1);
        assert_eq!(row.get::<String, _>("error_message"), "connect timeout");
    }

    #[tokio::test]
    async fn test_metric_batch_counters_and_gauges() {
        let store = memory_store().await;
        let ops = vec![
            MetricOp::Increment {
                name: "total_requests".to_string(),
                value: 1.0,
            },
            MetricOp::Increment {
                name: "bytes_sent_total_bytes".to_string(),
                value: 512.0,
            },
            MetricOp::Set {
                name: "active_connections".to_string(),
                value: 3.0,
            },
        ];
        store.apply_metric_batch(&ops, &[]).await.unwrap();
        store.apply_metric_batch(&ops, &[]).await.unwrap();

        assert_eq!(store.fetch_metric("total_requests").await.unwrap(), Some(2.0));
        assert_eq!(
            store.fetch_metric("bytes_sent_total_bytes").await.unwrap(),
            Some(1024.0)
        );
        // Gauge takes the latest value instead of accumulating
        assert_eq!(
            store.fetch_metric("active_connections").await.unwrap(),
            Some(3.0)
        );

        let samples = store.fetch_metrics().await.unwrap();
        let bytes = samples
            .iter()
            .find(|s| s.name == "bytes_sent_total_bytes")
            .unwrap();
        assert_eq!(bytes.unit, "bytes");
        assert_eq!(bytes.kind, "counter");
    }

    #[tokio::test]
    async fn test_domain_sum_matches_total_requests() {
        let store = memory_store().await;

        let exchanges = [
            ("a.example.com", 10.0, false),
            ("a.example.com", 30.0, false),
            ("b.example.com", 20.0, true),
            ("c.example.com", 5.0, false),
        ];

        for (domain, latency, is_error) in exchanges {
            let ops = vec![MetricOp::Increment {
                name: "total_requests".to_string(),
                value: 1.0,
            }];
            let deltas = vec![DomainDelta {
                domain: domain.to_string(),
                bytes_sent: 100,
                bytes_received: 200,
                latency_ms: latency,
                is_error,
                seen_at: Utc::now(),
            }];
            store.apply_metric_batch(&ops, &deltas).await.unwrap();
        }

        let total = store.fetch_metric("total_requests").await.unwrap().unwrap();
        let domains = store.top_domains(10).await.unwrap();
        let domain_sum: i64 = domains.iter().map(|d| d.request_count).sum();
        assert_eq!(domain_sum as f64, total);

        let a = domains.iter().find(|d| d.domain == "a.example.com").unwrap();
        assert_eq!(a.request_count, 2);
        assert_eq!(a.min_latency_ms, 10.0);
        assert_eq!(a.max_latency_ms, 30.0);
        assert_eq!(a.avg_latency_ms, 20.0);
        assert_eq!(a.error_count, 0);

        let b = domains.iter().find(|d| d.domain == "b.example.com").unwrap();
        assert_eq!(b.error_count, 1);
    }

    #[tokio::test]
    async fn test_top_domains_ordering_and_limit() {
        let store = memory_store().await;
        for (domain, count) in [("a", 3), ("b", 1), ("c", 2)] {
            for _ in 0..count {
                let deltas = vec![DomainDelta {
                    domain: domain.to_string(),
                    bytes_sent: 0,
                    bytes_received: 0,
                    latency_ms: 1.0,
                    is_error: false,
                    seen_at: Utc::now(),
                }];
                store.apply_metric_batch(&[], &deltas).await.unwrap();
            }
        }

        let top = store.top_domains(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].domain, "a");
        assert_eq!(top[1].domain, "c");
    }

    #[tokio::test]
    async fn test_error_log_and_health_checks() {
        let store = memory_store().await;
        store.log_error("metrics_flush", "database is locked").await.unwrap();
        store.record_health(true, 4, 0, 0).await.unwrap();

        let errors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM error_log")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(errors, 1);

        let row = sqlx::query("SELECT store_ok, active_connections FROM health_checks")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("store_ok"), 1);
        assert_eq!(row.get::<i64, _>("active_connections"), 4);
    }

    #[tokio::test]
    async fn test_replace_active_connections() {
        let store = memory_store().await;
        let tracker = ConnectionTracker::new();
        let a = tracker.open("10.0.0.1:1").await;
        tracker.set_state(a, ConnectionState::Tunneling).await;
        let _b = tracker.open("10.0.0.2:2").await;

        store
            .replace_active_connections(&tracker.snapshot().await)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM active_connections")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 2);

        tracker.close(a).await;
        store
            .replace_active_connections(&tracker.snapshot().await)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM active_connections")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:{}/traffic.db", dir.path().display());
        let store = TrafficStore::connect(&StorageConfig {
            url,
            max_connections: Some(4),
            connect_timeout: Some(5),
            busy_retries: Some(3),
        })
        .await
        .unwrap();

        let id = store.insert_pending(&pending("file.example.com")).await.unwrap();
        assert!(id >= 1);
        assert!(dir.path().join("traffic.db").exists());
        store.close().await;
    }

    #[tokio::test]
    async fn test_ping_fails_after_close() {
        let store = memory_store().await;
        assert!(store.ping().await.is_ok());
        store.close().await;
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_retrying_recovers_from_busy() {
        let store = memory_store().await;
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));

        let attempts_in = attempts.clone();
        let result: QgateResult<u32> = store
            .retrying(move || {
                let attempts = attempts_in.clone();
                async move {
                    let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        Err(QgateError::DatabaseBusy {
                            message: "database is locked".to_string(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrying_gives_up_after_budget() {
        let store = memory_store().await;
        let result: QgateResult<()> = store
            .retrying(|| async {
                Err(QgateError::DatabaseBusy {
                    message: "database is locked".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(QgateError::DatabaseBusy { .. })));
    }
}
