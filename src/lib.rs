//! # qgate - quantum-routed traffic interception gateway
//!
//! qgate is a forward proxy that transparently intercepts plain HTTP
//! requests and HTTPS `CONNECT` tunnels, attaches synthetic routing
//! metadata to every flow, persists a verifiable provenance record per
//! exchange, and keeps serving operational metrics even when the backing
//! store is down.
//!
//! ## Core pieces
//!
//! - **Interception**: per-connection dispatch of `CONNECT` tunnels and the
//!   seven standard HTTP verbs, with diagnostic `X-Qgate-*` headers on every
//!   response
//! - **Routing telemetry**: a pluggable route selector (configured topology
//!   or hash-based simulation) tagging each flow with waypoints, strategy
//!   and cost
//! - **Provenance**: a Merkle root over the route's waypoints, signed
//!   together with the request hash
//! - **Metrics**: queued counter/gauge updates flushed in batches, with a
//!   bounded in-memory overflow queue absorbing storage failures
//! - **Persistence**: traffic log, metrics, per-domain aggregates, error
//!   log and health checks in one transactional SQLite store via sqlx
//!
//! ## Usage
//!
//! ```rust,no_run
//! use qgate::config::Config;
//! use qgate::metrics;
//! use qgate::proxy::ProxyServer;
//! use qgate::shutdown::ShutdownManager;
//! use qgate::storage::TrafficStore;
//! use qgate::tracker::ConnectionTracker;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::default());
//!     let store = TrafficStore::connect(&config.storage).await?;
//!     let tracker = ConnectionTracker::new();
//!     let shutdown = Arc::new(ShutdownManager::new(Duration::from_secs(30)));
//!     let (collector, worker) = metrics::collector(
//!         config.metrics.clone(),
//!         Arc::new(store.clone()),
//!         tracker.clone(),
//!     );
//!     let _workers = worker.spawn(shutdown.subscribe(), shutdown.subscribe());
//!     let server = ProxyServer::new(config, store, collector, tracker, shutdown);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitoring;
pub mod proof;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod shutdown;
pub mod storage;
pub mod tracker;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorSeverity, QgateError, QgateResult};
pub use metrics::{ExchangeEvent, ExchangeKind, MetricsCollector, MetricsSnapshot};
pub use proof::{Proof, ProofGenerator, RequestSummary};
pub use proxy::ProxyServer;
pub use ratelimit::RateLimiter;
pub use routing::{Route, RouteSelector, Strategy};
pub use shutdown::{ShutdownManager, ShutdownSignal, TaskHandle};
pub use storage::{TrafficRecord, TrafficStore};
pub use tracker::{ConnectionState, ConnectionTracker};
