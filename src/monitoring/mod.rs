//! Operational HTTP surface: health, Prometheus text and a JSON snapshot.
//!
//! Served by its own hyper server on the monitoring bind address. The
//! snapshot is fed by [`MetricsCollector::snapshot`], which degrades to
//! in-process counters when the backing store is down, so this surface
//! keeps answering under storage failure.

use anyhow::Result;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MonitoringConfig;
use crate::metrics::MetricsCollector;
use crate::shutdown::ShutdownSignal;

struct MonitoringState {
    config: MonitoringConfig,
    collector: MetricsCollector,
    prometheus: Option<PrometheusHandle>,
    started: Instant,
}

/// Start the monitoring server; returns immediately with its join handle.
pub fn spawn_monitoring_server(
    config: MonitoringConfig,
    collector: MetricsCollector,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) -> Result<JoinHandle<()>> {
    // A second install in the same process (tests) is fine; prometheus
    // rendering just stays off for that instance.
    let prometheus = PrometheusBuilder::new().install_recorder().ok();
    if prometheus.is_none() {
        warn!("Prometheus recorder already installed; /metrics will be empty");
    }

    let state = Arc::new(MonitoringState {
        config: config.clone(),
        collector,
        prometheus,
        started: Instant::now(),
    });

    let make_service = make_service_fn(move |_conn: &AddrStream| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle(req, state).await) }
            }))
        }
    });

    let server = Server::try_bind(&config.bind)?
        .serve(make_service)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });

    info!("Monitoring server listening on {}", config.bind);

    Ok(tokio::spawn(async move {
        if let Err(err) = server.await {
            warn!(error = %err, "Monitoring server error");
        }
        info!("Monitoring server stopped");
    }))
}

async fn handle(req: Request<Body>, state: Arc<MonitoringState>) -> Response<Body> {
    if req.method() != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "GET only");
    }

    let path = req.uri().path();
    if path == state.config.health_endpoint {
        health_response(&state).await
    } else if path == state.config.metrics_endpoint {
        prometheus_response(&state)
    } else if path == "/stats" {
        stats_response(&state).await
    } else {
        plain(StatusCode::NOT_FOUND, "Not found")
    }
}

async fn health_response(state: &MonitoringState) -> Response<Body> {
    let snapshot = state.collector.snapshot().await;
    let status = if snapshot.store_available {
        "healthy"
    } else {
        "degraded"
    };

    let body = json!({
        "status": status,
        "uptime_seconds": state.started.elapsed().as_secs(),
        "store_available": snapshot.store_available,
        "active_connections": snapshot.active_connections,
        "memory_queue_depth": snapshot.memory_queue_depth,
    });

    json_response(StatusCode::OK, &body)
}

fn prometheus_response(state: &MonitoringState) -> Response<Body> {
    let text = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(text))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn stats_response(state: &MonitoringState) -> Response<Body> {
    let snapshot = state.collector.snapshot().await;
    match serde_json::to_value(&snapshot) {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn plain(status: StatusCode, message: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricsConfig, StorageConfig};
    use crate::metrics;
    use crate::storage::TrafficStore;
    use crate::tracker::ConnectionTracker;

    async fn state_with_store() -> (Arc<MonitoringState>, TrafficStore) {
        let store = TrafficStore::connect(&StorageConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
            connect_timeout: Some(5),
            busy_retries: Some(1),
        })
        .await
        .unwrap();
        let (collector, _worker) = metrics::collector(
            MetricsConfig::default(),
            Arc::new(store.clone()),
            ConnectionTracker::new(),
        );
        let state = Arc::new(MonitoringState {
            config: MonitoringConfig::default(),
            collector,
            prometheus: None,
            started: Instant::now(),
        });
        (state, store)
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint_healthy() {
        let (state, _store) = state_with_store().await;
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = handle(req, state).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store_available"], true);
    }

    #[tokio::test]
    async fn test_health_endpoint_degrades_without_store() {
        let (state, store) = state_with_store().await;
        store.close().await;

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = handle(req, state).await;

        // Still answers, just flagged degraded
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["store_available"], false);
    }

    #[tokio::test]
    async fn test_stats_endpoint_serves_snapshot() {
        let (state, _store) = state_with_store().await;
        let req = Request::builder().uri("/stats").body(Body::empty()).unwrap();

        let response = handle(req, state).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body.get("process").is_some());
        assert!(body.get("memory_queue_depth").is_some());
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let (state, _store) = state_with_store().await;

        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let response = handle(req, Arc::clone(&state)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = handle(req, state).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
