use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::forwarder;
use super::server::ConnGuard;
use super::tunnel::{self, TunnelStats};
use crate::config::Config;
use crate::error::{QgateError, QgateResult};
use crate::metrics::{ExchangeEvent, ExchangeKind, MetricsCollector, RejectionKind};
use crate::proof::{ProofGenerator, RequestSummary};
use crate::ratelimit::RateLimiter;
use crate::routing::{build_selector, Route, RouteSelector};
use crate::shutdown::ShutdownManager;
use crate::storage::{CompletedExchange, TrafficRecord, TrafficStore};
use crate::tracker::{ConnectionState, ConnectionTracker};

const HEADER_INTERCEPTED: &str = "x-qgate-intercepted";
const HEADER_VERSION: &str = "x-qgate-version";
const HEADER_ROUTE: &str = "x-qgate-quantum-route";
const HEADER_STRATEGY: &str = "x-qgate-routing-strategy";

/// Headers snapshotted per record are capped; a record is telemetry, not an
/// archive of arbitrarily large header blocks.
const MAX_SNAPSHOT_HEADERS: usize = 64;

/// Per-request dispatch: admission, routing, record lifecycle, and the
/// hand-off to the tunnel relay or the HTTP forwarder.
#[derive(Clone)]
pub struct ProxyHandler {
    config: Arc<Config>,
    rate_limiter: RateLimiter,
    selector: Arc<dyn RouteSelector>,
    prover: ProofGenerator,
    store: TrafficStore,
    collector: MetricsCollector,
    tracker: ConnectionTracker,
    shutdown: Arc<ShutdownManager>,
}

/// Everything the finalizer needs about an exchange in flight
struct ExchangeContext {
    summary: RequestSummary,
    route: Route,
    record_id: Option<i64>,
    started: DateTime<Utc>,
    domain: String,
    kind: ExchangeKind,
    guard: Option<ConnGuard>,
}

/// Terminal result of an exchange as observed by the handler
struct ExchangeOutcome {
    status: Option<u16>,
    response_size: Option<i64>,
    bytes_sent: u64,
    bytes_received: u64,
    error: Option<String>,
    /// True when this finalizer owns the connection record (tunnels)
    close_connection: bool,
}

impl ProxyHandler {
    pub fn new(
        config: Arc<Config>,
        rate_limiter: RateLimiter,
        store: TrafficStore,
        collector: MetricsCollector,
        tracker: ConnectionTracker,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        let selector: Arc<dyn RouteSelector> = Arc::from(build_selector(&config.routing));
        Self {
            rate_limiter,
            prover: ProofGenerator::new(config.proof.secret.clone()),
            config,
            selector,
            store,
            collector,
            tracker,
            shutdown,
        }
    }

    /// Connection-boundary error catch: a failing exchange becomes a 500,
    /// never a crashed listener.
    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        match self.process_request(req).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(error = %err, "Request processing error");
                let _ = self.store.log_error("handler", &err.to_string()).await;
                Ok(self.simple_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"))
            }
        }
    }

    async fn process_request(&self, req: Request<Body>) -> QgateResult<Response<Body>> {
        let method = req.method().clone();

        if method == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        if !is_forwardable(&method) {
            self.collector
                .record_rejection(RejectionKind::MethodNotAllowed);
            return Ok(self.simple_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
        }

        self.handle_forward(req).await
    }

    /// Plain HTTP: forward to the origin and stream the response back
    async fn handle_forward(&self, req: Request<Body>) -> QgateResult<Response<Body>> {
        let started = Utc::now();
        let client_addr = client_addr(&req);
        let guard = req.extensions().get::<ConnGuard>().cloned();

        if let Some(max) = self.config.server.max_request_bytes {
            if content_length(req.headers()).is_some_and(|len| len > max) {
                self.collector
                    .record_rejection(RejectionKind::PayloadTooLarge);
                return Ok(self.simple_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large"));
            }
        }

        if !self.rate_limiter.admit(client_addr.ip()).await {
            self.collector.record_rejection(RejectionKind::RateLimited);
            return Ok(self.simple_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests"));
        }

        let Some((host, port)) = resolve_destination(&req) else {
            self.collector.record_rejection(RejectionKind::BadRequest);
            return Ok(self.simple_response(StatusCode::BAD_REQUEST, "Missing destination host"));
        };
        let destination = format!("{}:{}", host, port);

        let route = self.selector.route(&client_addr.to_string(), &destination);
        let summary = RequestSummary {
            method: req.method().to_string(),
            url: req.uri().to_string(),
            client: client_addr.to_string(),
            timestamp: started,
        };

        let record_id = self
            .insert_pending(&req, &summary, &route, client_addr, &host)
            .await;

        if let Some(guard) = &guard {
            self.tracker
                .set_state(guard.conn_id, ConnectionState::Active)
                .await;
            self.tracker
                .set_destination(guard.conn_id, destination.clone())
                .await;
        }

        let request_bytes = content_length(req.headers()).unwrap_or(0);
        let request_timeout =
            Duration::from_secs(self.config.server.request_timeout.unwrap_or(60));

        let ctx = ExchangeContext {
            summary,
            route: route.clone(),
            record_id,
            started,
            domain: host.clone(),
            kind: ExchangeKind::Http,
            guard,
        };

        match forwarder::forward(req, &host, port, request_timeout).await {
            Ok((mut response, body_rx)) => {
                let status = response.status();
                self.inject_diagnostics(response.headers_mut(), Some(&route));

                // Finalize once the client has consumed (or abandoned) the body
                let handler = self.clone();
                tokio::spawn(async move {
                    let received = body_rx.await.unwrap_or(0);
                    handler
                        .finalize_exchange(
                            ctx,
                            ExchangeOutcome {
                                status: Some(status.as_u16()),
                                response_size: Some(received as i64),
                                bytes_sent: request_bytes,
                                bytes_received: received,
                                error: None,
                                close_connection: false,
                            },
                        )
                        .await;
                });

                Ok(response)
            }
            Err(err) => {
                let status = gateway_status(&err);
                debug!(destination = %destination, error = %err, "Forward failed");
                self.finalize_exchange(
                    ctx,
                    ExchangeOutcome {
                        status: Some(status.as_u16()),
                        response_size: None,
                        bytes_sent: 0,
                        bytes_received: 0,
                        error: Some(err.to_string()),
                        close_connection: false,
                    },
                )
                .await;

                let mut response = self.simple_response(status, "Upstream unavailable");
                self.inject_diagnostics(response.headers_mut(), Some(&route));
                Ok(response)
            }
        }
    }

    /// CONNECT: dial the destination, answer 200, relay opaquely
    async fn handle_connect(&self, req: Request<Body>) -> QgateResult<Response<Body>> {
        let started = Utc::now();
        let client_addr = client_addr(&req);
        let guard = req.extensions().get::<ConnGuard>().cloned();

        if !self.rate_limiter.admit(client_addr.ip()).await {
            self.collector.record_rejection(RejectionKind::RateLimited);
            return Ok(self.simple_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests"));
        }

        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            self.collector.record_rejection(RejectionKind::BadRequest);
            return Ok(self.simple_response(StatusCode::BAD_REQUEST, "Missing CONNECT authority"));
        };

        let (host, port) = match tunnel::parse_authority(&authority) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.collector.record_rejection(RejectionKind::BadRequest);
                debug!(authority = %authority, error = %err, "Bad CONNECT authority");
                return Ok(self.simple_response(StatusCode::BAD_REQUEST, "Bad CONNECT authority"));
            }
        };
        let destination = format!("{}:{}", host, port);

        let route = self.selector.route(&client_addr.to_string(), &destination);
        let summary = RequestSummary {
            method: Method::CONNECT.to_string(),
            url: destination.clone(),
            client: client_addr.to_string(),
            timestamp: started,
        };

        let record_id = self
            .insert_pending(&req, &summary, &route, client_addr, &host)
            .await;

        let connect_timeout =
            Duration::from_secs(self.config.server.connect_timeout.unwrap_or(10));
        let idle_timeout =
            Duration::from_secs(self.config.server.tunnel_idle_timeout.unwrap_or(300));

        let ctx = ExchangeContext {
            summary,
            route: route.clone(),
            record_id,
            started,
            domain: host.clone(),
            kind: ExchangeKind::Tunnel,
            guard: guard.clone(),
        };

        let origin = match tunnel::dial(&destination, connect_timeout).await {
            Ok(origin) => origin,
            Err(err) => {
                let status = gateway_status(&err);
                debug!(destination = %destination, error = %err, "Tunnel dial failed");
                self.finalize_exchange(
                    ctx,
                    ExchangeOutcome {
                        status: Some(status.as_u16()),
                        response_size: None,
                        bytes_sent: 0,
                        bytes_received: 0,
                        error: Some(err.to_string()),
                        close_connection: false,
                    },
                )
                .await;

                let mut response = self.simple_response(status, "Destination unreachable");
                self.inject_diagnostics(response.headers_mut(), Some(&route));
                return Ok(response);
            }
        };

        if let Some(guard) = &guard {
            self.tracker
                .set_state(guard.conn_id, ConnectionState::Tunneling)
                .await;
            self.tracker
                .set_destination(guard.conn_id, destination.clone())
                .await;
        }

        // The relay owns the upgraded stream; the guard travels with it so
        // the connection slot stays occupied for the tunnel's lifetime.
        let handler = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let stats = tokio::select! {
                        stats = tunnel::relay(upgraded, origin, idle_timeout) => stats,
                        _ = shutdown_rx.recv() => {
                            debug!("Tunnel force-closed by shutdown");
                            TunnelStats::default()
                        }
                    };
                    handler
                        .finalize_exchange(
                            ctx,
                            ExchangeOutcome {
                                status: Some(StatusCode::OK.as_u16()),
                                response_size: None,
                                bytes_sent: stats.bytes_sent,
                                bytes_received: stats.bytes_received,
                                error: None,
                                close_connection: true,
                            },
                        )
                        .await;
                }
                Err(err) => {
                    handler
                        .finalize_exchange(
                            ctx,
                            ExchangeOutcome {
                                status: Some(StatusCode::OK.as_u16()),
                                response_size: None,
                                bytes_sent: 0,
                                bytes_received: 0,
                                error: Some(format!("upgrade failed: {}", err)),
                                close_connection: true,
                            },
                        )
                        .await;
                }
            }
        });

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())?;
        self.inject_diagnostics(response.headers_mut(), Some(&route));
        Ok(response)
    }

    /// Create the pending traffic record. Storage trouble is absorbed here;
    /// the exchange proceeds without an id rather than failing the client.
    async fn insert_pending(
        &self,
        req: &Request<Body>,
        summary: &RequestSummary,
        route: &Route,
        client_addr: SocketAddr,
        host: &str,
    ) -> Option<i64> {
        let record = TrafficRecord {
            request_id: Uuid::new_v4(),
            timestamp: summary.timestamp,
            client_addr: client_addr.to_string(),
            method: summary.method.clone(),
            url: summary.url.clone(),
            host: host.to_string(),
            path: req.uri().path().to_string(),
            protocol: format!("{:?}", req.version()),
            headers: header_snapshot(req.headers()),
            waypoints: route.waypoints.clone(),
            strategy: route.strategy_label(),
            routing_cost_ms: route.cost_ms,
            classical_estimate_ms: route.classical_ms,
            quantum_advantage: route.advantage(),
        };

        match self.store.insert_pending(&record).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "Failed to create traffic record");
                let _ = self.store.log_error("traffic_log", &err.to_string()).await;
                None
            }
        }
    }

    /// Runs exactly once per exchange: sign the proof, record the metrics,
    /// close out the traffic record. Storage failures stay internal.
    async fn finalize_exchange(&self, ctx: ExchangeContext, outcome: ExchangeOutcome) {
        let duration_ms = (Utc::now() - ctx.started).num_milliseconds().max(0);

        let proof = self.prover.generate(&ctx.summary, &ctx.route.waypoints);

        self.collector.record(&ExchangeEvent {
            domain: ctx.domain.clone(),
            kind: ctx.kind,
            bytes_sent: outcome.bytes_sent,
            bytes_received: outcome.bytes_received,
            latency_ms: duration_ms as f64,
            is_error: outcome.error.is_some(),
        });

        if let Some(id) = ctx.record_id {
            let completed = CompletedExchange {
                status: outcome.status,
                response_size: outcome.response_size,
                bytes_sent: outcome.bytes_sent as i64,
                bytes_received: outcome.bytes_received as i64,
                duration_ms,
                proof_root: proof.verifiable.then(|| proof.merkle_root.clone()),
                proof_signature: proof.verifiable.then(|| proof.signature.clone()),
                error_message: outcome.error.clone(),
            };
            if let Err(err) = self.store.complete_record(id, &completed).await {
                warn!(record = id, error = %err, "Failed to complete traffic record");
                let _ = self.store.log_error("traffic_log", &err.to_string()).await;
            }
        }

        if let Some(guard) = &ctx.guard {
            self.tracker
                .add_bytes(guard.conn_id, outcome.bytes_sent, outcome.bytes_received)
                .await;
            if outcome.close_connection {
                self.tracker
                    .set_state(guard.conn_id, ConnectionState::Closed)
                    .await;
                self.tracker.close(guard.conn_id).await;
            }
        }

        debug!(
            domain = %ctx.domain,
            duration_ms,
            error = outcome.error.as_deref().unwrap_or("none"),
            "Exchange finalized"
        );
    }

    /// Response for rejections and internal failures: diagnostic base
    /// headers, no route (none was computed)
    fn simple_response(&self, status: StatusCode, message: &'static str) -> Response<Body> {
        let mut response = Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::empty()));
        self.inject_diagnostics(response.headers_mut(), None);
        response
    }

    fn inject_diagnostics(&self, headers: &mut HeaderMap, route: Option<&Route>) {
        headers.insert(HEADER_INTERCEPTED, HeaderValue::from_static("true"));
        headers.insert(
            HEADER_VERSION,
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        if let Some(route) = route {
            headers.insert(
                HEADER_ROUTE,
                HeaderValue::from_str(&route.waypoints_header())
                    .unwrap_or_else(|_| HeaderValue::from_static("unavailable")),
            );
            headers.insert(
                HEADER_STRATEGY,
                HeaderValue::from_str(&route.strategy_label())
                    .unwrap_or_else(|_| HeaderValue::from_static("unavailable")),
            );
        }
    }
}

/// The seven standard verbs the forwarder accepts
fn is_forwardable(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET
            | Method::HEAD
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::OPTIONS
            | Method::PATCH
    )
}

fn client_addr(req: &Request<Body>) -> SocketAddr {
    req.extensions()
        .get::<SocketAddr>()
        .copied()
        .unwrap_or_else(|| "127.0.0.1:0".parse().unwrap())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Proxy requests carry the destination in the absolute-form URI; fall back
/// to the Host header for origin-form requests.
fn resolve_destination(req: &Request<Body>) -> Option<(String, u16)> {
    if let Some(host) = req.uri().host() {
        return Some((host.to_string(), req.uri().port_u16().unwrap_or(80)));
    }

    let header = req.headers().get(HOST)?.to_str().ok()?;
    match header.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((header.to_string(), 80)),
    }
}

fn gateway_status(err: &QgateError) -> StatusCode {
    match err {
        QgateError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Header snapshot persisted with the traffic record
fn header_snapshot(headers: &HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter().take(MAX_SNAPSHOT_HEADERS) {
        map.insert(
            name.as_str().to_string(),
            serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_forwardable_covers_the_seven_verbs() {
        for method in [
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ] {
            assert!(is_forwardable(&method), "{} should forward", method);
        }
        assert!(!is_forwardable(&Method::CONNECT));
        assert!(!is_forwardable(&Method::TRACE));
    }

    #[test]
    fn test_resolve_destination_absolute_form() {
        let req = Request::builder()
            .uri("http://origin.example.com:8080/api")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            resolve_destination(&req),
            Some(("origin.example.com".to_string(), 8080))
        );

        let req = Request::builder()
            .uri("http://origin.example.com/api")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            resolve_destination(&req),
            Some(("origin.example.com".to_string(), 80))
        );
    }

    #[test]
    fn test_resolve_destination_host_header() {
        let req = Request::builder()
            .uri("/relative")
            .header(HOST, "origin.example.com:3000")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            resolve_destination(&req),
            Some(("origin.example.com".to_string(), 3000))
        );

        let req = Request::builder().uri("/relative").body(Body::empty()).unwrap();
        assert_eq!(resolve_destination(&req), None);
    }

    #[test]
    fn test_content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, "1024".parse().unwrap());
        assert_eq!(content_length(&headers), Some(1024));

        headers.insert(CONTENT_LENGTH, "garbage".parse().unwrap());
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_gateway_status_mapping() {
        let timeout = QgateError::timeout(Duration::from_secs(5), "connect");
        assert_eq!(gateway_status(&timeout), StatusCode::GATEWAY_TIMEOUT);

        let refused = QgateError::tunnel("origin:443", "connection refused");
        assert_eq!(gateway_status(&refused), StatusCode::BAD_GATEWAY);

        let network = QgateError::network("reset by peer");
        assert_eq!(gateway_status(&network), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_header_snapshot_is_json_object() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "origin.example.com".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());

        let snapshot = header_snapshot(&headers);
        assert_eq!(snapshot["host"], "origin.example.com");
        assert_eq!(snapshot["user-agent"], "curl/8.0");
    }
}
