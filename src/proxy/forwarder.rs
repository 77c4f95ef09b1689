//! Plain-HTTP forwarding to origin servers.
//!
//! Requests arrive in proxy (absolute) form; the forwarder rewrites them to
//! origin form, strips hop-by-hop headers, sends them through one shared
//! pooled hyper client, and streams the origin's response back unchanged.
//! The response body is wrapped in a counting stream so the exchange
//! finalizer learns the real transferred size once the client has consumed
//! it, without buffering anything.

use futures::Stream;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HOST};
use hyper::{Body, Client, Request, Response, Uri};
use once_cell::sync::Lazy;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::error::{QgateError, QgateResult};

/// Shared hyper client with connection pooling.
///
/// A single instance reused across requests keeps origin connections warm;
/// per-request timeouts bound each exchange instead of connector settings.
static SHARED_CLIENT: Lazy<Client<HttpConnector, Body>> = Lazy::new(|| {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);

    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .build(connector)
});

/// Hop-by-hop headers stripped in both directions, per RFC 7230
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Forward a request to `host:port` and hand back the origin response plus
/// a receiver that resolves to the response-body byte count once the body
/// has been fully streamed (or the client went away).
pub async fn forward(
    req: Request<Body>,
    host: &str,
    port: u16,
    request_timeout: Duration,
) -> QgateResult<(Response<Body>, oneshot::Receiver<u64>)> {
    let origin_req = build_origin_request(req, host, port)?;

    let response = match timeout(request_timeout, SHARED_CLIENT.request(origin_req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            return Err(if err.is_connect() {
                QgateError::network(format!("origin connect failed: {}", err))
            } else {
                QgateError::network(format!("origin exchange failed: {}", err))
            })
        }
        Err(_) => {
            return Err(QgateError::timeout(
                request_timeout,
                format!("forward to {}:{}", host, port),
            ))
        }
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let (report_tx, report_rx) = oneshot::channel();
    let counted = Body::wrap_stream(CountingBody {
        inner: body,
        counted: 0,
        report: Some(report_tx),
    });

    Ok((Response::from_parts(parts, counted), report_rx))
}

/// Rewrite a proxy-form request into origin form for the upstream dial
fn build_origin_request(req: Request<Body>, host: &str, port: u16) -> QgateResult<Request<Body>> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let authority = if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };

    let uri: Uri = format!("http://{}{}", authority, path_and_query)
        .parse()
        .map_err(|e| QgateError::proxy(format!("invalid origin URI: {}", e)))?;
    parts.uri = uri;

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.insert(
        HOST,
        authority
            .parse()
            .map_err(|_| QgateError::proxy(format!("invalid host header: {}", authority)))?,
    );

    Ok(Request::from_parts(parts, body))
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // The Connection header may name additional hop-by-hop headers
    let extra: Vec<String> = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();

    for header in HOP_HEADERS {
        headers.remove(*header);
    }
    for header in extra {
        headers.remove(header.as_str());
    }
}

/// Pass-through body stream that reports its total size on completion.
///
/// The report also fires from Drop, so an abandoned response (client reset)
/// still resolves the finalizer with whatever was counted.
struct CountingBody {
    inner: Body,
    counted: u64,
    report: Option<oneshot::Sender<u64>>,
}

impl Stream for CountingBody {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.counted += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(report) = this.report.take() {
                    let _ = report.send(this.counted);
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(report) = this.report.take() {
                    let _ = report.send(this.counted);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            let _ = report.send(self.counted);
        }
    }
}
