#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use qgate::config::Config;
use qgate::metrics::{self, MetricsCollector};
use qgate::proxy::ProxyServer;
use qgate::shutdown::{ShutdownManager, ShutdownSignal};
use qgate::storage::TrafficStore;
use qgate::tracker::ConnectionTracker;

/// A gateway instance listening on an ephemeral port, with handles into its
/// store and collector for assertions.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: TrafficStore,
    pub collector: MetricsCollector,
    pub tracker: ConnectionTracker,
    pub shutdown: Arc<ShutdownManager>,
    server_task: JoinHandle<anyhow::Result<()>>,
    worker_tasks: (JoinHandle<()>, JoinHandle<()>),
}

pub async fn start_gateway(mutate: impl FnOnce(&mut Config)) -> TestGateway {
    let mut config = Config::default();
    config.storage.url = "sqlite::memory:".to_string();
    config.server.connect_timeout = Some(2);
    config.server.request_timeout = Some(5);
    config.server.read_timeout = Some(5);
    config.server.tunnel_idle_timeout = Some(5);
    config.metrics.flush_interval = 1;
    config.metrics.drain_interval = 1;
    mutate(&mut config);
    let config = Arc::new(config);

    let store = TrafficStore::connect(&config.storage).await.unwrap();
    let tracker = ConnectionTracker::new();
    let shutdown = Arc::new(ShutdownManager::new(Duration::from_secs(2)));
    let (collector, worker) = metrics::collector(
        config.metrics.clone(),
        Arc::new(store.clone()),
        tracker.clone(),
    );
    let worker_tasks = worker.spawn(shutdown.subscribe(), shutdown.subscribe());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = ProxyServer::new(
        Arc::clone(&config),
        store.clone(),
        collector.clone(),
        tracker.clone(),
        Arc::clone(&shutdown),
    );
    let server_task = tokio::spawn(server.run_on(listener));

    TestGateway {
        addr,
        store,
        collector,
        tracker,
        shutdown,
        server_task,
        worker_tasks,
    }
}

impl TestGateway {
    pub async fn stop(self) {
        self.shutdown.shutdown(ShutdownSignal::Graceful).await;
        let _ = timeout(Duration::from_secs(3), self.server_task).await;
        let _ = timeout(Duration::from_secs(3), self.worker_tasks.0).await;
        let _ = timeout(Duration::from_secs(3), self.worker_tasks.1).await;
    }
}

/// Minimal HTTP origin: answers every request with the given body and
/// closes the connection.
pub async fn start_origin(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut seen = Vec::new();
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// TCP echo server used as a CONNECT destination
pub async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    addr
}

/// Send raw bytes, read to EOF, parse one HTTP response
pub async fn raw_request(addr: SocketAddr, request: &str) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match timeout(Duration::from_secs(10), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }

    parse_response(&response)
}

/// Read one response head (status + headers) from an open stream, leaving
/// the connection usable (CONNECT handshakes).
pub async fn read_response_head(stream: &mut TcpStream) -> (u16, HashMap<String, String>) {
    let mut seen = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .expect("response head timed out")
            .unwrap();
        assert!(n > 0, "connection closed before response head");
        seen.extend_from_slice(&buf[..n]);
        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let (status, headers, _) = parse_response(&seen);
    (status, headers)
}

pub fn parse_response(raw: &[u8]) -> (u16, HashMap<String, String>, Vec<u8>) {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header/body boundary in response");
    let head = String::from_utf8_lossy(&raw[..split]);
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("empty response");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("no status code")
        .parse()
        .expect("bad status code");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    (status, headers, body)
}

/// Poll until `check` passes or the deadline expires
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    loop {
        if check().await {
            return true;
        }
        if waited >= deadline {
            return false;
        }
        sleep(step).await;
        waited += step;
    }
}
