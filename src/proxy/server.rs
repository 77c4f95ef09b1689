//! Listener and per-connection dispatch.
//!
//! Manual accept loop: a semaphore bounds concurrent connections, every
//! accepted socket gets its own task serving HTTP/1.1 with upgrades enabled
//! (CONNECT tunnels), and a connection record brackets the whole exchange.
//! A failing connection is logged and closed; it never takes the listener
//! down with it.

use anyhow::Result;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::handler::ProxyHandler;
use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::ratelimit::RateLimiter;
use crate::shutdown::{ShutdownManager, TaskHandle};
use crate::storage::TrafficStore;
use crate::tracker::{ConnId, ConnectionState, ConnectionTracker};

/// Travels with every request of a connection: identifies the connection
/// record and keeps the capacity permit and shutdown accounting alive for
/// as long as anything (including a detached tunnel task) still uses the
/// socket.
#[derive(Clone)]
pub struct ConnGuard {
    pub conn_id: ConnId,
    _permit: Arc<OwnedSemaphorePermit>,
    _task: Arc<TaskHandle>,
}

pub struct ProxyServer {
    config: Arc<Config>,
    handler: ProxyHandler,
    rate_limiter: RateLimiter,
    tracker: ConnectionTracker,
    shutdown: Arc<ShutdownManager>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<Config>,
        store: TrafficStore,
        collector: MetricsCollector,
        tracker: ConnectionTracker,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let handler = ProxyHandler::new(
            Arc::clone(&config),
            rate_limiter.clone(),
            store,
            collector,
            tracker.clone(),
            Arc::clone(&shutdown),
        );
        Self {
            config,
            handler,
            rate_limiter,
            tracker,
            shutdown,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.bind).await?;
        info!("Proxy listening on {}", listener.local_addr()?);
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves)
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        let max_connections = self.config.server.max_connections.unwrap_or(1024);
        let semaphore = Arc::new(Semaphore::new(max_connections));
        let read_timeout = Duration::from_secs(self.config.server.read_timeout.unwrap_or(30));
        let mut shutdown_rx = self.shutdown.subscribe();

        // Idle rate-limit windows are pruned off the hot path
        let sweeper = {
            let rate_limiter = self.rate_limiter.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            let window = Duration::from_secs(self.config.rate_limit.window_secs);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(window);
                loop {
                    tokio::select! {
                        _ = tick.tick() => rate_limiter.sweep().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        loop {
            // Take a capacity slot before accepting; at the bound we simply
            // stop accepting and let the kernel backlog absorb the burst.
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "Failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => break,
            };

            let handler = self.handler.clone();
            let tracker = self.tracker.clone();
            let task = Arc::new(self.shutdown.task_handle());

            tokio::spawn(handle_connection(
                handler,
                tracker,
                stream,
                remote,
                permit,
                task,
                read_timeout,
            ));
        }

        let _ = sweeper.await;
        info!("Accept loop stopped");
        Ok(())
    }
}

async fn handle_connection(
    handler: ProxyHandler,
    tracker: ConnectionTracker,
    stream: TcpStream,
    remote: SocketAddr,
    permit: OwnedSemaphorePermit,
    task: Arc<TaskHandle>,
    read_timeout: Duration,
) {
    let conn_id = tracker.open(remote.to_string()).await;
    debug!(client = %remote, conn = conn_id, "Connection accepted");

    let guard = ConnGuard {
        conn_id,
        _permit: Arc::new(permit),
        _task: task,
    };

    let service_guard = guard.clone();
    let service = service_fn(move |mut req| {
        let handler = handler.clone();
        let guard = service_guard.clone();
        async move {
            req.extensions_mut().insert(remote);
            req.extensions_mut().insert(guard);
            handler.handle_request(req).await
        }
    });

    let served = Http::new()
        .http1_keep_alive(true)
        .http1_header_read_timeout(read_timeout)
        .serve_connection(stream, service)
        .with_upgrades()
        .await;

    if let Err(err) = served {
        debug!(client = %remote, error = %err, "Connection ended with error");
    }

    // A CONNECT upgrade hands the record to the tunnel task; everything
    // else gets cleaned up here, error paths included.
    if tracker.state(conn_id).await != Some(ConnectionState::Tunneling) {
        tracker.close(conn_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::metrics;
    use crate::shutdown::ShutdownSignal;

    async fn test_server() -> (ProxyServer, Arc<ShutdownManager>) {
        let config = Arc::new(Config::default());
        let store = TrafficStore::connect(&StorageConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
            connect_timeout: Some(5),
            busy_retries: Some(1),
        })
        .await
        .unwrap();
        let tracker = ConnectionTracker::new();
        let shutdown = Arc::new(ShutdownManager::new(Duration::from_millis(200)));
        let (collector, _worker) = metrics::collector(
            config.metrics.clone(),
            Arc::new(store.clone()),
            tracker.clone(),
        );
        let server = ProxyServer::new(
            config,
            store,
            collector,
            tracker,
            Arc::clone(&shutdown),
        );
        (server, shutdown)
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_shutdown() {
        let (server, shutdown) = test_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let run = tokio::spawn(server.run_on(listener));
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.shutdown(ShutdownSignal::Graceful).await;
        let result = tokio::time::timeout(Duration::from_secs(2), run).await;
        assert!(result.is_ok(), "accept loop should stop after shutdown");
    }

    #[tokio::test]
    async fn test_listener_survives_garbage_connection() {
        let (server, shutdown) = test_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let run = tokio::spawn(server.run_on(listener));

        // Write something that is not HTTP and drop the socket
        use tokio::io::AsyncWriteExt;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"\x00\x01\x02 not http\r\n\r\n").await.unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // The listener is still accepting
        let probe = TcpStream::connect(addr).await;
        assert!(probe.is_ok());

        shutdown.shutdown(ShutdownSignal::Graceful).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
    }
}
