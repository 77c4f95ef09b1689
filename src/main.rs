use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

use qgate::config::Config;
use qgate::health;
use qgate::metrics;
use qgate::monitoring;
use qgate::proxy::ProxyServer;
use qgate::shutdown::{ShutdownManager, ShutdownSignal};
use qgate::storage::TrafficStore;
use qgate::tracker::ConnectionTracker;

#[derive(Parser)]
#[command(name = "qgate")]
#[command(about = "Quantum-routed traffic interception gateway")]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("qgate={}", level))
        .init();

    info!("Starting qgate traffic interceptor");

    let mut config = match &args.config {
        Some(path) => Config::from_file_with_env(path).await?,
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let config = Arc::new(config);

    let store = TrafficStore::connect(&config.storage).await?;
    let tracker = ConnectionTracker::new();
    let shutdown = Arc::new(ShutdownManager::new(Duration::from_secs(
        config.server.shutdown_grace.unwrap_or(30),
    )));

    // Metrics pipeline: collector for the request path, background flush
    // and drain workers for persistence
    let (collector, worker) = metrics::collector(
        config.metrics.clone(),
        Arc::new(store.clone()),
        tracker.clone(),
    );
    let (flush_task, drain_task) = worker.spawn(shutdown.subscribe(), shutdown.subscribe());

    let monitoring_task = if config.monitoring.enabled {
        Some(monitoring::spawn_monitoring_server(
            config.monitoring.clone(),
            collector.clone(),
            shutdown.subscribe(),
        )?)
    } else {
        None
    };

    let health_task = health::spawn_health_loop(
        store.clone(),
        tracker.clone(),
        collector.clone(),
        config.monitoring.health_interval,
        shutdown.subscribe(),
    );

    let server = ProxyServer::new(
        Arc::clone(&config),
        store.clone(),
        collector,
        tracker,
        Arc::clone(&shutdown),
    );
    let mut server_task = tokio::spawn(server.run());

    let mut server_done = false;
    tokio::select! {
        result = &mut server_task => {
            server_done = true;
            if let Err(e) = result? {
                error!("Proxy server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            warn!("Received CTRL+C, shutting down gracefully...");
        }
    }

    shutdown.shutdown(ShutdownSignal::Graceful).await;

    // Join the background tasks; they all listen for the broadcast
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if !server_done {
            let _ = server_task.await;
        }
        let _ = flush_task.await;
        let _ = drain_task.await;
        let _ = health_task.await;
        if let Some(task) = monitoring_task {
            let _ = task.await;
        }
    })
    .await;

    store.close().await;
    info!("qgate shutdown complete");
    Ok(())
}
