// chbulk-server - HTTP front end for the buffering proxy
//
// Thin plumbing around chbulk-core: request classification at the edge,
// immediate acknowledgment for buffered inserts, verbatim pass-through for
// everything else, and signal-driven graceful shutdown that drains all
// buffered and in-flight work before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use chbulk_config::Config;
use chbulk_core::{Collector, DedupCache, DedupOptions, Dumper, Sender};
use tokio::signal;
use tracing::{info, warn};

mod handlers;
mod init;

pub use init::init_tracing;

use handlers::{health_check, read_handler, status_handler, write_handler};

/// Hard cap on the shutdown drain; buffers still unsent past this point
/// have already been diverted to the overflow store by the sender.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Application state shared across all requests.
#[derive(Clone)]
pub(crate) struct AppState {
    pub collector: Arc<Collector>,
    pub sender: Sender,
    pub debug: bool,
}

pub fn router(collector: Arc<Collector>, sender: Sender, debug: bool) -> Router {
    let state = AppState {
        collector,
        sender,
        debug,
    };
    Router::new()
        .route("/", get(read_handler).post(write_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Graceful shutdown handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Drain outstanding work: flush every buffer, then block until the sender
/// reports no in-flight batches and the collector no pending buffers.
pub async fn safe_quit(collector: &Arc<Collector>, sender: &Sender) {
    collector.flush_all();
    let outstanding = sender.len();
    if outstanding > 0 {
        info!(batches = outstanding, "waiting for in-flight batches");
    }
    while !(collector.is_empty() && sender.is_empty()) {
        collector.wait_flush().await;
    }
}

/// Wire the pipeline from a resolved config and serve until shutdown.
pub async fn run_with_config(config: Config) -> Result<()> {
    let sender = Sender::new(
        config.clickhouse.down_timeout(),
        config.clickhouse.connect_timeout(),
    )
    .context("failed to build http client")?;
    for url in &config.clickhouse.servers {
        sender.add_server(url);
    }

    let dumper = Dumper::new(&config.dump_dir)
        .with_context(|| format!("failed to prepare dump directory {}", config.dump_dir))?;
    sender.set_dumper(dumper.clone());
    let _replay = match config.dump_check_interval() {
        Some(interval) => {
            info!(secs = interval.as_secs(), "overflow replay sweep enabled");
            Some(dumper.listen(sender.clone(), interval))
        }
        None => {
            info!("overflow replay sweep disabled");
            None
        }
    };

    let cache = Arc::new(
        DedupCache::new(DedupOptions {
            shards: config.cache.shards,
            life_window: config.cache.life_window(),
            clean_window: config.cache.clean_window().unwrap_or(Duration::ZERO),
            max_entries_in_window: config.cache.max_entries_in_window,
            max_bytes: config.cache.max_bytes(),
            verbose: config.cache.verbose,
        })
        .context("invalid cache configuration")?,
    );
    if let Some(clean_window) = config.cache.clean_window() {
        cache.start_sweeper(clean_window);
    }

    let collector = Arc::new(Collector::new(
        sender.clone(),
        config.flush_count,
        config.flush_interval(),
        Some(cache),
    ));
    let flusher = collector.start();

    let app = router(Arc::clone(&collector), sender.clone(), config.debug);
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen))?;

    info!("chbulk listening on http://{}", config.listen);
    info!(
        flush_count = config.flush_count,
        flush_interval_ms = config.flush_interval_ms,
        servers = config.clickhouse.servers.len(),
        "buffering configured"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining buffers before exit");
    if tokio::time::timeout(SHUTDOWN_DEADLINE, safe_quit(&collector, &sender))
        .await
        .is_err()
    {
        warn!("shutdown drain deadline exceeded");
    }
    flusher.abort();

    info!("shutdown complete");
    Ok(())
}
