//! Trade Capture Backend
//!
//! Ingest half of the trading pipeline: consumes a durable trade stream,
//! audits every message, stages valid trades in a transactional outbox and
//! dispatches them downstream with strict per-portfolio ordering.

use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trade_capture::api::{self, AdminState};
use trade_capture::config::AppConfig;
use trade_capture::downstream::InMemoryEventLog;
use trade_capture::runtime::CaptureRuntime;
use trade_capture::store::SafeStore;
use trade_capture::stream::source::LoopbackFeed;
use trade_capture::stream::FlowControl;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trade_capture=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let cfg = AppConfig::from_env();
    info!(db = %cfg.db_path, admin = %cfg.admin_addr, "starting trade capture backend");

    let store = Arc::new(SafeStore::open(&cfg.db_path).context("open capture database")?);

    // Loopback stand-ins for the external brokers: the stream is fed through
    // the replay endpoint and dispatched records land in an in-process log.
    // Production wiring swaps these for the real broker adapters.
    let feed = Arc::new(LoopbackFeed::new());
    let downstream = Arc::new(InMemoryEventLog::new());

    let runtime = CaptureRuntime::build(&cfg, store.clone(), downstream, feed.clone());
    runtime.offsets.register(feed.clone());
    runtime.start();

    let state = AdminState {
        receiver: runtime.receiver.clone(),
        store,
    };
    let listener = TcpListener::bind(&cfg.admin_addr)
        .await
        .with_context(|| format!("bind admin listener on {}", cfg.admin_addr))?;
    info!(addr = %cfg.admin_addr, "admin server listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("admin server")?;

    // Stream delivery is quiet once the admin server stops accepting
    // replays; drain the buffer, then let the dispatcher finish its group.
    feed.pause();
    runtime.stop();

    Ok(())
}
