//! Emoji Analytics — Binary Entrypoint
//! Boots the event consumer, the configured source and the Axum HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use emoji_analytics::config::{load_config_default, SourceKind};
use emoji_analytics::ingest::sources::{LineSource, TcpSource};
use emoji_analytics::ingest::{spawn_consumer, spawn_source};
use emoji_analytics::metrics::Metrics;
use emoji_analytics::{api, Aggregator, AppState};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Compact human logs by default; `LOG_FORMAT=json` for structured output.
/// Filter comes from `RUST_LOG`, falling back to `emoji_analytics=info,warn`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("emoji_analytics=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialized: {e}");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed; serving until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn run() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default().context("loading configuration")?;
    tracing::info!(?cfg, "configuration loaded");

    // Recorder must be installed before anything describes metrics.
    let metrics = if cfg.metrics {
        Some(Metrics::init(cfg.window_minutes)?)
    } else {
        None
    };

    let aggregator = Arc::new(Aggregator::new(cfg.window_minutes));
    let (tx, rx) = mpsc::channel(cfg.channel_capacity);
    let consumer = spawn_consumer(rx, Arc::clone(&aggregator));

    let source = match cfg.source {
        SourceKind::Stdin => Some(spawn_source(Box::new(LineSource::stdin()), tx.clone())),
        SourceKind::Tcp => {
            let src = TcpSource::bind(&cfg.tcp_addr).await?;
            Some(spawn_source(Box::new(src), tx.clone()))
        }
        SourceKind::None => None,
    };

    let mut app = api::router(AppState {
        aggregator,
        events: tx,
    });
    if let Some(m) = &metrics {
        app = app.merge(m.router());
    }

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding http listener on {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    if let Some(handle) = source {
        handle.abort();
        let _ = handle.await;
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, consumer).await {
        Ok(Ok(recorded)) => tracing::info!(recorded, "consumer drained"),
        Ok(Err(e)) => tracing::warn!(error = %e, "consumer task failed"),
        Err(_) => tracing::warn!("consumer still has open senders, not waiting"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(run());
    // A pending stdin read lives on a blocking thread and cannot be cancelled.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
