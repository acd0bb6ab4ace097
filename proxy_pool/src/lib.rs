//! Open proxy discovery, validation and serving service.

pub mod api;
pub mod checker;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod snapshot;
pub mod storage;
pub mod zmap;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use proxy_feed::Aggregator;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::api::ApiContext;
use crate::checker::Checker;
use crate::config::Config;
use crate::metrics::Collector;
use crate::orchestrator::Orchestrator;
use crate::snapshot::SnapshotStore;
use crate::zmap::ZmapScanner;

/// Run the proxy pool service.
pub fn run() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let config = Config::load(&args.config).with_context(|| format!("loading {}", args.config))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    if config.logging.format == "json" {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("starting proxy pool service v{}", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(Collector::new(&config.metrics.namespace));

    let storage = storage::open(&config.storage)
        .await
        .context("initializing storage")?;
    let snapshot = Arc::new(SnapshotStore::new(
        storage,
        config.storage.persist_interval_seconds,
        metrics.clone(),
    ));
    if let Err(e) = snapshot.load_from_storage().await {
        warn!("failed to load persisted snapshot: {e} (starting fresh)");
    }

    let aggregator = Aggregator::new(config.aggregator.clone());
    let checker = Checker::new(config.checker.clone(), metrics.clone())?;

    let zmap = if config.zmap.enabled {
        match zmap::preflight::verify_setup(&config.zmap) {
            Ok(()) => {
                info!("scanner enabled for ports {:?}", config.zmap.ports);
                Some(Arc::new(ZmapScanner::new(config.zmap.clone(), metrics.clone())))
            }
            Err(e) => {
                warn!("scanner pre-flight failed: {e}");
                warn!("scanning disabled for this session");
                None
            }
        }
    } else {
        info!("scanning disabled");
        None
    };

    let cancel = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::channel(1);

    let persist_task = tokio::spawn({
        let snapshot = snapshot.clone();
        let cancel = cancel.child_token();
        async move { snapshot.run_periodic_persist(cancel).await }
    });

    let orchestrator = Orchestrator::new(
        config.clone(),
        aggregator,
        checker,
        zmap.clone(),
        snapshot.clone(),
        metrics.clone(),
    );
    let cycle_task = tokio::spawn({
        let cancel = cancel.child_token();
        async move { orchestrator.run(cancel, reload_rx).await }
    });

    let api_key = match std::env::var(&config.api.api_key_env) {
        Ok(key) if !key.is_empty() => Some(key),
        _ => None,
    };
    let addr: SocketAddr = config
        .api
        .addr
        .parse()
        .with_context(|| format!("invalid api.addr: {}", config.api.addr))?;
    let ctx = Arc::new(ApiContext::new(
        &config,
        snapshot,
        metrics,
        zmap,
        reload_tx,
        api_key,
    ));
    let mut api_task = tokio::spawn({
        let cancel = cancel.child_token();
        async move { api::serve(ctx, addr, cancel).await }
    });

    tokio::select! {
        joined = &mut api_task => {
            cancel.cancel();
            let _ = cycle_task.await;
            let _ = persist_task.await;
            joined?.context("API server failed")?;
            anyhow::bail!("API server exited unexpectedly");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("shutting down gracefully");
        }
    }

    cancel.cancel();
    let _ = cycle_task.await;
    // The persistence task flushes one final durable write on cancellation.
    let _ = persist_task.await;
    if let Ok(Err(e)) = api_task.await {
        warn!("API shutdown error: {e}");
    }

    info!("shutdown complete");
    Ok(())
}
