//! edgelined: edge decision daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use edgeline_core::config::EdgelineConfig;
use edgeline_core::error::EngineError;
use edgeline_engine::ingress::{self, IngressReply};
use edgeline_engine::monitor::LinuxSampler;
use edgeline_engine::remote::{OfflineRemote, RemoteDecisionService};
use edgeline_engine::telemetry::{SharedSink, TracingSink};
use edgeline_engine::transport::ClusterTransport;
use edgeline_engine::EdgeNode;

mod gossip;
mod http_remote;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config. Anything invalid is fatal: a node never runs with an
    // undefined budget.
    if let Err(e) = EdgelineConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = EdgelineConfig::load().context("failed to load config")?;
    let budgets = config.validate().map_err(EngineError::from)?;

    tracing::info!(
        node = %config.node_id(),
        zone = %config.node.zone,
        safety_us = budgets.budget(edgeline_core::PriorityClass::SafetyCritical).as_micros() as u64,
        standard_us = budgets.budget(edgeline_core::PriorityClass::Standard).as_micros() as u64,
        "edgelined starting"
    );

    // Telemetry and upstream
    let telemetry: SharedSink = Arc::new(TracingSink);
    let remote: Arc<dyn RemoteDecisionService> = if config.remote.endpoint.is_empty() {
        tracing::warn!("no remote endpoint configured, node will run autonomously");
        Arc::new(OfflineRemote)
    } else {
        tracing::info!(endpoint = %config.remote.endpoint, "remote decision service");
        Arc::new(http_remote::HttpRemote::new(
            &config.remote.endpoint,
            Duration::from_millis(config.remote.request_timeout_ms),
        )?)
    };

    let (node, background) = EdgeNode::build(&config, budgets, remote, telemetry);

    // Cluster gossip
    let transport: Option<Arc<dyn ClusterTransport>> = if config.cluster.enabled {
        let t = gossip::GossipTransport::bind(
            &config.cluster.interface,
            config.cluster.port,
            node.node_id.clone(),
        )
        .context("failed to start cluster gossip")?;
        Some(Arc::new(t))
    } else {
        tracing::info!("clustering disabled, running as standalone primary");
        None
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let background_tasks = background.spawn(LinuxSampler::new(), transport);

    let workers = ingress::worker_count(config.ingress.workers);
    let (event_tx, event_rx) = mpsc::channel(config.ingress.queue_depth.max(1));
    let (reply_tx, reply_rx) = mpsc::channel(config.ingress.queue_depth.max(1));
    let mut ingress_task = tokio::spawn(ingress::run_stream(
        node.router.clone(),
        event_rx,
        reply_tx,
        workers,
    ));
    let reply_logger = tokio::spawn(log_replies(reply_rx));

    let stats_printer = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                print_stats(&node);
            }
        })
    };

    // HTTP API
    let mut api_task = {
        let state = edgeline_api::ApiState::new(node.clone(), event_tx, shutdown_tx.clone());
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = edgeline_api::serve(state, port).await {
                tracing::error!(error = %e, "api server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = &mut api_task       => tracing::error!("api server exited: {:?}", r),
        r = &mut ingress_task   => tracing::error!("ingress exited: {:?}", r),
    }

    api_task.abort();
    ingress_task.abort();
    reply_logger.abort();
    stats_printer.abort();
    for t in background_tasks {
        t.abort();
    }
    print_stats(&node);
    Ok(())
}

async fn log_replies(mut rx: mpsc::Receiver<IngressReply>) {
    while let Some(reply) = rx.recv().await {
        match reply.result {
            Ok(d) => tracing::trace!(task_id = %d.task_id, route = d.route.as_str(), "event decided"),
            Err(e) => tracing::warn!(task_id = %reply.task_id, error = %e, "event rejected"),
        }
    }
}

fn print_stats(node: &EdgeNode) {
    let stats = node.router.stats();
    let cache = node.cache.stats();
    let conn = node.connectivity.view();
    let view = node.cluster_view();
    tracing::info!(
        role = ?view.role,
        epoch = view.epoch,
        mode = conn.mode.as_str(),
        pending_sync = conn.pending_sync,
        by_cache = stats.by_cache,
        by_router = stats.by_router,
        by_manager = stats.by_manager,
        by_fallback = stats.by_fallback,
        rejected = stats.rejected,
        hot = cache.hot,
        warm = cache.warm,
        predictive = cache.predictive,
        "node snapshot"
    );
    for class in stats.classes.iter().filter(|c| c.decisions > 0) {
        tracing::info!(
            class = class.priority_class.as_str(),
            decisions = class.decisions,
            expired = class.expired,
            mean_ns = class.mean_ns,
            max_ns = class.max_ns,
            budget_us = class.budget_us,
            "  class latency"
        );
    }
}
