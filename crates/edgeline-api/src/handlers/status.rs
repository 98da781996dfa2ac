//! /status, /cache, /connectivity, /cluster, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use edgeline_core::cluster::{NodeId, NodeRole};
use edgeline_engine::autonomy::ConnectivityView;
use edgeline_engine::cache::{CacheEntryView, CacheStats};
use edgeline_engine::cluster::ClusterView;
use edgeline_engine::monitor::ResourceSnapshot;
use edgeline_engine::router::RouterStats;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub epoch: u64,
    pub connectivity: ConnectivityView,
    pub resources: ResourceSnapshot,
    pub router: RouterStats,
    pub cache: CacheStats,
    pub agents: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = &state.node;
    let cluster = node.cluster_view();
    Json(StatusResponse {
        node_id: node.node_id.clone(),
        role: cluster.role,
        epoch: cluster.epoch,
        connectivity: node.connectivity.view(),
        resources: node.monitor.snapshot(),
        router: node.router.stats(),
        cache: node.cache.stats(),
        agents: node.registry.agent_count(),
    })
}

// ── /cache ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CacheResponse {
    pub stats: CacheStats,
    pub entries: Vec<CacheEntryView>,
}

pub async fn handle_cache(State(state): State<ApiState>) -> Json<CacheResponse> {
    Json(CacheResponse {
        stats: state.node.cache.stats(),
        entries: state.node.cache.entries(),
    })
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

pub async fn handle_cache_clear(State(state): State<ApiState>) -> Json<ClearResponse> {
    let cleared = state.node.cache.clear();
    tracing::info!(cleared, "cache cleared via API");
    Json(ClearResponse { cleared })
}

// ── /connectivity, /cluster ───────────────────────────────────────────────────

pub async fn handle_connectivity(State(state): State<ApiState>) -> Json<ConnectivityView> {
    Json(state.node.connectivity.view())
}

pub async fn handle_cluster(State(state): State<ApiState>) -> Json<ClusterView> {
    Json(state.node.cluster_view())
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
