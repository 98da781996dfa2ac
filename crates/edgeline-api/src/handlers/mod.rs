//! HTTP API handlers: exposes node state as JSON and accepts tasks.

pub mod agents;
pub mod status;
pub mod tasks;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;

use edgeline_core::decision::unix_ms;
use edgeline_core::task::{Task, TaskId};
use edgeline_engine::{EdgeNode, SubmitError};

#[derive(Clone)]
pub struct ApiState {
    pub node: EdgeNode,
    /// Event-stream ingress; drained by the worker pool.
    pub events: tokio::sync::mpsc::Sender<Task>,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
    next_id: Arc<AtomicU64>,
}

impl ApiState {
    pub fn new(
        node: EdgeNode,
        events: tokio::sync::mpsc::Sender<Task>,
        shutdown_tx: tokio::sync::broadcast::Sender<()>,
    ) -> Self {
        Self {
            node,
            events,
            shutdown_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Id for a task submitted without one.
    fn assign_id(&self) -> TaskId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        TaskId(format!("{}-{}-{}", self.node.node_id, unix_ms(), n))
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn bad_request(msg: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn submit_error(e: SubmitError) -> (StatusCode, String) {
    let status = match e {
        SubmitError::InFlight(_) => StatusCode::CONFLICT,
        SubmitError::NotPrimary { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use agents::{handle_agents, handle_set_agents};
pub use status::{
    handle_cache, handle_cache_clear, handle_cluster, handle_connectivity, handle_shutdown,
    handle_status,
};
pub use tasks::{handle_events, handle_submit_task};
