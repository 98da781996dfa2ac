//! Remote decision service contract.
//!
//! The cloud orchestrator makes Standard (and some EfficiencyCritical)
//! decisions, validates local QualityCritical decisions after the fact,
//! answers heartbeats, and receives decisions made while the node was
//! autonomous. Transport is the implementor's business; the daemon uses
//! HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use edgeline_core::agent::AgentRef;
use edgeline_core::decision::{Decision, Route};
use edgeline_core::task::{ClassificationKey, Task};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected request: {0}")]
    Rejected(String),
    #[error("no remote endpoint configured")]
    Offline,
}

/// The cloud's answer for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    /// `Remote` when the cloud keeps the task, `Local` when it hands it back
    /// to an agent reachable from this node.
    pub route: Route,
    pub agent_ref: Option<AgentRef>,
}

/// One autonomous-mode decision awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Append order, starting at 1. Never reused.
    pub seq: u64,
    pub key: ClassificationKey,
    pub decision: Decision,
    pub recorded_at_ms: u64,
}

/// Acknowledgement for a sync batch: every record with `seq <= acked_through`
/// has been durably accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub acked_through: u64,
}

#[async_trait]
pub trait RemoteDecisionService: Send + Sync {
    /// Ask the cloud to decide. Callers also bound this with their own
    /// timeout and drop the future on expiry.
    async fn remote_decide(&self, task: &Task, timeout: Duration)
        -> Result<RemoteVerdict, RemoteError>;

    /// Liveness probe. Returns the observed round trip.
    async fn heartbeat(&self) -> Result<Duration, RemoteError>;

    /// Upload reconciliation records, oldest first.
    async fn submit_sync_batch(&self, records: &[SyncRecord]) -> Result<SyncAck, RemoteError>;
}

/// Used when no endpoint is configured. Every call fails, so the node runs
/// autonomously from the first heartbeats on.
pub struct OfflineRemote;

#[async_trait]
impl RemoteDecisionService for OfflineRemote {
    async fn remote_decide(&self, _task: &Task, _timeout: Duration) -> Result<RemoteVerdict, RemoteError> {
        Err(RemoteError::Offline)
    }

    async fn heartbeat(&self) -> Result<Duration, RemoteError> {
        Err(RemoteError::Offline)
    }

    async fn submit_sync_batch(&self, _records: &[SyncRecord]) -> Result<SyncAck, RemoteError> {
        Err(RemoteError::Offline)
    }
}
