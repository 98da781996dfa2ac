//! Engine error taxonomy.
//!
//! Only `DeadlineExceeded` (surfaced as an `Expired` decision) and
//! `Configuration` ever reach an operator. Everything else is recovered
//! inline and shows up in telemetry only.

use crate::agent::AgentRef;
use crate::cluster::NodeId;
use crate::config::ConfigError;
use crate::task::{ClassificationKey, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Budget elapsed before a decision existed. Never retried automatically.
    #[error("task {task_id} exceeded its {budget_us}us decision budget")]
    DeadlineExceeded { task_id: TaskId, budget_us: u64 },

    /// Remote dispatch failed or timed out. Always recovered locally.
    #[error("remote decision service unavailable: {0}")]
    RemoteUnavailable(String),

    /// Cached decision points at an agent the registry no longer knows.
    #[error("cache entry {key} references unknown agent {agent}")]
    CacheCorruption {
        key: ClassificationKey,
        agent: AgentRef,
    },

    /// Two nodes both acting as Primary in the same epoch.
    #[error("split brain between {local} and {remote} in epoch {epoch}")]
    ClusterSplitBrain {
        local: NodeId,
        remote: NodeId,
        epoch: u64,
    },

    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl EngineError {
    /// Stable label for telemetry and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::CacheCorruption { .. } => "cache_corruption",
            Self::ClusterSplitBrain { .. } => "cluster_split_brain",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_convert_and_keep_their_kind() {
        let err = EngineError::from(ConfigError::InvalidNodeId("bad id".into()));
        assert_eq!(err.kind(), "configuration_error");
        assert!(err.to_string().contains("bad id"));
    }

    #[test]
    fn deadline_message_names_task_and_budget() {
        let err = EngineError::DeadlineExceeded {
            task_id: TaskId::from("t-9"),
            budget_us: 1_000,
        };
        assert_eq!(err.to_string(), "task t-9 exceeded its 1000us decision budget");
    }
}
