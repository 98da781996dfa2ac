//! Decisions: the routing outcome for a task.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::agent::AgentRef;
use crate::task::{PriorityClass, TaskId};

/// Where the task is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Local,
    Remote,
    /// Decided locally; the cloud re-decides in the background for audit.
    LocalWithAsyncValidation,
    /// The budget elapsed before a decision could be produced. Terminal.
    Expired,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::LocalWithAsyncValidation => "local_with_async_validation",
            Self::Expired => "expired",
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::Local | Self::LocalWithAsyncValidation)
    }
}

/// Which component produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducedBy {
    Cache,
    Router,
    Manager,
    /// Local substitute after a remote failure, or any local decision made
    /// while the node is autonomous.
    Fallback,
}

impl ProducedBy {
    pub const ALL: [ProducedBy; 4] = [
        ProducedBy::Cache,
        ProducedBy::Router,
        ProducedBy::Manager,
        ProducedBy::Fallback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Router => "router",
            Self::Manager => "manager",
            Self::Fallback => "fallback",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The routing outcome for one task. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub task_id: TaskId,
    pub priority_class: PriorityClass,
    pub route: Route,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<AgentRef>,
    pub decision_latency_ns: u64,
    pub produced_by: ProducedBy,
    /// Unix ms after which a cached copy must not be served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until_ms: Option<u64>,
}

impl Decision {
    pub fn expired(
        task_id: TaskId,
        priority_class: PriorityClass,
        decision_latency_ns: u64,
        produced_by: ProducedBy,
    ) -> Self {
        Self {
            task_id,
            priority_class,
            route: Route::Expired,
            agent_ref: None,
            decision_latency_ns,
            produced_by,
            valid_until_ms: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.route == Route::Expired
    }

    /// Re-issue this decision for another task that shares its classification key.
    pub fn reissue(&self, task_id: TaskId, produced_by: ProducedBy, latency_ns: u64) -> Self {
        Self {
            task_id,
            priority_class: self.priority_class,
            route: self.route,
            agent_ref: self.agent_ref.clone(),
            decision_latency_ns: latency_ns,
            produced_by,
            valid_until_ms: self.valid_until_ms,
        }
    }
}

/// Wall-clock unix milliseconds.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_decision_has_no_agent() {
        let d = Decision::expired(
            TaskId::from("t-1"),
            PriorityClass::SafetyCritical,
            1_500_000,
            ProducedBy::Router,
        );
        assert!(d.is_expired());
        assert!(d.agent_ref.is_none());
        assert!(d.valid_until_ms.is_none());
    }

    #[test]
    fn reissue_keeps_route_and_agent() {
        let original = Decision {
            task_id: TaskId::from("t-1"),
            priority_class: PriorityClass::Standard,
            route: Route::Remote,
            agent_ref: Some(AgentRef::from("cell-7")),
            decision_latency_ns: 40_000_000,
            produced_by: ProducedBy::Manager,
            valid_until_ms: Some(10),
        };
        let copy = original.reissue(TaskId::from("t-2"), ProducedBy::Cache, 900);
        assert_eq!(copy.task_id.as_str(), "t-2");
        assert_eq!(copy.route, Route::Remote);
        assert_eq!(copy.agent_ref, original.agent_ref);
        assert_eq!(copy.produced_by, ProducedBy::Cache);
        assert_eq!(copy.decision_latency_ns, 900);
    }

    #[test]
    fn route_json_is_snake_case() {
        let json = serde_json::to_string(&Route::LocalWithAsyncValidation).unwrap();
        assert_eq!(json, "\"local_with_async_validation\"");
    }
}
