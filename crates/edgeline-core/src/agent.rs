//! Candidate agents: the executors a decision can point at.
//!
//! Agents are discovered and health-checked by an external registry. The
//! engine only consumes the descriptors; it never talks to an agent.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference to an executor: a robot, a vision pipeline, a human queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRef(pub String);

impl AgentRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Health as reported by the external registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    #[default]
    Healthy,
    /// Usable, but its score is halved.
    Degraded,
    /// Never selected.
    Unhealthy,
}

impl AgentHealth {
    /// Multiplier applied to the capability score.
    pub fn weight(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }

    pub fn is_available(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

/// Where an agent lives relative to this edge node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLocation {
    /// Reachable from this node without the cloud.
    #[default]
    Local,
    /// Only reachable through the cloud orchestrator.
    Cloud,
}

/// One `{agent_ref, capability_score, current_load, health}` tuple from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAgent {
    pub agent_ref: AgentRef,
    /// How well the agent fits the task type, 0.0..=1.0.
    pub capability_score: f64,
    /// Fraction of capacity currently assigned, 0.0..=1.0.
    pub current_load: f64,
    /// Historical failure rate, 0.0..=1.0. Tie-breaker only.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default)]
    pub health: AgentHealth,
    #[serde(default)]
    pub location: AgentLocation,
    /// True when the agent executes on this node's own compute (e.g. a
    /// vision pipeline), so local resource headroom limits it.
    #[serde(default)]
    pub on_node: bool,
}

impl CandidateAgent {
    pub fn new(agent_ref: impl Into<String>, capability_score: f64, current_load: f64) -> Self {
        Self {
            agent_ref: AgentRef(agent_ref.into()),
            capability_score,
            current_load,
            failure_rate: 0.0,
            health: AgentHealth::Healthy,
            location: AgentLocation::Local,
            on_node: false,
        }
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate;
        self
    }

    pub fn with_health(mut self, health: AgentHealth) -> Self {
        self.health = health;
        self
    }

    pub fn with_location(mut self, location: AgentLocation) -> Self {
        self.location = location;
        self
    }

    pub fn on_node(mut self) -> Self {
        self.on_node = true;
        self
    }

    /// Usable without any network round trip.
    pub fn is_local_candidate(&self) -> bool {
        self.location == AgentLocation::Local && self.health.is_available()
    }
}
