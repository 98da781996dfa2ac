//! edgeline-core: shared types, configuration, and the cluster wire format.
//! All other Edgeline crates depend on this one.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod decision;
pub mod error;
pub mod task;
pub mod wire;

pub use agent::{AgentHealth, AgentLocation, AgentRef, CandidateAgent};
pub use cluster::{ClusterMessage, Heartbeat, NodeId, NodeRole};
pub use config::{ConfigError, EdgelineConfig, LatencyBudgets};
pub use decision::{unix_ms, Decision, ProducedBy, Route};
pub use error::EngineError;
pub use task::{ClassificationKey, PriorityClass, Task, TaskId, TaskShape};
