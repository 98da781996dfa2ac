//! Edgeline integration test harness.
//!
//! Every test runs whole engines in-process: a scripted cloud
//! (`SimulatedRemote`), an in-memory cluster hub with fault injection and
//! a recording telemetry sink. Time-sensitive tests run on a paused tokio
//! clock, so timeouts and heartbeats are deterministic.

use std::sync::Arc;

use edgeline_core::agent::CandidateAgent;
use edgeline_core::config::{AgentSeed, EdgelineConfig};
use edgeline_core::task::{PriorityClass, Task};
use edgeline_engine::monitor::FixedSampler;
use edgeline_engine::sim::SimulatedRemote;
use edgeline_engine::telemetry::{RecordingSink, TelemetryEvent};
use edgeline_engine::{BackgroundTasks, EdgeNode};

mod autonomy;
mod budgets;
mod cache;
mod failover;
mod ingress;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Task type with two healthy local agents: `agent-a` (load 0.2) and
/// `agent-b` (load 0.5), equally capable.
pub const INSPECT: &str = "inspect";

pub struct Harness {
    pub node: EdgeNode,
    pub bg: BackgroundTasks,
    pub remote: SimulatedRemote,
    pub sink: Arc<RecordingSink>,
}

pub fn seeded_config() -> EdgelineConfig {
    let mut config = EdgelineConfig::default();
    config.agents = vec![
        AgentSeed {
            task_type: INSPECT.into(),
            agent: CandidateAgent::new("agent-a", 0.9, 0.2),
        },
        AgentSeed {
            task_type: INSPECT.into(),
            agent: CandidateAgent::new("agent-b", 0.9, 0.5),
        },
    ];
    config
}

/// Build a node from `config` with a fresh resource sample.
pub fn harness_with(config: EdgelineConfig) -> Harness {
    let budgets = config.validate().expect("test config must validate");
    let remote = SimulatedRemote::new();
    let sink = RecordingSink::new();
    let (node, mut bg) = EdgeNode::build(&config, budgets, Arc::new(remote.clone()), sink.clone());
    bg.monitor.sample_once(&mut FixedSampler::new(0.2, 0.3));
    Harness {
        node,
        bg,
        remote,
        sink,
    }
}

pub fn harness() -> Harness {
    harness_with(seeded_config())
}

pub fn task(id: &str, class: PriorityClass) -> Task {
    Task::new(id, INSPECT, class).with_context("cell", "7")
}

/// Decision telemetry events for one task id.
pub fn decisions_for(sink: &RecordingSink, id: &str) -> usize {
    sink.events()
        .iter()
        .filter(|e| matches!(e, TelemetryEvent::Decision { task_id, .. } if task_id.as_str() == id))
        .count()
}
