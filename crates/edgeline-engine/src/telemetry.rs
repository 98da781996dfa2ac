//! Telemetry: structured records for the external observability collector.
//!
//! The engine emits through `TelemetrySink`. The daemon renders events as
//! `tracing` events under the `edgeline::telemetry` target; tests collect
//! them with `RecordingSink` or `ChannelSink`.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use edgeline_core::agent::AgentRef;
use edgeline_core::cluster::NodeId;
use edgeline_core::decision::{Decision, ProducedBy, Route};
use edgeline_core::task::{ClassificationKey, PriorityClass, TaskId};

use crate::autonomy::ConnectivityMode;
use crate::cache::Tier;

/// Why a remote dispatch happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPurpose {
    Decide,
    Validate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Decision {
        task_id: TaskId,
        priority_class: PriorityClass,
        route: Route,
        agent_ref: Option<AgentRef>,
        latency_ns: u64,
        produced_by: ProducedBy,
    },
    RemoteDispatch {
        task_id: TaskId,
        purpose: DispatchPurpose,
        ok: bool,
        elapsed_us: u64,
    },
    Fallback {
        task_id: TaskId,
        priority_class: PriorityClass,
        reason: String,
    },
    CacheTierTransition {
        key: ClassificationKey,
        from: Tier,
        /// `None` = evicted.
        to: Option<Tier>,
        reason: &'static str,
    },
    CacheCorruption {
        key: ClassificationKey,
        agent: AgentRef,
    },
    Failover {
        node_id: NodeId,
        previous_primary: Option<NodeId>,
        epoch: u64,
        /// Time from first suspecting the primary to promotion.
        detection_to_promotion_us: u64,
    },
    SplitBrain {
        local: NodeId,
        remote: NodeId,
        epoch: u64,
        yielded: bool,
    },
    ConnectivityChange {
        from: ConnectivityMode,
        to: ConnectivityMode,
        pending: usize,
    },
    ValidationDisagreement {
        task_id: TaskId,
        local_agent: Option<AgentRef>,
        remote_agent: Option<AgentRef>,
    },
    SyncLogOverflow {
        dropped_task_id: TaskId,
        pending: usize,
        dropped_total: u64,
    },
}

impl TelemetryEvent {
    pub fn decision(d: &Decision) -> Self {
        Self::Decision {
            task_id: d.task_id.clone(),
            priority_class: d.priority_class,
            route: d.route,
            agent_ref: d.agent_ref.clone(),
            latency_ns: d.decision_latency_ns,
            produced_by: d.produced_by,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Decision { .. } => "decision",
            Self::RemoteDispatch { .. } => "remote_dispatch",
            Self::Fallback { .. } => "fallback",
            Self::CacheTierTransition { .. } => "cache_tier_transition",
            Self::CacheCorruption { .. } => "cache_corruption",
            Self::Failover { .. } => "failover",
            Self::SplitBrain { .. } => "split_brain",
            Self::ConnectivityChange { .. } => "connectivity_change",
            Self::ValidationDisagreement { .. } => "validation_disagreement",
            Self::SyncLogOverflow { .. } => "sync_log_overflow",
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

pub type SharedSink = Arc<dyn TelemetrySink>;

/// Renders every event as one structured tracing event.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::Decision {
                task_id,
                priority_class,
                route,
                agent_ref,
                latency_ns,
                produced_by,
            } => tracing::info!(
                target: "edgeline::telemetry",
                event = "decision",
                task_id = %task_id,
                priority_class = priority_class.as_str(),
                route = route.as_str(),
                agent_ref = agent_ref.as_ref().map(|a| a.as_str()).unwrap_or("-"),
                latency_ns,
                produced_by = produced_by.as_str(),
                "decision"
            ),
            TelemetryEvent::SplitBrain { .. } | TelemetryEvent::SyncLogOverflow { .. } => {
                let fields = serde_json::to_string(&event).unwrap_or_default();
                tracing::error!(target: "edgeline::telemetry", event = event.name(), %fields);
            }
            _ => {
                let fields = serde_json::to_string(&event).unwrap_or_default();
                tracing::info!(target: "edgeline::telemetry", event = event.name(), %fields);
            }
        }
    }
}

/// Forwards events to a channel. Never blocks; events are dropped once the
/// receiver is gone.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.name() == name).count())
            .unwrap_or(0)
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision_event() -> TelemetryEvent {
        TelemetryEvent::Decision {
            task_id: TaskId::from("t-1"),
            priority_class: PriorityClass::Standard,
            route: Route::Local,
            agent_ref: Some(AgentRef::from("arm-1")),
            latency_ns: 1200,
            produced_by: ProducedBy::Manager,
        }
    }

    #[test]
    fn decision_record_has_required_fields() {
        let json = serde_json::to_value(decision_event()).unwrap();
        assert_eq!(json["event"], "decision");
        for field in ["task_id", "priority_class", "route", "latency_ns", "produced_by"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn recording_sink_counts_by_name() {
        let sink = RecordingSink::new();
        sink.emit(decision_event());
        sink.emit(decision_event());
        assert_eq!(sink.count("decision"), 2);
        assert_eq!(sink.count("fallback"), 0);
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(decision_event());
        assert_eq!(rx.recv().await.unwrap(), decision_event());
    }

    #[test]
    fn tracing_sink_accepts_every_event() {
        TracingSink.emit(decision_event());
        TracingSink.emit(TelemetryEvent::SplitBrain {
            local: NodeId::from("a"),
            remote: NodeId::from("b"),
            epoch: 2,
            yielded: true,
        });
    }
}
