//! Hierarchical decision manager.
//!
//! Owns the edge/cloud trust boundary: for every task the router delegates,
//! it picks a plan (purely local, local with background cloud validation,
//! or remote with a guaranteed local fallback) and carries it out inside the
//! task's deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use edgeline_core::agent::AgentRef;
use edgeline_core::config::RemoteConfig;
use edgeline_core::decision::{ProducedBy, Route};
use edgeline_core::error::EngineError;
use edgeline_core::task::{PriorityClass, Task};

use crate::agents::AgentRegistry;
use crate::autonomy::{Capability, ConnectivityHandle};
use crate::monitor::ResourceMonitor;
use crate::remote::{RemoteDecisionService, RemoteError, RemoteVerdict};
use crate::selection;
use crate::telemetry::{DispatchPurpose, SharedSink, TelemetryEvent};

/// How one task is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Local decision, nothing else.
    LocalSync,
    /// Local decision now, cloud re-decides in the background for audit.
    LocalWithValidation,
    /// Cloud decides within the budget; local fallback on timeout or error.
    RemoteWithFallback,
    /// Upstream is gone: local only, and the decision is a fallback.
    LocalOnly,
}

/// Everything `plan` looks at.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs {
    pub class: PriorityClass,
    pub has_local_candidate: bool,
    pub saturated: bool,
    pub autonomous: bool,
    pub remote_allowed: bool,
    pub validation_allowed: bool,
    /// Budget left for a remote round trip after the fallback reserve.
    pub remote_window: Duration,
    pub min_remote_slack: Duration,
}

/// Pure plan selection.
pub fn plan(i: PlanInputs) -> Plan {
    if i.autonomous {
        return Plan::LocalOnly;
    }
    let remote_fits = i.remote_allowed && i.remote_window >= i.min_remote_slack;
    match i.class {
        PriorityClass::SafetyCritical | PriorityClass::QualityCritical => {
            if i.has_local_candidate && i.validation_allowed {
                Plan::LocalWithValidation
            } else {
                Plan::LocalSync
            }
        }
        PriorityClass::EfficiencyCritical => {
            if (!i.has_local_candidate || i.saturated) && remote_fits {
                Plan::RemoteWithFallback
            } else {
                Plan::LocalSync
            }
        }
        PriorityClass::Standard => {
            if remote_fits {
                Plan::RemoteWithFallback
            } else {
                Plan::LocalSync
            }
        }
    }
}

/// What the manager decided, before the router stamps latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub route: Route,
    pub agent_ref: Option<AgentRef>,
    pub produced_by: ProducedBy,
}

impl Outcome {
    fn expired(produced_by: ProducedBy) -> Self {
        Self {
            route: Route::Expired,
            agent_ref: None,
            produced_by,
        }
    }
}

#[derive(Clone)]
pub struct DecisionManager {
    registry: AgentRegistry,
    monitor: ResourceMonitor,
    connectivity: ConnectivityHandle,
    remote: Arc<dyn RemoteDecisionService>,
    telemetry: SharedSink,
    fallback_reserve: Duration,
    min_remote_slack: Duration,
    validation_timeout: Duration,
}

impl DecisionManager {
    pub fn new(
        settings: &RemoteConfig,
        registry: AgentRegistry,
        monitor: ResourceMonitor,
        connectivity: ConnectivityHandle,
        remote: Arc<dyn RemoteDecisionService>,
        telemetry: SharedSink,
    ) -> Self {
        Self {
            registry,
            monitor,
            connectivity,
            remote,
            telemetry,
            fallback_reserve: Duration::from_micros(settings.fallback_reserve_us),
            min_remote_slack: Duration::from_millis(settings.min_remote_slack_ms),
            validation_timeout: Duration::from_millis(settings.validation_timeout_ms),
        }
    }

    /// Decide `task` before `deadline`.
    pub async fn make_decision(&self, task: &Task, deadline: Instant) -> Outcome {
        let candidates = self.registry.candidates(&task.task_type);
        let snapshot = self.monitor.snapshot();
        let local = selection::select_local(&candidates, &snapshot).map(|a| a.agent_ref.clone());

        let remaining = deadline.saturating_duration_since(Instant::now());
        let inputs = PlanInputs {
            class: task.priority_class,
            has_local_candidate: local.is_some(),
            saturated: snapshot.saturated,
            autonomous: self.connectivity.is_autonomous(),
            remote_allowed: self.connectivity.allows(Capability::RemoteDecision),
            validation_allowed: self.connectivity.allows(Capability::AsyncValidation),
            remote_window: remaining.saturating_sub(self.fallback_reserve),
            min_remote_slack: self.min_remote_slack,
        };
        let chosen = plan(inputs);
        tracing::trace!(task_id = %task.id, plan = ?chosen, "plan chosen");

        match chosen {
            Plan::LocalSync => local_outcome(local, ProducedBy::Manager),
            Plan::LocalOnly => local_outcome(local, ProducedBy::Fallback),
            Plan::LocalWithValidation => {
                self.spawn_validation(task.clone(), local.clone());
                Outcome {
                    route: Route::LocalWithAsyncValidation,
                    agent_ref: local,
                    produced_by: ProducedBy::Manager,
                }
            }
            Plan::RemoteWithFallback => {
                self.remote_with_fallback(task, inputs.remote_window, local)
                    .await
            }
        }
    }

    async fn remote_with_fallback(
        &self,
        task: &Task,
        window: Duration,
        local: Option<AgentRef>,
    ) -> Outcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(window, self.remote.remote_decide(task, window)).await {
            Ok(r) => r,
            Err(_) => Err(RemoteError::Timeout(window)),
        };
        let ok = matches!(&result, Ok(v) if v.route != Route::Expired);
        self.telemetry.emit(TelemetryEvent::RemoteDispatch {
            task_id: task.id.clone(),
            purpose: DispatchPurpose::Decide,
            ok,
            elapsed_us: started.elapsed().as_micros() as u64,
        });

        let reason = match result {
            Ok(RemoteVerdict { route, agent_ref }) if route != Route::Expired => {
                return Outcome {
                    route,
                    agent_ref,
                    produced_by: ProducedBy::Manager,
                };
            }
            Ok(_) => "remote returned an expired verdict".to_string(),
            Err(e) => e.to_string(),
        };

        let err = EngineError::RemoteUnavailable(reason.clone());
        tracing::warn!(task_id = %task.id, kind = err.kind(), "{err}, falling back to local");
        self.telemetry.emit(TelemetryEvent::Fallback {
            task_id: task.id.clone(),
            priority_class: task.priority_class,
            reason,
        });
        local_outcome(local, ProducedBy::Fallback)
    }

    /// Ask the cloud for its own answer and compare. Never awaited by the
    /// caller and never changes the dispatched decision.
    fn spawn_validation(&self, task: Task, local: Option<AgentRef>) {
        let remote = self.remote.clone();
        let telemetry = self.telemetry.clone();
        let timeout = self.validation_timeout;
        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, remote.remote_decide(&task, timeout)).await;
            let verdict = match result {
                Ok(Ok(v)) => Some(v),
                Ok(Err(e)) => {
                    tracing::debug!(task_id = %task.id, error = %e, "validation dispatch failed");
                    None
                }
                Err(_) => {
                    tracing::debug!(task_id = %task.id, "validation dispatch timed out");
                    None
                }
            };
            telemetry.emit(TelemetryEvent::RemoteDispatch {
                task_id: task.id.clone(),
                purpose: DispatchPurpose::Validate,
                ok: verdict.is_some(),
                elapsed_us: started.elapsed().as_micros() as u64,
            });
            if let Some(v) = verdict {
                if v.agent_ref != local {
                    tracing::warn!(
                        task_id = %task.id,
                        local = ?local,
                        remote = ?v.agent_ref,
                        "remote validation disagrees with local decision"
                    );
                    telemetry.emit(TelemetryEvent::ValidationDisagreement {
                        task_id: task.id,
                        local_agent: local,
                        remote_agent: v.agent_ref,
                    });
                }
            }
        });
    }
}

fn local_outcome(local: Option<AgentRef>, produced_by: ProducedBy) -> Outcome {
    match local {
        Some(agent) => Outcome {
            route: Route::Local,
            agent_ref: Some(agent),
            produced_by,
        },
        None => Outcome::expired(produced_by),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::AutonomyController;
    use crate::monitor::FixedSampler;
    use crate::sim::SimulatedRemote;
    use crate::telemetry::RecordingSink;
    use edgeline_core::agent::{AgentLocation, CandidateAgent};
    use edgeline_core::config::{AutonomyConfig, MonitorConfig};

    fn inputs(class: PriorityClass) -> PlanInputs {
        PlanInputs {
            class,
            has_local_candidate: true,
            saturated: false,
            autonomous: false,
            remote_allowed: true,
            validation_allowed: true,
            remote_window: Duration::from_millis(90),
            min_remote_slack: Duration::from_millis(5),
        }
    }

    #[test]
    fn quality_critical_validates_when_connected() {
        assert_eq!(plan(inputs(PriorityClass::QualityCritical)), Plan::LocalWithValidation);
        let mut i = inputs(PriorityClass::QualityCritical);
        i.validation_allowed = false;
        assert_eq!(plan(i), Plan::LocalSync);
    }

    #[test]
    fn efficiency_goes_remote_only_without_local_or_when_saturated() {
        assert_eq!(plan(inputs(PriorityClass::EfficiencyCritical)), Plan::LocalSync);
        let mut i = inputs(PriorityClass::EfficiencyCritical);
        i.saturated = true;
        assert_eq!(plan(i), Plan::RemoteWithFallback);
        i.saturated = false;
        i.has_local_candidate = false;
        assert_eq!(plan(i), Plan::RemoteWithFallback);
    }

    #[test]
    fn standard_goes_remote_when_budget_allows() {
        assert_eq!(plan(inputs(PriorityClass::Standard)), Plan::RemoteWithFallback);
        let mut i = inputs(PriorityClass::Standard);
        i.remote_window = Duration::from_millis(1);
        assert_eq!(plan(i), Plan::LocalSync);
    }

    #[test]
    fn autonomous_is_always_local() {
        for class in PriorityClass::ALL {
            let mut i = inputs(class);
            i.autonomous = true;
            i.remote_allowed = false;
            assert_eq!(plan(i), Plan::LocalOnly);
        }
    }

    struct Fixture {
        manager: DecisionManager,
        remote: SimulatedRemote,
        sink: Arc<RecordingSink>,
        _controller: AutonomyController,
    }

    fn fixture() -> Fixture {
        let registry = AgentRegistry::new();
        registry.set_candidates(
            "pick",
            vec![
                CandidateAgent::new("arm-1", 0.9, 0.1),
                CandidateAgent::new("planner", 0.9, 0.0).with_location(AgentLocation::Cloud),
            ],
        );
        let (monitor, mut task) = ResourceMonitor::new(&MonitorConfig::default());
        task.sample_once(&mut FixedSampler::new(0.1, 0.1));
        let sink = RecordingSink::new();
        let remote = SimulatedRemote::new();
        let (controller, connectivity) = AutonomyController::new(
            AutonomyConfig::default(),
            Arc::new(remote.clone()),
            monitor.clone(),
            sink.clone(),
        );
        let manager = DecisionManager::new(
            &RemoteConfig::default(),
            registry,
            monitor,
            connectivity,
            Arc::new(remote.clone()),
            sink.clone(),
        );
        Fixture { manager, remote, sink, _controller: controller }
    }

    fn deadline(class: PriorityClass) -> Instant {
        Instant::now() + class.ceiling()
    }

    #[tokio::test(start_paused = true)]
    async fn standard_task_uses_remote_verdict() {
        let f = fixture();
        let task = Task::new("t-1", "pick", PriorityClass::Standard);
        let out = f.manager.make_decision(&task, deadline(PriorityClass::Standard)).await;
        assert_eq!(out.route, Route::Remote);
        assert_eq!(out.agent_ref, Some(AgentRef::from("cloud-planner")));
        assert_eq!(out.produced_by, ProducedBy::Manager);
        assert_eq!(f.sink.count("remote_dispatch"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_timeout_falls_back_inside_budget() {
        let f = fixture();
        f.remote.set_latency(Duration::from_secs(5));
        let task = Task::new("t-1", "pick", PriorityClass::Standard);
        let start = Instant::now();
        let d = deadline(PriorityClass::Standard);
        let out = f.manager.make_decision(&task, d).await;
        assert!(Instant::now() <= d);
        assert!(start.elapsed() < PriorityClass::Standard.ceiling());
        assert_eq!(out.route, Route::Local);
        assert_eq!(out.agent_ref, Some(AgentRef::from("arm-1")));
        assert_eq!(out.produced_by, ProducedBy::Fallback);
        assert_eq!(f.sink.count("fallback"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_falls_back() {
        let f = fixture();
        f.remote.set_reachable(false);
        let task = Task::new("t-1", "pick", PriorityClass::Standard);
        let out = f.manager.make_decision(&task, deadline(PriorityClass::Standard)).await;
        assert_eq!(out.produced_by, ProducedBy::Fallback);
        assert_eq!(out.route, Route::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn quality_critical_is_local_and_validation_disagreement_is_only_reported() {
        let f = fixture();
        let task = Task::new("t-1", "pick", PriorityClass::QualityCritical);
        let out = f
            .manager
            .make_decision(&task, deadline(PriorityClass::QualityCritical))
            .await;
        assert_eq!(out.route, Route::LocalWithAsyncValidation);
        assert_eq!(out.agent_ref, Some(AgentRef::from("arm-1")));

        // Let the background validation finish.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.sink.count("validation_disagreement"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_local_candidate_and_no_remote_expires() {
        let f = fixture();
        let task = Task::new("t-1", "weld", PriorityClass::QualityCritical);
        let out = f
            .manager
            .make_decision(&task, deadline(PriorityClass::QualityCritical))
            .await;
        assert_eq!(out.route, Route::Expired);
        assert_eq!(f.remote.decide_calls(), 0);
    }
}
