//! Priority task router: the real-time entry point.
//!
//! Every task gets exactly one terminal decision inside its class budget:
//!   1. deadline = admission + budget(class)
//!   2. cache lookup (hot → warm → predictive)
//!   3. miss: SafetyCritical is decided synchronously from local
//!      candidates and the latest snapshot; every other class goes to the
//!      manager under a timeout that ends at the deadline
//!   4. write-back: hot when the key is frequently reused, warm otherwise
//!   5. latency stats, telemetry, and (while autonomous) the sync log

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use edgeline_core::cluster::{NodeId, NodeRole};
use edgeline_core::config::LatencyBudgets;
use edgeline_core::decision::{Decision, ProducedBy, Route};
use edgeline_core::error::EngineError;
use edgeline_core::task::{ClassificationKey, PriorityClass, Task, TaskId};

use crate::agents::AgentRegistry;
use crate::autonomy::{Capability, ConnectivityHandle};
use crate::cache::{DecisionCache, Tier};
use crate::cluster::ClusterView;
use crate::manager::DecisionManager;
use crate::monitor::ResourceMonitor;
use crate::predictor::PredictorHandle;
use crate::selection;
use crate::telemetry::{SharedSink, TelemetryEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("task {0} is already in flight")]
    InFlight(TaskId),
    #[error("this node is not primary (primary: {primary:?})")]
    NotPrimary { primary: Option<NodeId> },
}

enum LedgerState {
    InFlight,
    Decided(Decision),
}

enum Admission {
    Fresh,
    Replay(Decision),
}

struct LedgerEntry {
    state: LedgerState,
    since: Instant,
}

/// Releases an admitted id when its submission is dropped before a
/// terminal decision is recorded, so the id can be submitted again.
struct InFlightGuard<'a> {
    ledger: &'a DashMap<TaskId, LedgerEntry>,
    id: TaskId,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(ledger: &'a DashMap<TaskId, LedgerEntry>, id: TaskId) -> Self {
        Self {
            ledger,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let released = self
            .ledger
            .remove_if(&self.id, |_, e| matches!(e.state, LedgerState::InFlight));
        if released.is_some() {
            tracing::debug!(task_id = %self.id, "submission abandoned before a decision, id released");
        }
    }
}

#[derive(Default)]
struct ClassStats {
    decisions: AtomicU64,
    expired: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

#[derive(Default)]
struct Stats {
    per_class: [ClassStats; 4],
    produced_by: [AtomicU64; 4],
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassLatency {
    pub priority_class: PriorityClass,
    pub budget_us: u64,
    pub decisions: u64,
    pub expired: u64,
    pub mean_ns: u64,
    pub max_ns: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub classes: Vec<ClassLatency>,
    pub by_cache: u64,
    pub by_router: u64,
    pub by_manager: u64,
    pub by_fallback: u64,
    pub rejected: u64,
    pub ledger_size: usize,
}

/// Fixed settings for a router.
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub budgets: LatencyBudgets,
    /// Recent sightings of a key that send its decision to the hot tier.
    pub hot_reuse_threshold: u32,
    pub ledger_retention: Duration,
}

/// Collaborators a router needs.
pub struct RouterParts {
    pub cache: DecisionCache,
    pub manager: DecisionManager,
    pub registry: AgentRegistry,
    pub monitor: ResourceMonitor,
    pub predictor: PredictorHandle,
    pub connectivity: ConnectivityHandle,
    pub telemetry: SharedSink,
    pub cluster: watch::Receiver<ClusterView>,
}

struct Inner {
    settings: RouterSettings,
    parts: RouterParts,
    ledger: DashMap<TaskId, LedgerEntry>,
    stats: Stats,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub fn new(settings: RouterSettings, parts: RouterParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                parts,
                ledger: DashMap::new(),
                stats: Stats::default(),
            }),
        }
    }

    pub fn budgets(&self) -> LatencyBudgets {
        self.inner.settings.budgets
    }

    /// Route one task. Duplicate ids replay their terminal decision.
    pub async fn submit(&self, task: Task) -> Result<Decision, SubmitError> {
        let admitted = Instant::now();
        if let Admission::Replay(d) = self.admit(&task)? {
            return Ok(d);
        }
        let guard = InFlightGuard::new(&self.inner.ledger, task.id.clone());
        let key = task.classification_key();
        let decision = self.route(&task, key, admitted).await;
        let decision = self.finish(task, key, decision);
        guard.disarm();
        Ok(decision)
    }

    /// Synchronous entry for SafetyCritical callers that must never yield.
    /// Returns `None` for any other class; those go through `submit`.
    pub fn submit_now(&self, task: Task) -> Option<Result<Decision, SubmitError>> {
        if task.priority_class != PriorityClass::SafetyCritical {
            return None;
        }
        let admitted = Instant::now();
        match self.admit(&task) {
            Err(e) => Some(Err(e)),
            Ok(Admission::Replay(d)) => Some(Ok(d)),
            Ok(Admission::Fresh) => {
                let key = task.classification_key();
                let decision = self.route_sync(&task, key, admitted);
                Some(Ok(self.finish(task, key, decision)))
            }
        }
    }

    fn admit(&self, task: &Task) -> Result<Admission, SubmitError> {
        {
            let view = self.inner.parts.cluster.borrow();
            if view.role != NodeRole::Primary {
                self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::NotPrimary {
                    primary: view.primary.clone(),
                });
            }
        }
        match self.inner.ledger.entry(task.id.clone()) {
            Entry::Occupied(e) => match &e.get().state {
                LedgerState::InFlight => {
                    self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(SubmitError::InFlight(task.id.clone()))
                }
                LedgerState::Decided(d) => {
                    tracing::debug!(task_id = %task.id, "duplicate submission, replaying decision");
                    Ok(Admission::Replay(d.clone()))
                }
            },
            Entry::Vacant(v) => {
                v.insert(LedgerEntry {
                    state: LedgerState::InFlight,
                    since: Instant::now(),
                });
                Ok(Admission::Fresh)
            }
        }
    }

    async fn route(&self, task: &Task, key: ClassificationKey, admitted: Instant) -> Decision {
        if task.priority_class == PriorityClass::SafetyCritical {
            return self.route_sync(task, key, admitted);
        }
        let deadline = admitted + self.inner.settings.budgets.budget(task.priority_class);

        if let Some(d) = self.from_cache(task, key, admitted) {
            return d;
        }

        let manager = &self.inner.parts.manager;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = tokio::time::timeout(remaining, manager.make_decision(task, deadline)).await;
        let latency = elapsed_ns(admitted);
        match outcome {
            Ok(o) if Instant::now() <= deadline => Decision {
                task_id: task.id.clone(),
                priority_class: task.priority_class,
                route: o.route,
                agent_ref: o.agent_ref,
                decision_latency_ns: latency,
                produced_by: o.produced_by,
                valid_until_ms: None,
            },
            Ok(o) => Decision::expired(task.id.clone(), task.priority_class, latency, o.produced_by),
            Err(_) => Decision::expired(task.id.clone(), task.priority_class, latency, ProducedBy::Manager),
        }
    }

    /// The SafetyCritical path. Never awaits and never touches the network.
    fn route_sync(&self, task: &Task, key: ClassificationKey, admitted: Instant) -> Decision {
        let deadline = admitted + self.inner.settings.budgets.budget(task.priority_class);

        if let Some(d) = self.from_cache(task, key, admitted) {
            return d;
        }

        let parts = &self.inner.parts;
        let candidates = parts.registry.candidates(&task.task_type);
        let snapshot = parts.monitor.snapshot();
        let agent = selection::select_local(&candidates, &snapshot).map(|a| a.agent_ref.clone());
        let latency = elapsed_ns(admitted);

        match agent {
            Some(agent) if Instant::now() <= deadline => Decision {
                task_id: task.id.clone(),
                priority_class: task.priority_class,
                route: Route::Local,
                agent_ref: Some(agent),
                decision_latency_ns: latency,
                produced_by: ProducedBy::Router,
                valid_until_ms: None,
            },
            _ => Decision::expired(task.id.clone(), task.priority_class, latency, ProducedBy::Router),
        }
    }

    fn from_cache(&self, task: &Task, key: ClassificationKey, admitted: Instant) -> Option<Decision> {
        let parts = &self.inner.parts;
        if !parts.connectivity.allows(Capability::CacheServing) {
            return None;
        }
        let hit = parts.cache.lookup(&key)?;
        // A cached cloud route is useless while the cloud is unreachable.
        if hit.decision.route == Route::Remote && !parts.connectivity.allows(Capability::RemoteDecision) {
            return None;
        }
        tracing::trace!(task_id = %task.id, key = %key, tier = hit.tier.as_str(), "cache hit");
        Some(hit.decision.reissue(task.id.clone(), ProducedBy::Cache, elapsed_ns(admitted)))
    }

    /// Cache write-back, stats, telemetry, ledger. Runs once per decision.
    fn finish(&self, task: Task, key: ClassificationKey, mut decision: Decision) -> Decision {
        let parts = &self.inner.parts;

        let budget_ns = self.inner.settings.budgets.budget(decision.priority_class).as_nanos() as u64;
        if !decision.is_expired() && decision.decision_latency_ns > budget_ns {
            decision = Decision::expired(
                decision.task_id,
                decision.priority_class,
                decision.decision_latency_ns,
                decision.produced_by,
            );
        }

        if decision.produced_by != ProducedBy::Cache && !decision.is_expired() {
            let tier = if parts.predictor.frequency(&key) >= self.inner.settings.hot_reuse_threshold {
                Tier::Hot
            } else {
                Tier::Warm
            };
            decision = parts.cache.insert(key, decision, tier);
        }
        parts.predictor.observe(key, task.shape());

        if decision.produced_by != ProducedBy::Cache && parts.connectivity.is_autonomous() {
            parts.connectivity.record(key, decision.clone());
        }

        self.record_stats(&decision);
        if decision.is_expired() {
            let err = EngineError::DeadlineExceeded {
                task_id: decision.task_id.clone(),
                budget_us: budget_ns / 1_000,
            };
            tracing::warn!(
                kind = err.kind(),
                priority_class = decision.priority_class.as_str(),
                latency_ns = decision.decision_latency_ns,
                "{err}"
            );
        } else {
            tracing::debug!(
                task_id = %decision.task_id,
                route = decision.route.as_str(),
                produced_by = decision.produced_by.as_str(),
                latency_ns = decision.decision_latency_ns,
                "task routed"
            );
        }
        parts.telemetry.emit(TelemetryEvent::decision(&decision));

        self.inner.ledger.insert(
            task.id,
            LedgerEntry {
                state: LedgerState::Decided(decision.clone()),
                since: Instant::now(),
            },
        );
        decision
    }

    fn record_stats(&self, d: &Decision) {
        let stats = &self.inner.stats;
        let class = &stats.per_class[d.priority_class.index()];
        class.decisions.fetch_add(1, Ordering::Relaxed);
        if d.is_expired() {
            class.expired.fetch_add(1, Ordering::Relaxed);
        }
        class.total_ns.fetch_add(d.decision_latency_ns, Ordering::Relaxed);
        class.max_ns.fetch_max(d.decision_latency_ns, Ordering::Relaxed);
        stats.produced_by[d.produced_by.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RouterStats {
        let stats = &self.inner.stats;
        let classes = PriorityClass::ALL
            .iter()
            .map(|&class| {
                let s = &stats.per_class[class.index()];
                let n = s.decisions.load(Ordering::Relaxed);
                ClassLatency {
                    priority_class: class,
                    budget_us: self.inner.settings.budgets.budget(class).as_micros() as u64,
                    decisions: n,
                    expired: s.expired.load(Ordering::Relaxed),
                    mean_ns: s.total_ns.load(Ordering::Relaxed).checked_div(n).unwrap_or(0),
                    max_ns: s.max_ns.load(Ordering::Relaxed),
                }
            })
            .collect();
        let by = |p: ProducedBy| stats.produced_by[p.index()].load(Ordering::Relaxed);
        RouterStats {
            classes,
            by_cache: by(ProducedBy::Cache),
            by_router: by(ProducedBy::Router),
            by_manager: by(ProducedBy::Manager),
            by_fallback: by(ProducedBy::Fallback),
            rejected: stats.rejected.load(Ordering::Relaxed),
            ledger_size: self.inner.ledger.len(),
        }
    }

    /// Terminal decision recorded for `id`, if still retained.
    pub fn decision_for(&self, id: &TaskId) -> Option<Decision> {
        self.inner.ledger.get(id).and_then(|e| match &e.state {
            LedgerState::Decided(d) => Some(d.clone()),
            LedgerState::InFlight => None,
        })
    }

    /// Forget decided ledger entries older than the retention window.
    pub fn prune_ledger(&self) -> usize {
        let retention = self.inner.settings.ledger_retention;
        let now = Instant::now();
        let before = self.inner.ledger.len();
        self.inner.ledger.retain(|_, e| {
            matches!(e.state, LedgerState::InFlight)
                || now.saturating_duration_since(e.since) < retention
        });
        before - self.inner.ledger.len()
    }
}

fn elapsed_ns(since: Instant) -> u64 {
    since.elapsed().as_nanos() as u64
}
