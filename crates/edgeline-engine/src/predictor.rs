//! Predictive prefetch.
//!
//! The router reports every classification key it sees over an unbounded
//! channel and never waits on the predictor. The predictor task keeps a
//! sliding window of recent keys (published as a concurrent frequency map
//! the router reads when picking a cache tier) and first-order transition
//! counts. After each observation it precomputes local decisions for the
//! most likely next keys into the predictive tier.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use edgeline_core::decision::{Decision, ProducedBy, Route};
use edgeline_core::task::{ClassificationKey, PriorityClass, TaskId, TaskShape};

use crate::agents::AgentRegistry;
use crate::autonomy::{Capability, ConnectivityHandle};
use crate::cache::DecisionCache;
use crate::manager::{plan, Plan, PlanInputs};
use crate::monitor::ResourceMonitor;
use crate::selection;

#[derive(Debug, Clone)]
pub struct Observation {
    pub key: ClassificationKey,
    pub shape: TaskShape,
}

/// Router-side handle.
#[derive(Clone)]
pub struct PredictorHandle {
    tx: Option<mpsc::UnboundedSender<Observation>>,
    frequency: Arc<DashMap<ClassificationKey, u32>>,
}

impl PredictorHandle {
    /// A handle that records nothing; every key has frequency 0.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            frequency: Arc::new(DashMap::new()),
        }
    }

    pub fn observe(&self, key: ClassificationKey, shape: TaskShape) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Observation { key, shape });
        }
    }

    /// Occurrences of `key` in the recent window.
    pub fn frequency(&self, key: &ClassificationKey) -> u32 {
        self.frequency.get(key).map(|f| *f).unwrap_or(0)
    }
}

pub struct Predictor {
    rx: mpsc::UnboundedReceiver<Observation>,
    frequency: Arc<DashMap<ClassificationKey, u32>>,
    window: VecDeque<ClassificationKey>,
    window_size: usize,
    top_k: usize,
    transitions: HashMap<ClassificationKey, HashMap<ClassificationKey, u32>>,
    shapes: HashMap<ClassificationKey, TaskShape>,
    last: Option<ClassificationKey>,
    cache: DecisionCache,
    registry: AgentRegistry,
    monitor: ResourceMonitor,
    connectivity: ConnectivityHandle,
    precomputed: u64,
}

impl Predictor {
    pub fn new(
        window_size: usize,
        top_k: usize,
        cache: DecisionCache,
        registry: AgentRegistry,
        monitor: ResourceMonitor,
        connectivity: ConnectivityHandle,
    ) -> (Self, PredictorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frequency = Arc::new(DashMap::new());
        let handle = PredictorHandle {
            tx: Some(tx),
            frequency: frequency.clone(),
        };
        let predictor = Self {
            rx,
            frequency,
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            top_k,
            transitions: HashMap::new(),
            shapes: HashMap::new(),
            last: None,
            cache,
            registry,
            monitor,
            connectivity,
            precomputed: 0,
        };
        (predictor, handle)
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(window = self.window_size, top_k = self.top_k, "predictor started");
        while let Some(obs) = self.rx.recv().await {
            self.observe(obs);
            // Batch whatever else is already queued before prefetching.
            while let Ok(obs) = self.rx.try_recv() {
                self.observe(obs);
            }
            self.prefetch();
        }
        tracing::info!(precomputed = self.precomputed, "predictor stopped");
    }

    /// Drain queued observations and prefetch once. For tests and callers
    /// that drive the predictor by hand.
    pub fn process_pending(&mut self) {
        while let Ok(obs) = self.rx.try_recv() {
            self.observe(obs);
        }
        self.prefetch();
    }

    fn observe(&mut self, obs: Observation) {
        let key = obs.key;
        self.window.push_back(key);
        *self.frequency.entry(key).or_insert(0) += 1;
        self.shapes.insert(key, obs.shape);

        if let Some(prev) = self.last {
            *self
                .transitions
                .entry(prev)
                .or_default()
                .entry(key)
                .or_insert(0) += 1;
        }
        self.last = Some(key);

        while self.window.len() > self.window_size {
            if let Some(old) = self.window.pop_front() {
                self.forget_one(old);
            }
        }
    }

    fn forget_one(&mut self, key: ClassificationKey) {
        let gone = match self.frequency.get_mut(&key) {
            Some(mut f) => {
                *f = f.saturating_sub(1);
                *f == 0
            }
            None => true,
        };
        if gone {
            self.frequency.remove(&key);
            self.shapes.remove(&key);
            self.transitions.remove(&key);
            // Successor counts only cover keys still inside the window.
            self.transitions.retain(|_, next| {
                next.remove(&key);
                !next.is_empty()
            });
        }
    }

    /// Most likely successors of `key`, best first.
    pub fn predict_next(&self, key: &ClassificationKey) -> Vec<ClassificationKey> {
        let Some(next) = self.transitions.get(key) else {
            return Vec::new();
        };
        let mut ranked: Vec<(&ClassificationKey, &u32)> = next.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(self.top_k)
            .map(|(k, _)| *k)
            .collect()
    }

    /// The route the manager would pick for a class with a local candidate,
    /// or `None` when that decision cannot be made ahead of time.
    fn precomputed_route(&self, class: PriorityClass, saturated: bool) -> Option<Route> {
        let inputs = PlanInputs {
            class,
            has_local_candidate: true,
            saturated,
            autonomous: self.connectivity.is_autonomous(),
            remote_allowed: false,
            validation_allowed: self.connectivity.allows(Capability::AsyncValidation),
            remote_window: Duration::ZERO,
            min_remote_slack: Duration::MAX,
        };
        match plan(inputs) {
            Plan::LocalSync => Some(Route::Local),
            Plan::LocalWithValidation => Some(Route::LocalWithAsyncValidation),
            Plan::LocalOnly | Plan::RemoteWithFallback => None,
        }
    }

    fn prefetch(&mut self) {
        if !self.connectivity.allows(Capability::PredictivePrefetch) {
            return;
        }
        let Some(last) = self.last else {
            return;
        };
        let snapshot = self.monitor.snapshot();
        if snapshot.stale || snapshot.saturated {
            return;
        }

        for key in self.predict_next(&last) {
            if self.cache.contains(&key) {
                continue;
            }
            let Some(shape) = self.shapes.get(&key) else {
                continue;
            };
            // Only classes whose normal decision is local are prefetched; a
            // precomputed local answer must never shadow a remote route.
            if shape.priority_class > PriorityClass::EfficiencyCritical {
                continue;
            }
            let candidates = self.registry.candidates(&shape.task_type);
            let Some(agent) = selection::select_local(&candidates, &snapshot) else {
                continue;
            };
            let Some(route) = self.precomputed_route(shape.priority_class, snapshot.saturated) else {
                continue;
            };
            let decision = Decision {
                task_id: TaskId::from("predicted"),
                priority_class: shape.priority_class,
                route,
                agent_ref: Some(agent.agent_ref.clone()),
                decision_latency_ns: 0,
                produced_by: ProducedBy::Router,
                valid_until_ms: None,
            };
            if self.cache.insert_predictive(key, decision) {
                self.precomputed += 1;
                tracing::trace!(key = %key, agent = %agent.agent_ref, "decision precomputed");
            }
        }
    }
}
