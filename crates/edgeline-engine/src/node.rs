//! Wiring: one `EdgeNode` owns every shared handle; `BackgroundTasks`
//! owns the loops that keep them fresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use edgeline_core::cluster::{NodeId, NodeRole};
use edgeline_core::config::{ClusterConfig, EdgelineConfig, LatencyBudgets};

use crate::agents::AgentRegistry;
use crate::autonomy::{AutonomyController, ConnectivityHandle};
use crate::cache::DecisionCache;
use crate::cluster::{ClusterNode, ClusterView, FailoverMachine, FailoverSettings};
use crate::manager::DecisionManager;
use crate::monitor::{MonitorTask, ResourceMonitor, Sampler};
use crate::predictor::{Predictor, PredictorHandle};
use crate::remote::RemoteDecisionService;
use crate::router::{Router, RouterParts, RouterSettings};
use crate::telemetry::SharedSink;
use crate::transport::ClusterTransport;

/// Shared handles for a running node. Cheap to clone.
#[derive(Clone)]
pub struct EdgeNode {
    pub node_id: NodeId,
    pub router: Router,
    pub cache: DecisionCache,
    pub registry: AgentRegistry,
    pub monitor: ResourceMonitor,
    pub connectivity: ConnectivityHandle,
    pub predictor: PredictorHandle,
    pub cluster: watch::Receiver<ClusterView>,
    pub telemetry: SharedSink,
}

/// Loops that must be driven for the node to stay live. Tests may drive
/// the pieces by hand instead of calling `spawn`.
pub struct BackgroundTasks {
    pub monitor: MonitorTask,
    pub predictor: Option<Predictor>,
    pub autonomy: AutonomyController,
    node_id: NodeId,
    cluster_config: ClusterConfig,
    pub(crate) cluster_tx: watch::Sender<ClusterView>,
    router: Router,
    cache: DecisionCache,
    resources: ResourceMonitor,
    telemetry: SharedSink,
    sweep_interval: Duration,
}

impl EdgeNode {
    /// Build every component from a validated config.
    pub fn build(
        config: &EdgelineConfig,
        budgets: LatencyBudgets,
        remote: Arc<dyn RemoteDecisionService>,
        telemetry: SharedSink,
    ) -> (EdgeNode, BackgroundTasks) {
        let node_id = config.node_id();
        let registry = AgentRegistry::from_seeds(&config.agents);
        let (monitor, monitor_task) = ResourceMonitor::new(&config.monitor);
        let (autonomy, connectivity) = AutonomyController::new(
            config.autonomy.clone(),
            remote.clone(),
            monitor.clone(),
            telemetry.clone(),
        );
        let cache = DecisionCache::new(
            config.cache.clone(),
            registry.clone(),
            monitor.clone(),
            telemetry.clone(),
        );
        let (predictor, predictor_handle) = if config.predictor.enabled {
            let (p, h) = Predictor::new(
                config.predictor.window,
                config.predictor.prefetch_top_k,
                cache.clone(),
                registry.clone(),
                monitor.clone(),
                connectivity.clone(),
            );
            (Some(p), h)
        } else {
            (None, PredictorHandle::disabled())
        };
        let manager = DecisionManager::new(
            &config.remote,
            registry.clone(),
            monitor.clone(),
            connectivity.clone(),
            remote,
            telemetry.clone(),
        );

        let initial_view = if config.cluster.enabled {
            FailoverMachine::new(
                node_id.clone(),
                config.cluster.initial_role,
                FailoverSettings::from_config(&config.cluster),
                Instant::now(),
            )
            .view(Instant::now())
        } else {
            ClusterView::standalone(node_id.clone())
        };
        let (cluster_tx, cluster_rx) = watch::channel(initial_view);

        let router = Router::new(
            RouterSettings {
                budgets,
                hot_reuse_threshold: config.cache.hot_reuse_threshold,
                ledger_retention: Duration::from_millis(config.ingress.ledger_retention_ms),
            },
            RouterParts {
                cache: cache.clone(),
                manager,
                registry: registry.clone(),
                monitor: monitor.clone(),
                predictor: predictor_handle.clone(),
                connectivity: connectivity.clone(),
                telemetry: telemetry.clone(),
                cluster: cluster_rx.clone(),
            },
        );

        tracing::info!(
            node = %node_id,
            agents = registry.agent_count(),
            cluster = config.cluster.enabled,
            predictor = config.predictor.enabled,
            "edge node built"
        );

        let node = EdgeNode {
            node_id: node_id.clone(),
            router: router.clone(),
            cache: cache.clone(),
            registry,
            monitor: monitor.clone(),
            connectivity,
            predictor: predictor_handle,
            cluster: cluster_rx,
            telemetry: telemetry.clone(),
        };
        let background = BackgroundTasks {
            monitor: monitor_task,
            predictor,
            autonomy,
            node_id,
            cluster_config: config.cluster.clone(),
            cluster_tx,
            router,
            cache,
            resources: monitor,
            telemetry,
            sweep_interval: Duration::from_millis(config.cache.sweep_interval_ms.max(1)),
        };
        (node, background)
    }

    pub fn cluster_view(&self) -> ClusterView {
        self.cluster.borrow().clone()
    }

    pub fn is_primary(&self) -> bool {
        self.cluster.borrow().role == NodeRole::Primary
    }
}

impl BackgroundTasks {
    /// Spawn every loop. Without a transport the node stays standalone.
    pub fn spawn(
        self,
        sampler: impl Sampler,
        transport: Option<Arc<dyn ClusterTransport>>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.monitor.run(sampler)),
            tokio::spawn(self.autonomy.run()),
            tokio::spawn(run_maintenance(
                self.router.clone(),
                self.cache.clone(),
                self.sweep_interval,
            )),
        ];
        if let Some(predictor) = self.predictor {
            handles.push(tokio::spawn(predictor.run()));
        }
        if let Some(transport) = transport {
            let node = ClusterNode::new(
                self.node_id,
                self.cluster_config.initial_role,
                FailoverSettings::from_config(&self.cluster_config),
                transport,
                self.cache,
                self.resources,
                self.telemetry,
                self.cluster_tx,
            );
            handles.push(tokio::spawn(node.run()));
        }
        handles
    }
}

/// Periodic cache sweep and ledger pruning.
pub async fn run_maintenance(router: Router, cache: DecisionCache, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        cache.sweep();
        let pruned = router.prune_ledger();
        if pruned > 0 {
            tracing::trace!(pruned, "ledger pruned");
        }
    }
}

/// A standalone node with a seeded `inspect` task type, a fresh resource
/// sample and a reachable simulated cloud.
#[cfg(test)]
pub(crate) fn test_node() -> (EdgeNode, BackgroundTasks) {
    test_node_with(crate::sim::SimulatedRemote::new())
}

#[cfg(test)]
pub(crate) fn test_node_with(remote: crate::sim::SimulatedRemote) -> (EdgeNode, BackgroundTasks) {
    use edgeline_core::agent::CandidateAgent;
    use edgeline_core::config::AgentSeed;

    use crate::monitor::FixedSampler;
    use crate::telemetry::RecordingSink;

    let mut config = EdgelineConfig::default();
    config.agents = vec![
        AgentSeed {
            task_type: "inspect".into(),
            agent: CandidateAgent::new("agent-a", 0.9, 0.2),
        },
        AgentSeed {
            task_type: "inspect".into(),
            agent: CandidateAgent::new("agent-b", 0.9, 0.5),
        },
    ];
    let (node, mut bg) = EdgeNode::build(
        &config,
        LatencyBudgets::ceilings(),
        Arc::new(remote),
        RecordingSink::new(),
    );
    bg.monitor.sample_once(&mut FixedSampler::new(0.2, 0.3));
    (node, bg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedRemote;
    use crate::telemetry::RecordingSink;

    #[test]
    fn standalone_node_is_primary() {
        let (node, _bg) = test_node();
        assert!(node.is_primary());
        assert_eq!(node.cluster_view().primary, Some(node.node_id.clone()));
        assert_eq!(node.registry.candidates("inspect").len(), 2);
    }

    #[test]
    fn clustered_backup_starts_without_primary() {
        let mut config = EdgelineConfig::default();
        config.cluster.enabled = true;
        config.cluster.initial_role = NodeRole::Backup;
        let (node, _bg) = EdgeNode::build(
            &config,
            LatencyBudgets::ceilings(),
            Arc::new(SimulatedRemote::new()),
            RecordingSink::new(),
        );
        assert!(!node.is_primary());
        assert_eq!(node.cluster_view().primary, None);
    }

    #[test]
    fn disabled_predictor_is_not_spawned() {
        let mut config = EdgelineConfig::default();
        config.predictor.enabled = false;
        let (_node, bg) = EdgeNode::build(
            &config,
            LatencyBudgets::ceilings(),
            Arc::new(SimulatedRemote::new()),
            RecordingSink::new(),
        );
        assert!(bg.predictor.is_none());
    }
}
