//! Autonomous operation controller.
//!
//! Owns the node's connectivity state. Everything else holds a read-only
//! `ConnectivityHandle`; only the controller's transitions write `mode`.
//!
//! Connected → Autonomous after `failure_threshold` consecutive heartbeat
//! failures inside `failure_window_ms`. Autonomous → Connected only once a
//! heartbeat succeeds *and* the pending sync log has been fully uploaded,
//! oldest first, each record removed only after the remote acknowledged it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use edgeline_core::config::AutonomyConfig;
use edgeline_core::decision::{unix_ms, Decision};
use edgeline_core::task::ClassificationKey;

use crate::monitor::ResourceMonitor;
use crate::remote::{RemoteDecisionService, SyncRecord};
use crate::telemetry::{SharedSink, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectivityMode {
    Connected = 0,
    Autonomous = 1,
}

impl ConnectivityMode {
    fn from_u8(v: u8) -> Self {
        if v == Self::Autonomous as u8 {
            Self::Autonomous
        } else {
            Self::Connected
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Autonomous => "autonomous",
        }
    }
}

/// Things a node can do. While Autonomous only `AUTONOMOUS_ALLOWED` apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Local routing for every priority class.
    LocalRouting,
    CacheServing,
    PredictivePrefetch,
    RemoteDecision,
    AsyncValidation,
}

/// Capabilities that survive loss of upstream connectivity.
pub const AUTONOMOUS_ALLOWED: &[Capability] = &[
    Capability::LocalRouting,
    Capability::CacheServing,
    Capability::PredictivePrefetch,
];

struct Pending {
    key: ClassificationKey,
    decision: Decision,
    recorded_at_ms: u64,
}

struct Shared {
    mode: AtomicU8,
    /// Unix ms; 0 while connected.
    disconnected_since_ms: AtomicU64,
    pending: AtomicUsize,
    dropped: AtomicU64,
    log_tx: mpsc::UnboundedSender<Pending>,
}

/// Read-only view of connectivity, plus the append side of the sync log.
#[derive(Clone)]
pub struct ConnectivityHandle {
    shared: Arc<Shared>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityView {
    pub mode: ConnectivityMode,
    pub disconnected_since_ms: Option<u64>,
    pub pending_sync: usize,
    pub dropped_sync: u64,
}

impl ConnectivityHandle {
    pub fn mode(&self) -> ConnectivityMode {
        ConnectivityMode::from_u8(self.shared.mode.load(Ordering::Acquire))
    }

    pub fn is_autonomous(&self) -> bool {
        self.mode() == ConnectivityMode::Autonomous
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match self.mode() {
            ConnectivityMode::Connected => true,
            ConnectivityMode::Autonomous => AUTONOMOUS_ALLOWED.contains(&capability),
        }
    }

    /// Queue a locally made decision for reconciliation.
    pub fn record(&self, key: ClassificationKey, decision: Decision) {
        let _ = self.shared.log_tx.send(Pending {
            key,
            decision,
            recorded_at_ms: unix_ms(),
        });
    }

    pub fn view(&self) -> ConnectivityView {
        let since = self.shared.disconnected_since_ms.load(Ordering::Relaxed);
        ConnectivityView {
            mode: self.mode(),
            disconnected_since_ms: (since != 0).then_some(since),
            pending_sync: self.shared.pending.load(Ordering::Relaxed),
            dropped_sync: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct AutonomyController {
    handle: ConnectivityHandle,
    log_rx: mpsc::UnboundedReceiver<Pending>,
    log: VecDeque<SyncRecord>,
    next_seq: u64,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    settings: AutonomyConfig,
    remote: Arc<dyn RemoteDecisionService>,
    monitor: ResourceMonitor,
    telemetry: SharedSink,
}

impl AutonomyController {
    pub fn new(
        settings: AutonomyConfig,
        remote: Arc<dyn RemoteDecisionService>,
        monitor: ResourceMonitor,
        telemetry: SharedSink,
    ) -> (Self, ConnectivityHandle) {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let handle = ConnectivityHandle {
            shared: Arc::new(Shared {
                mode: AtomicU8::new(ConnectivityMode::Connected as u8),
                disconnected_since_ms: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
                log_tx,
            }),
        };
        let controller = Self {
            handle: handle.clone(),
            log_rx,
            log: VecDeque::new(),
            next_seq: 1,
            consecutive_failures: 0,
            streak_started: None,
            settings,
            remote,
            monitor,
            telemetry,
        };
        (controller, handle)
    }

    pub fn handle(&self) -> ConnectivityHandle {
        self.handle.clone()
    }

    pub fn mode(&self) -> ConnectivityMode {
        self.handle.mode()
    }

    /// Records awaiting upload, oldest first.
    pub fn pending(&self) -> &VecDeque<SyncRecord> {
        &self.log
    }

    /// Runs forever: heartbeat on the interval, ingest log appends between.
    pub async fn run(mut self) {
        tracing::info!(
            interval_ms = self.settings.heartbeat_interval_ms,
            threshold = self.settings.failure_threshold,
            "autonomy controller started"
        );
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.settings.heartbeat_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.heartbeat_once().await;
                }
                Some(p) = self.log_rx.recv() => {
                    self.append(p);
                }
            }
        }
    }

    /// Move queued appends into the log, assigning sequence numbers.
    pub fn ingest(&mut self) {
        while let Ok(p) = self.log_rx.try_recv() {
            self.append(p);
        }
    }

    fn append(&mut self, p: Pending) {
        if self.log.len() >= self.settings.max_pending {
            let dropped = self.handle.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::error!(
                task_id = %p.decision.task_id,
                pending = self.log.len(),
                dropped_total = dropped,
                "pending sync log full, dropping newest decision"
            );
            self.telemetry.emit(TelemetryEvent::SyncLogOverflow {
                dropped_task_id: p.decision.task_id,
                pending: self.log.len(),
                dropped_total: dropped,
            });
            return;
        }
        self.log.push_back(SyncRecord {
            seq: self.next_seq,
            key: p.key,
            decision: p.decision,
            recorded_at_ms: p.recorded_at_ms,
        });
        self.next_seq += 1;
        self.publish_len();
    }

    fn publish_len(&self) {
        self.handle.shared.pending.store(self.log.len(), Ordering::Relaxed);
    }

    /// One heartbeat round. Returns the mode afterwards.
    pub async fn heartbeat_once(&mut self) -> ConnectivityMode {
        self.ingest();
        let timeout = self.request_timeout();
        let result = match tokio::time::timeout(timeout, self.remote.heartbeat()).await {
            Ok(r) => r.map_err(|e| e.to_string()),
            Err(_) => Err(format!("heartbeat timed out after {timeout:?}")),
        };

        match result {
            Ok(rtt) => {
                self.consecutive_failures = 0;
                self.streak_started = None;
                self.monitor.record_rtt(rtt);
                if !self.log.is_empty() {
                    let drained = self.drain().await;
                    if drained {
                        // Catch anything appended while the last batch was in flight.
                        self.ingest();
                    }
                }
                if self.mode() == ConnectivityMode::Autonomous && self.log.is_empty() {
                    self.transition(ConnectivityMode::Connected);
                }
            }
            Err(reason) => self.on_failure(reason),
        }
        self.mode()
    }

    fn on_failure(&mut self, reason: String) {
        let now = Instant::now();
        let window = Duration::from_millis(self.settings.failure_window_ms);
        match self.streak_started {
            Some(start) if now.duration_since(start) <= window => {
                self.consecutive_failures += 1;
            }
            _ => {
                self.streak_started = Some(now);
                self.consecutive_failures = 1;
            }
        }
        tracing::debug!(
            failures = self.consecutive_failures,
            reason = %reason,
            "heartbeat failed"
        );
        if self.mode() == ConnectivityMode::Connected
            && self.consecutive_failures >= self.settings.failure_threshold
        {
            self.transition(ConnectivityMode::Autonomous);
        }
    }

    /// Upload the log oldest-first. True if it is now empty.
    async fn drain(&mut self) -> bool {
        let timeout = self.request_timeout();
        while !self.log.is_empty() {
            let batch: Vec<SyncRecord> = self
                .log
                .iter()
                .take(self.settings.sync_batch_size)
                .cloned()
                .collect();
            let ack = match tokio::time::timeout(timeout, self.remote.submit_sync_batch(&batch)).await {
                Ok(Ok(ack)) => ack,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, pending = self.log.len(), "sync batch rejected, retrying next heartbeat");
                    return false;
                }
                Err(_) => {
                    tracing::warn!(pending = self.log.len(), "sync batch timed out, retrying next heartbeat");
                    return false;
                }
            };

            let before = self.log.len();
            while self.log.front().is_some_and(|r| r.seq <= ack.acked_through) {
                self.log.pop_front();
            }
            self.publish_len();
            let removed = before - self.log.len();
            tracing::debug!(removed, acked_through = ack.acked_through, "sync batch acknowledged");
            if removed == 0 {
                return false;
            }
        }
        true
    }

    fn request_timeout(&self) -> Duration {
        // Heartbeats must finish well inside their own interval.
        Duration::from_millis(self.settings.heartbeat_interval_ms.max(1))
    }

    fn transition(&mut self, to: ConnectivityMode) {
        let from = self.mode();
        if from == to {
            return;
        }
        let shared = &self.handle.shared;
        match to {
            ConnectivityMode::Autonomous => {
                shared.disconnected_since_ms.store(unix_ms(), Ordering::Relaxed);
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "upstream unreachable, entering autonomous mode"
                );
            }
            ConnectivityMode::Connected => {
                shared.disconnected_since_ms.store(0, Ordering::Relaxed);
                tracing::info!("upstream reachable and sync log drained, leaving autonomous mode");
            }
        }
        shared.mode.store(to as u8, Ordering::Release);
        self.telemetry.emit(TelemetryEvent::ConnectivityChange {
            from,
            to,
            pending: self.log.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::FixedSampler;
    use crate::sim::SimulatedRemote;
    use crate::telemetry::RecordingSink;
    use edgeline_core::config::MonitorConfig;
    use edgeline_core::decision::{ProducedBy, Route};
    use edgeline_core::task::{PriorityClass, Task, TaskId};

    fn controller(
        settings: AutonomyConfig,
    ) -> (AutonomyController, ConnectivityHandle, SimulatedRemote, Arc<RecordingSink>) {
        let remote = SimulatedRemote::new();
        let (monitor, mut task) = ResourceMonitor::new(&MonitorConfig::default());
        task.sample_once(&mut FixedSampler::new(0.1, 0.1));
        let sink = RecordingSink::new();
        let (c, h) = AutonomyController::new(settings, Arc::new(remote.clone()), monitor, sink.clone());
        (c, h, remote, sink)
    }

    fn settings() -> AutonomyConfig {
        AutonomyConfig {
            heartbeat_interval_ms: 100,
            failure_threshold: 3,
            failure_window_ms: 5_000,
            sync_batch_size: 2,
            max_pending: 10,
        }
    }

    fn local(id: &str) -> (ClassificationKey, Decision) {
        let task = Task::new(id, "pick", PriorityClass::QualityCritical);
        let d = Decision {
            task_id: TaskId::from(id),
            priority_class: PriorityClass::QualityCritical,
            route: Route::Local,
            agent_ref: None,
            decision_latency_ns: 10,
            produced_by: ProducedBy::Fallback,
            valid_until_ms: None,
        };
        (task.classification_key(), d)
    }

    async fn go_autonomous(c: &mut AutonomyController, remote: &SimulatedRemote) {
        remote.set_reachable(false);
        for _ in 0..3 {
            c.heartbeat_once().await;
        }
        assert_eq!(c.mode(), ConnectivityMode::Autonomous);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_failures_switch_to_autonomous() {
        let (mut c, h, remote, sink) = controller(settings());
        remote.set_reachable(false);
        c.heartbeat_once().await;
        c.heartbeat_once().await;
        assert_eq!(h.mode(), ConnectivityMode::Connected);
        c.heartbeat_once().await;
        assert_eq!(h.mode(), ConnectivityMode::Autonomous);
        assert!(h.view().disconnected_since_ms.is_some());
        assert!(!h.allows(Capability::RemoteDecision));
        assert!(!h.allows(Capability::AsyncValidation));
        assert!(h.allows(Capability::LocalRouting));
        assert_eq!(sink.count("connectivity_change"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_accumulate() {
        let (mut c, h, remote, _sink) = controller(settings());
        remote.set_reachable(false);
        c.heartbeat_once().await;
        c.heartbeat_once().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        c.heartbeat_once().await;
        assert_eq!(h.mode(), ConnectivityMode::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let (mut c, h, remote, _sink) = controller(settings());
        remote.set_reachable(false);
        c.heartbeat_once().await;
        c.heartbeat_once().await;
        remote.set_reachable(true);
        c.heartbeat_once().await;
        remote.set_reachable(false);
        c.heartbeat_once().await;
        c.heartbeat_once().await;
        assert_eq!(h.mode(), ConnectivityMode::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_drains_log_in_order_before_flipping() {
        let (mut c, h, remote, _sink) = controller(settings());
        go_autonomous(&mut c, &remote).await;
        for id in ["t-1", "t-2", "t-3", "t-4", "t-5"] {
            let (k, d) = local(id);
            h.record(k, d);
        }
        c.ingest();
        assert_eq!(h.view().pending_sync, 5);

        remote.set_reachable(true);
        assert_eq!(c.heartbeat_once().await, ConnectivityMode::Connected);
        let ids: Vec<String> = remote
            .synced()
            .iter()
            .map(|r| r.decision.task_id.0.clone())
            .collect();
        assert_eq!(ids, ["t-1", "t-2", "t-3", "t-4", "t-5"]);
        let seqs: Vec<u64> = remote.synced().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, [1, 2, 3, 4, 5]);
        assert_eq!(remote.sync_calls(), 3);
        assert!(c.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_drain_stays_autonomous_and_keeps_records() {
        let (mut c, h, remote, _sink) = controller(settings());
        go_autonomous(&mut c, &remote).await;
        for id in ["t-1", "t-2", "t-3"] {
            let (k, d) = local(id);
            h.record(k, d);
        }
        remote.set_reachable(true);
        remote.set_fail_sync(true);
        assert_eq!(c.heartbeat_once().await, ConnectivityMode::Autonomous);
        assert_eq!(c.pending().len(), 3);

        remote.set_fail_sync(false);
        assert_eq!(c.heartbeat_once().await, ConnectivityMode::Connected);
        assert_eq!(remote.synced().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_ack_removes_only_acknowledged() {
        let (mut c, h, remote, _sink) = controller(settings());
        go_autonomous(&mut c, &remote).await;
        for id in ["t-1", "t-2", "t-3"] {
            let (k, d) = local(id);
            h.record(k, d);
        }
        remote.set_reachable(true);
        remote.set_ack_limit(Some(0));
        assert_eq!(c.heartbeat_once().await, ConnectivityMode::Autonomous);
        assert_eq!(c.pending().len(), 3);

        remote.set_ack_limit(Some(1));
        assert_eq!(c.heartbeat_once().await, ConnectivityMode::Connected);
        let seqs: Vec<u64> = remote.synced().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, [1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_newest_and_counts() {
        let mut s = settings();
        s.max_pending = 2;
        let (mut c, h, remote, sink) = controller(s);
        go_autonomous(&mut c, &remote).await;
        for id in ["t-1", "t-2", "t-3"] {
            let (k, d) = local(id);
            h.record(k, d);
        }
        c.ingest();
        let kept: Vec<&str> = c.pending().iter().map(|r| r.decision.task_id.as_str()).collect();
        assert_eq!(kept, ["t-1", "t-2"]);
        assert_eq!(h.view().dropped_sync, 1);
        assert_eq!(sink.count("sync_log_overflow"), 1);
    }
}
