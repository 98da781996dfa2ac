//! Redundancy and failover.
//!
//! `FailoverMachine` is a pure state machine: it is fed received messages
//! and clock ticks and answers with actions. It never does I/O, so the
//! failover rules are testable with synthetic instants. `ClusterNode` runs
//! a machine against a `ClusterTransport`, publishes the resulting view on
//! a `watch` channel (the router's admission gate) and carries out actions.
//!
//! Rules:
//!   - every node heartbeats each interval; a peer silent for
//!     `suspect_after_missed` intervals is suspected down
//!   - when the primary is suspected, the greatest alive backup id
//!     (self included) is the candidate; it promotes once more than half of
//!     the alive peers report they are backups that see no primary, and no
//!     alive peer claims Primary
//!   - promotion bumps the epoch past anything seen and announces topology
//!   - two primaries: higher epoch wins; on equal epoch the lower id yields

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use edgeline_core::cluster::{
    ClusterMessage, Heartbeat, NodeId, NodeRole, ReplicatedDecision, StateSync,
    TopologyAnnouncement,
};
use edgeline_core::config::ClusterConfig;
use edgeline_core::error::EngineError;
use edgeline_core::wire::{FrameHeader, MAX_FRAME};

use crate::cache::DecisionCache;
use crate::monitor::ResourceMonitor;
use crate::telemetry::{SharedSink, TelemetryEvent};
use crate::transport::{ClusterTransport, TransportError};

/// Most replicated entries per `StateSync` message. Messages are also cut
/// short whenever the next entry would push the frame past `MAX_FRAME`.
const STATE_SYNC_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct FailoverSettings {
    pub heartbeat_interval: Duration,
    pub suspect_after_missed: u32,
    /// Primary replicates its hot tier every N heartbeats. 0 = never.
    pub state_sync_every: u32,
}

impl FailoverSettings {
    pub fn from_config(c: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            suspect_after_missed: c.suspect_after_missed,
            state_sync_every: c.state_sync_every,
        }
    }

    fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.suspect_after_missed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub epoch: u64,
    pub primary: Option<NodeId>,
    pub health_pct: u8,
    pub alive: bool,
    pub last_seen_ms: u64,
}

/// What this node believes about the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub epoch: u64,
    pub primary: Option<NodeId>,
    pub peers: Vec<PeerView>,
}

impl ClusterView {
    /// A node running without a cluster is always its own primary.
    pub fn standalone(node_id: NodeId) -> Self {
        Self {
            primary: Some(node_id.clone()),
            node_id,
            role: NodeRole::Primary,
            epoch: 0,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterAction {
    Send(ClusterMessage),
    Promoted {
        epoch: u64,
        previous: Option<NodeId>,
        /// Time between first suspecting the primary and promotion.
        detection: Duration,
    },
    Demoted {
        primary: NodeId,
        epoch: u64,
    },
    SplitBrain {
        remote: NodeId,
        epoch: u64,
        yielded: bool,
    },
    /// Primary only: time to replicate the hot tier.
    ReplicateHot,
    ApplyStateSync(StateSync),
}

#[derive(Debug, Clone)]
struct Peer {
    last: Heartbeat,
    seen_at: Instant,
}

pub struct FailoverMachine {
    node_id: NodeId,
    role: NodeRole,
    epoch: u64,
    primary: Option<NodeId>,
    last_primary: Option<NodeId>,
    peers: BTreeMap<NodeId, Peer>,
    settings: FailoverSettings,
    started: Instant,
    suspected_at: Option<Instant>,
    seq: u64,
    ticks: u64,
}

impl FailoverMachine {
    pub fn new(node_id: NodeId, role: NodeRole, settings: FailoverSettings, now: Instant) -> Self {
        let primary = (role == NodeRole::Primary).then(|| node_id.clone());
        Self {
            last_primary: primary.clone(),
            node_id,
            role,
            epoch: 0,
            primary,
            peers: BTreeMap::new(),
            settings,
            started: now,
            suspected_at: None,
            seq: 0,
            ticks: 0,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn primary(&self) -> Option<&NodeId> {
        self.primary.as_ref()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn alive<'a>(&'a self, now: Instant) -> impl Iterator<Item = &'a Peer> + 'a {
        let window = self.settings.suspect_after();
        self.peers
            .values()
            .filter(move |p| now.saturating_duration_since(p.seen_at) <= window)
    }

    fn heartbeat(&mut self, health_pct: u8) -> Heartbeat {
        self.seq += 1;
        Heartbeat {
            node_id: self.node_id.clone(),
            role: self.role,
            epoch: self.epoch,
            seq: self.seq,
            primary: self.primary.clone(),
            health_pct,
        }
    }

    /// One heartbeat interval elapsed.
    pub fn on_tick(&mut self, now: Instant, health_pct: u8) -> Vec<ClusterAction> {
        let mut actions = Vec::new();
        if self.role == NodeRole::Backup {
            self.evaluate(now, &mut actions);
        }
        let hb = self.heartbeat(health_pct);
        actions.push(ClusterAction::Send(ClusterMessage::Heartbeat(hb)));

        self.ticks += 1;
        let every = u64::from(self.settings.state_sync_every);
        if self.role == NodeRole::Primary && every > 0 && self.ticks % every == 0 {
            actions.push(ClusterAction::ReplicateHot);
        }
        actions
    }

    fn evaluate(&mut self, now: Instant, actions: &mut Vec<ClusterAction>) {
        // Give peers a full detection window to be heard from after startup.
        if now.saturating_duration_since(self.started) < self.settings.suspect_after() {
            return;
        }

        if let Some(p) = self.primary.clone() {
            let primary_alive = self.alive(now).any(|peer| peer.last.node_id == p);
            if primary_alive {
                return;
            }
            tracing::warn!(primary = %p, epoch = self.epoch, "primary suspected down");
            self.primary = None;
            self.suspected_at = Some(now);
        }
        let suspected_at = *self.suspected_at.get_or_insert(now);

        let alive: Vec<&Peer> = self.alive(now).collect();
        if alive
            .iter()
            .any(|p| p.last.role == NodeRole::Primary && p.last.epoch >= self.epoch)
        {
            return;
        }

        let candidate = alive
            .iter()
            .filter(|p| p.last.role == NodeRole::Backup)
            .map(|p| &p.last.node_id)
            .chain(std::iter::once(&self.node_id))
            .max();
        if candidate != Some(&self.node_id) {
            return;
        }

        let confirmations = alive
            .iter()
            .filter(|p| {
                p.last.role == NodeRole::Backup
                    && p.last.primary.as_ref().map_or(true, |x| x == &self.node_id)
            })
            .count();
        if !alive.is_empty() && confirmations * 2 <= alive.len() {
            tracing::debug!(confirmations, alive = alive.len(), "awaiting promotion quorum");
            return;
        }

        let max_seen = alive.iter().map(|p| p.last.epoch).max().unwrap_or(0);
        let members: Vec<NodeId> = alive
            .iter()
            .map(|p| p.last.node_id.clone())
            .chain(std::iter::once(self.node_id.clone()))
            .collect();
        self.epoch = self.epoch.max(max_seen) + 1;
        self.role = NodeRole::Primary;
        self.primary = Some(self.node_id.clone());
        self.suspected_at = None;

        actions.push(ClusterAction::Promoted {
            epoch: self.epoch,
            previous: self.last_primary.replace(self.node_id.clone()),
            detection: now.saturating_duration_since(suspected_at),
        });
        actions.push(ClusterAction::Send(ClusterMessage::Topology(TopologyAnnouncement {
            epoch: self.epoch,
            primary: self.node_id.clone(),
            members,
        })));
    }

    fn follow(&mut self, primary: NodeId, epoch: u64, actions: &mut Vec<ClusterAction>) {
        let was_primary = self.role == NodeRole::Primary;
        self.role = NodeRole::Backup;
        self.epoch = epoch;
        self.primary = Some(primary.clone());
        self.last_primary = Some(primary.clone());
        self.suspected_at = None;
        if was_primary {
            actions.push(ClusterAction::Demoted { primary, epoch });
        }
    }

    /// A message arrived from another node.
    pub fn on_message(&mut self, msg: ClusterMessage, now: Instant) -> Vec<ClusterAction> {
        let mut actions = Vec::new();
        if msg.sender() == &self.node_id {
            return actions;
        }
        match msg {
            ClusterMessage::Heartbeat(hb) => {
                self.peers.insert(
                    hb.node_id.clone(),
                    Peer {
                        last: hb.clone(),
                        seen_at: now,
                    },
                );
                match (self.role, hb.role) {
                    (NodeRole::Primary, NodeRole::Primary) => {
                        let yielded = hb.epoch > self.epoch
                            || (hb.epoch == self.epoch && self.node_id < hb.node_id);
                        let epoch = self.epoch.max(hb.epoch);
                        let err = EngineError::ClusterSplitBrain {
                            local: self.node_id.clone(),
                            remote: hb.node_id.clone(),
                            epoch,
                        };
                        tracing::error!(
                            kind = err.kind(),
                            local_epoch = self.epoch,
                            remote_epoch = hb.epoch,
                            yielded,
                            "{err}"
                        );
                        actions.push(ClusterAction::SplitBrain {
                            remote: hb.node_id.clone(),
                            epoch,
                            yielded,
                        });
                        if yielded {
                            self.follow(hb.node_id, hb.epoch, &mut actions);
                        }
                    }
                    (NodeRole::Backup, NodeRole::Primary) => {
                        if hb.epoch >= self.epoch {
                            if self.primary.as_ref() != Some(&hb.node_id) {
                                tracing::info!(primary = %hb.node_id, epoch = hb.epoch, "following primary");
                            }
                            self.follow(hb.node_id, hb.epoch, &mut actions);
                        }
                    }
                    (_, NodeRole::Backup) => {
                        // A peer that has already moved to a newer topology.
                        if hb.epoch > self.epoch {
                            if let Some(p) = hb.primary.filter(|p| p != &self.node_id) {
                                self.follow(p, hb.epoch, &mut actions);
                            }
                        }
                    }
                }
            }
            ClusterMessage::Topology(t) => {
                if t.epoch > self.epoch {
                    tracing::info!(primary = %t.primary, epoch = t.epoch, "topology announced");
                    if t.primary == self.node_id {
                        self.epoch = t.epoch;
                        self.role = NodeRole::Primary;
                        self.primary = Some(t.primary);
                    } else {
                        self.follow(t.primary, t.epoch, &mut actions);
                    }
                }
            }
            ClusterMessage::StateSync(s) => {
                if self.role == NodeRole::Backup
                    && self.primary.as_ref() == Some(&s.from)
                    && s.epoch >= self.epoch
                {
                    actions.push(ClusterAction::ApplyStateSync(s));
                }
            }
        }
        actions
    }

    pub fn view(&self, now: Instant) -> ClusterView {
        let window = self.settings.suspect_after();
        ClusterView {
            node_id: self.node_id.clone(),
            role: self.role,
            epoch: self.epoch,
            primary: self.primary.clone(),
            peers: self
                .peers
                .values()
                .map(|p| {
                    let age = now.saturating_duration_since(p.seen_at);
                    PeerView {
                        node_id: p.last.node_id.clone(),
                        role: p.last.role,
                        epoch: p.last.epoch,
                        primary: p.last.primary.clone(),
                        health_pct: p.last.health_pct,
                        alive: age <= window,
                        last_seen_ms: age.as_millis() as u64,
                    }
                })
                .collect(),
        }
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

pub struct ClusterNode {
    machine: FailoverMachine,
    transport: Arc<dyn ClusterTransport>,
    cache: DecisionCache,
    monitor: ResourceMonitor,
    telemetry: SharedSink,
    view_tx: watch::Sender<ClusterView>,
}

impl ClusterNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        initial_role: NodeRole,
        settings: FailoverSettings,
        transport: Arc<dyn ClusterTransport>,
        cache: DecisionCache,
        monitor: ResourceMonitor,
        telemetry: SharedSink,
        view_tx: watch::Sender<ClusterView>,
    ) -> Self {
        let machine = FailoverMachine::new(node_id, initial_role, settings, Instant::now());
        view_tx.send_replace(machine.view(Instant::now()));
        Self {
            machine,
            transport,
            cache,
            monitor,
            telemetry,
            view_tx,
        }
    }

    /// Runs until the transport closes.
    pub async fn run(mut self) {
        tracing::info!(
            node = %self.machine.node_id(),
            role = ?self.machine.role(),
            interval_ms = self.machine.settings.heartbeat_interval.as_millis() as u64,
            "cluster node started"
        );
        let transport = self.transport.clone();
        let mut tick = tokio::time::interval(self.machine.settings.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let health = self.monitor.snapshot().health_pct();
                    let actions = self.machine.on_tick(Instant::now(), health);
                    self.apply(actions).await;
                }
                msg = transport.recv() => match msg {
                    Ok(msg) => {
                        let actions = self.machine.on_message(msg, Instant::now());
                        self.apply(actions).await;
                    }
                    Err(TransportError::Closed) => {
                        tracing::warn!("cluster transport closed");
                        break;
                    }
                    Err(e) => tracing::debug!(error = %e, "dropping cluster message"),
                },
            }
            self.view_tx.send_replace(self.machine.view(Instant::now()));
        }
    }

    async fn apply(&mut self, actions: Vec<ClusterAction>) {
        for action in actions {
            match action {
                ClusterAction::Send(msg) => self.send(&msg).await,
                ClusterAction::Promoted { epoch, previous, detection } => {
                    tracing::info!(
                        node = %self.machine.node_id(),
                        epoch,
                        previous = ?previous,
                        detection_us = detection.as_micros() as u64,
                        "promoted to primary"
                    );
                    self.telemetry.emit(TelemetryEvent::Failover {
                        node_id: self.machine.node_id().clone(),
                        previous_primary: previous,
                        epoch,
                        detection_to_promotion_us: detection.as_micros() as u64,
                    });
                }
                ClusterAction::Demoted { primary, epoch } => {
                    tracing::warn!(primary = %primary, epoch, "stepped down to backup");
                }
                ClusterAction::SplitBrain { remote, epoch, yielded } => {
                    self.telemetry.emit(TelemetryEvent::SplitBrain {
                        local: self.machine.node_id().clone(),
                        remote,
                        epoch,
                        yielded,
                    });
                }
                ClusterAction::ReplicateHot => {
                    let entries = self.cache.hot_snapshot();
                    let batches =
                        state_sync_batches(self.machine.node_id(), self.machine.epoch(), entries);
                    for msg in batches {
                        self.send(&msg).await;
                    }
                }
                ClusterAction::ApplyStateSync(s) => {
                    let applied = self.cache.apply_replicated(s.entries);
                    tracing::trace!(from = %s.from, applied, "state sync applied");
                }
            }
        }
    }

    async fn send(&self, msg: &ClusterMessage) {
        match self.transport.send(msg).await {
            Ok(()) => {}
            Err(e @ TransportError::Wire(_)) => {
                tracing::warn!(error = %e, "cluster message not encodable, dropped");
            }
            Err(e) => tracing::debug!(error = %e, "cluster send failed"),
        }
    }
}

/// Pack hot entries into `StateSync` messages that each encode into one
/// frame. Body sizes are exact: compact JSON of the empty message plus each
/// entry and its separating comma.
fn state_sync_batches(
    from: &NodeId,
    epoch: u64,
    entries: Vec<ReplicatedDecision>,
) -> Vec<ClusterMessage> {
    let message = |entries: Vec<ReplicatedDecision>| {
        ClusterMessage::StateSync(StateSync {
            from: from.clone(),
            epoch,
            entries,
        })
    };
    let empty = StateSync {
        from: from.clone(),
        epoch,
        entries: Vec::new(),
    };
    let base = match serde_json::to_vec(&empty) {
        Ok(body) => std::mem::size_of::<FrameHeader>() + body.len(),
        Err(e) => {
            tracing::warn!(error = %e, "state sync not encodable, skipped");
            return Vec::new();
        }
    };

    let mut batches = Vec::new();
    let mut batch: Vec<ReplicatedDecision> = Vec::new();
    let mut size = base;
    for entry in entries {
        let len = match serde_json::to_vec(&entry) {
            Ok(body) => body.len(),
            Err(e) => {
                tracing::warn!(key = %entry.key, error = %e, "hot entry not encodable, skipped");
                continue;
            }
        };
        if base + len > MAX_FRAME {
            tracing::warn!(key = %entry.key, bytes = len, "hot entry exceeds one frame, not replicated");
            continue;
        }
        let separator = usize::from(!batch.is_empty());
        if batch.len() == STATE_SYNC_CHUNK || size + separator + len > MAX_FRAME {
            batches.push(message(std::mem::take(&mut batch)));
            size = base;
        }
        size += usize::from(!batch.is_empty()) + len;
        batch.push(entry);
    }
    if !batch.is_empty() {
        batches.push(message(batch));
    }
    batches
}
