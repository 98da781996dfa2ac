//! Three-node failover over the in-memory hub, on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use edgeline_core::cluster::{NodeId, NodeRole};
use edgeline_core::task::PriorityClass;
use edgeline_engine::cache::Tier;
use edgeline_engine::monitor::FixedSampler;
use edgeline_engine::telemetry::{RecordingSink, TelemetryEvent};
use edgeline_engine::transport::MemoryHub;
use edgeline_engine::{EdgeNode, SubmitError};

use crate::*;

struct Member {
    node: EdgeNode,
    sink: Arc<RecordingSink>,
    handles: Vec<JoinHandle<()>>,
}

impl Member {
    fn role(&self) -> NodeRole {
        self.node.cluster_view().role
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        for h in &self.handles {
            h.abort();
        }
    }
}

fn clustered(id: &str, role: NodeRole) -> Harness {
    let mut config = seeded_config();
    config.node.node_id = id.to_string();
    config.cluster.enabled = true;
    config.cluster.interface = "hub".into();
    config.cluster.initial_role = role;
    harness_with(config)
}

fn start(h: Harness, hub: &MemoryHub) -> Member {
    let transport = Arc::new(hub.join(h.node.node_id.clone()));
    let handles = h
        .bg
        .spawn(FixedSampler::new(0.2, 0.3), Some(transport));
    Member {
        node: h.node,
        sink: h.sink,
        handles,
    }
}

/// Poll `done` every 5ms for at most `limit`. Returns how long it took.
async fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> Option<Duration> {
    let started = Instant::now();
    while started.elapsed() <= limit {
        if done() {
            return Some(started.elapsed());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

fn primaries(members: &[&Member]) -> usize {
    members.iter().filter(|m| m.role() == NodeRole::Primary).count()
}

fn trio(hub: &MemoryHub) -> (Member, Member, Member) {
    let a = start(clustered("edge-a", NodeRole::Backup), hub);
    let b = start(clustered("edge-b", NodeRole::Backup), hub);
    let c = start(clustered("edge-c", NodeRole::Primary), hub);
    (a, b, c)
}

#[tokio::test(start_paused = true)]
async fn backups_follow_the_primary_and_reject_tasks() {
    let hub = MemoryHub::new();
    let (a, b, c) = trio(&hub);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(c.role(), NodeRole::Primary);
    for backup in [&a, &b] {
        assert_eq!(backup.role(), NodeRole::Backup);
        assert_eq!(backup.node.cluster_view().primary, Some(NodeId::from("edge-c")));
        let err = backup
            .node
            .router
            .submit(task("b-1", PriorityClass::Standard))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::NotPrimary {
                primary: Some(NodeId::from("edge-c"))
            }
        );
    }
    assert!(c
        .node
        .router
        .submit(task("c-1", PriorityClass::Standard))
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn highest_backup_takes_over_within_100ms() {
    let hub = MemoryHub::new();
    let (a, b, c) = trio(&hub);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(primaries(&[&a, &b, &c]), 1);

    hub.kill(&NodeId::from("edge-c"));
    let took = wait_until(Duration::from_millis(100), || b.role() == NodeRole::Primary).await;
    assert!(took.is_some(), "edge-b was not promoted within 100ms");

    let events = b.sink.events();
    let failover = events.iter().find_map(|e| match e {
        TelemetryEvent::Failover {
            previous_primary,
            epoch,
            ..
        } => Some((previous_primary.clone(), *epoch)),
        _ => None,
    });
    assert_eq!(failover, Some((Some(NodeId::from("edge-c")), 1)));

    // The surviving backup follows the new primary.
    let followed = wait_until(Duration::from_millis(100), || {
        a.node.cluster_view().primary == Some(NodeId::from("edge-b"))
    })
    .await;
    assert!(followed.is_some());
    assert_eq!(a.role(), NodeRole::Backup);
    assert!(b
        .node
        .router
        .submit(task("after-1", PriorityClass::Standard))
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn revived_primary_yields_to_the_newer_epoch() {
    let hub = MemoryHub::new();
    let (a, b, c) = trio(&hub);
    tokio::time::sleep(Duration::from_millis(500)).await;
    hub.kill(&NodeId::from("edge-c"));
    assert!(wait_until(Duration::from_millis(100), || b.role() == NodeRole::Primary)
        .await
        .is_some());

    // edge-c never heard about the takeover and still claims epoch 0.
    assert_eq!(c.role(), NodeRole::Primary);
    hub.revive(&NodeId::from("edge-c"));
    let settled = wait_until(Duration::from_millis(200), || c.role() == NodeRole::Backup).await;
    assert!(settled.is_some(), "stale primary did not step down");

    assert_eq!(primaries(&[&a, &b, &c]), 1);
    assert_eq!(b.role(), NodeRole::Primary);
    assert_eq!(c.node.cluster_view().primary, Some(NodeId::from("edge-b")));
    assert!(c.node.cluster_view().epoch >= 1);
}

#[tokio::test(start_paused = true)]
async fn equal_epoch_primaries_resolve_to_the_higher_id() {
    let hub = MemoryHub::new();
    let x = start(clustered("edge-x", NodeRole::Primary), &hub);
    let y = start(clustered("edge-y", NodeRole::Primary), &hub);

    let settled = wait_until(Duration::from_millis(100), || x.role() == NodeRole::Backup).await;
    assert!(settled.is_some(), "lower id never yielded");
    assert_eq!(y.role(), NodeRole::Primary);
    assert_eq!(x.node.cluster_view().primary, Some(NodeId::from("edge-y")));
    assert!(x
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, TelemetryEvent::SplitBrain { yielded: true, .. })));
}

#[tokio::test(start_paused = true)]
async fn hot_decisions_replicate_to_backups() {
    let hub = MemoryHub::new();
    let primary = clustered("edge-c", NodeRole::Primary);
    for i in 0..5 {
        primary
            .node
            .router
            .submit(task(&format!("hot-{i}"), PriorityClass::QualityCritical))
            .await
            .unwrap();
    }
    let key = task("k", PriorityClass::QualityCritical).classification_key();
    assert_eq!(primary.node.cache.tier_of(&key), Some(Tier::Hot));

    let backup = start(clustered("edge-b", NodeRole::Backup), &hub);
    let _primary = start(primary, &hub);
    let replicated = wait_until(Duration::from_millis(600), || backup.node.cache.contains(&key)).await;
    assert!(replicated.is_some(), "hot entry never reached the backup");
    assert_eq!(backup.node.cache.tier_of(&key), Some(Tier::Warm));
}
