//! Disconnected operation: fallback-only routing while the cloud is gone,
//! then ordered reconciliation before reconnecting.

use edgeline_core::decision::{ProducedBy, Route};
use edgeline_core::task::PriorityClass;
use edgeline_engine::autonomy::ConnectivityMode;

use crate::*;

async fn go_autonomous(h: &mut Harness) {
    h.remote.set_reachable(false);
    for _ in 0..3 {
        h.bg.autonomy.heartbeat_once().await;
    }
    assert_eq!(h.bg.autonomy.mode(), ConnectivityMode::Autonomous);
    assert!(h.node.connectivity.is_autonomous());
}

#[tokio::test(start_paused = true)]
async fn autonomous_node_never_calls_the_cloud() {
    let mut h = harness();
    go_autonomous(&mut h).await;
    assert_eq!(h.sink.count("connectivity_change"), 1);

    for (i, class) in PriorityClass::ALL.iter().cycle().take(40).enumerate() {
        let d = h
            .node
            .router
            .submit(task(&format!("off-{i}"), *class).with_context("seq", i.to_string()))
            .await
            .unwrap();
        assert_eq!(d.route, Route::Local, "{}", d.task_id);
        let expected = if *class == PriorityClass::SafetyCritical {
            ProducedBy::Router
        } else {
            ProducedBy::Fallback
        };
        assert_eq!(d.produced_by, expected, "{}", d.task_id);
    }
    assert_eq!(h.remote.decide_calls(), 0);
    assert_eq!(h.sink.count("remote_dispatch"), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_drains_the_log_in_decision_order() {
    let mut config = seeded_config();
    config.autonomy.sync_batch_size = 3;
    let mut h = harness_with(config);
    go_autonomous(&mut h).await;

    let mut order = Vec::new();
    for i in 0..10 {
        let class = if i % 2 == 0 {
            PriorityClass::Standard
        } else {
            PriorityClass::QualityCritical
        };
        let d = h
            .node
            .router
            .submit(task(&format!("rec-{i}"), class).with_context("seq", i.to_string()))
            .await
            .unwrap();
        order.push(d.task_id);
    }
    h.bg.autonomy.ingest();
    assert_eq!(h.bg.autonomy.pending().len(), 10);
    assert_eq!(h.node.connectivity.view().pending_sync, 10);

    // The cloud comes back but only acknowledges one record per batch.
    h.remote.set_reachable(true);
    h.remote.set_ack_limit(Some(1));
    let mode = h.bg.autonomy.heartbeat_once().await;

    assert_eq!(mode, ConnectivityMode::Connected);
    assert!(h.bg.autonomy.pending().is_empty());
    let synced = h.remote.synced();
    let seqs: Vec<u64> = synced.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    let ids: Vec<_> = synced.iter().map(|r| r.decision.task_id.clone()).collect();
    assert_eq!(ids, order);
    assert_eq!(h.sink.count("connectivity_change"), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_upload_keeps_the_node_autonomous() {
    let mut h = harness();
    go_autonomous(&mut h).await;
    h.node
        .router
        .submit(task("held-1", PriorityClass::Standard))
        .await
        .unwrap();

    h.remote.set_reachable(true);
    h.remote.set_fail_sync(true);
    assert_eq!(h.bg.autonomy.heartbeat_once().await, ConnectivityMode::Autonomous);
    assert_eq!(h.bg.autonomy.pending().len(), 1);

    h.remote.set_fail_sync(false);
    assert_eq!(h.bg.autonomy.heartbeat_once().await, ConnectivityMode::Connected);
    assert_eq!(h.remote.synced().len(), 1);
}
