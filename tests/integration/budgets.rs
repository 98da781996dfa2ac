//! Every decision lands inside its class budget or is `Expired`.

use std::time::Duration;

use edgeline_core::decision::{ProducedBy, Route};
use edgeline_core::task::{PriorityClass, Task};

use crate::*;

fn assert_within_budget(h: &Harness, d: &edgeline_core::Decision) {
    let budget = h.node.router.budgets().budget(d.priority_class);
    assert!(
        d.route == Route::Expired || d.decision_latency_ns <= budget.as_nanos() as u64,
        "{} took {}ns with a {:?} budget",
        d.task_id,
        d.decision_latency_ns,
        budget
    );
}

#[tokio::test]
async fn scenario_safety_critical_picks_least_loaded_agent() {
    let h = harness();
    let d = h
        .node
        .router
        .submit(task("safety-1", PriorityClass::SafetyCritical))
        .await
        .unwrap();
    assert_eq!(d.route, Route::Local);
    assert_eq!(d.agent_ref.as_ref().map(|a| a.as_str()), Some("agent-a"));
    assert_eq!(d.produced_by, ProducedBy::Router);
    assert!(d.decision_latency_ns < 1_000_000, "took {}ns", d.decision_latency_ns);
    assert_eq!(h.remote.decide_calls(), 0);
}

#[tokio::test]
async fn every_class_stays_inside_its_budget() {
    let h = harness();
    for (i, class) in PriorityClass::ALL.iter().cycle().take(200).enumerate() {
        let d = h
            .node
            .router
            .submit(task(&format!("mix-{i}"), *class).with_context("n", (i % 13).to_string()))
            .await
            .unwrap();
        assert_within_budget(&h, &d);
    }
    let stats = h.node.router.stats();
    assert_eq!(stats.classes.iter().map(|c| c.decisions).sum::<u64>(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_load_stays_inside_budgets() {
    let h = harness();
    h.remote.set_latency(Duration::from_millis(30));

    let mut set = tokio::task::JoinSet::new();
    for (i, class) in PriorityClass::ALL.iter().cycle().take(400).enumerate() {
        let router = h.node.router.clone();
        let t = task(&format!("load-{i}"), *class).with_context("n", (i % 40).to_string());
        set.spawn(async move { router.submit(t).await });
    }

    let mut replies = 0;
    while let Some(joined) = set.join_next().await {
        let d = joined.unwrap().unwrap();
        assert_within_budget(&h, &d);
        replies += 1;
    }
    assert_eq!(replies, 400);
    let stats = h.node.router.stats();
    assert_eq!(stats.classes.iter().map(|c| c.decisions).sum::<u64>(), 400);
    assert!(h.remote.decide_calls() > 0);
}

#[tokio::test(start_paused = true)]
async fn slow_cloud_falls_back_inside_a_tight_budget() {
    let mut config = seeded_config();
    config.budgets.standard_us = Some(5_000);
    config.remote.min_remote_slack_ms = 1;
    let h = harness_with(config);
    h.remote.set_latency(Duration::from_millis(50));

    let d = h
        .node
        .router
        .submit(task("slow-1", PriorityClass::Standard))
        .await
        .unwrap();
    assert_eq!(d.produced_by, ProducedBy::Fallback);
    assert_eq!(d.route, Route::Local);
    assert!(d.decision_latency_ns <= 5_000_000);
    assert_eq!(h.sink.count("fallback"), 1);
    assert_eq!(h.sink.count("remote_dispatch"), 1);
}

#[tokio::test(start_paused = true)]
async fn remote_failure_recovers_locally() {
    let h = harness();
    h.remote.set_reachable(false);
    let d = h
        .node
        .router
        .submit(task("down-1", PriorityClass::Standard))
        .await
        .unwrap();
    assert_eq!(d.produced_by, ProducedBy::Fallback);
    assert_eq!(d.agent_ref.as_ref().map(|a| a.as_str()), Some("agent-a"));
    assert_within_budget(&h, &d);
}

#[tokio::test]
async fn no_candidates_expires_every_class() {
    let h = harness();
    h.remote.set_reachable(false);
    for (i, class) in PriorityClass::ALL.iter().enumerate() {
        let d = h
            .node
            .router
            .submit(Task::new(format!("none-{i}"), "unknown", *class))
            .await
            .unwrap();
        assert_eq!(d.route, Route::Expired, "{class}");
        assert!(d.agent_ref.is_none());
    }
    assert_eq!(h.node.router.stats().classes.iter().map(|c| c.expired).sum::<u64>(), 4);
}
