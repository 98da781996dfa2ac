//! Cache correctness: served decisions match what a fresh decision would
//! have been, and anything stale is never served.

use std::time::Duration;

use edgeline_core::agent::{AgentHealth, AgentRef, CandidateAgent};
use edgeline_core::decision::{ProducedBy, Route};
use edgeline_core::task::PriorityClass;
use edgeline_engine::cache::Tier;

use crate::*;

#[tokio::test]
async fn scenario_repeated_shape_hits_cache() {
    let h = harness();
    let mut by = Vec::new();
    for i in 0..100 {
        let d = h
            .node
            .router
            .submit(task(&format!("std-{i}"), PriorityClass::Standard))
            .await
            .unwrap();
        by.push(d.produced_by);
    }
    assert_eq!(by[0], ProducedBy::Manager);
    assert!(by[1..].iter().all(|p| *p == ProducedBy::Cache));
    assert_eq!(h.remote.decide_calls(), 1);
}

#[tokio::test]
async fn frequent_keys_are_promoted_to_hot() {
    let h = harness();
    let key = task("k", PriorityClass::QualityCritical).classification_key();
    for i in 0..5 {
        h.node
            .router
            .submit(task(&format!("q-{i}"), PriorityClass::QualityCritical))
            .await
            .unwrap();
    }
    assert_eq!(h.node.cache.tier_of(&key), Some(Tier::Hot));
}

#[tokio::test]
async fn health_change_invalidates_cached_decision() {
    let h = harness();
    let first = h
        .node
        .router
        .submit(task("h-1", PriorityClass::QualityCritical))
        .await
        .unwrap();
    assert_eq!(first.agent_ref, Some(AgentRef::from("agent-a")));

    h.node
        .registry
        .update_health(&AgentRef::from("agent-a"), AgentHealth::Unhealthy);
    let second = h
        .node
        .router
        .submit(task("h-2", PriorityClass::QualityCritical))
        .await
        .unwrap();
    assert_ne!(second.produced_by, ProducedBy::Cache);
    assert_eq!(second.agent_ref, Some(AgentRef::from("agent-b")));
}

#[tokio::test]
async fn removed_agent_is_treated_as_corruption() {
    let h = harness();
    h.node
        .router
        .submit(task("r-1", PriorityClass::QualityCritical))
        .await
        .unwrap();
    h.node
        .registry
        .set_candidates(INSPECT, vec![CandidateAgent::new("agent-b", 0.9, 0.5)]);

    let d = h
        .node
        .router
        .submit(task("r-2", PriorityClass::QualityCritical))
        .await
        .unwrap();
    assert_eq!(d.agent_ref, Some(AgentRef::from("agent-b")));
    assert_eq!(h.sink.count("cache_corruption"), 1);
    assert_eq!(h.node.cache.stats().corruptions, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_not_served() {
    let h = harness();
    h.node
        .router
        .submit(task("e-1", PriorityClass::Standard))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(10_001)).await;
    let d = h
        .node
        .router
        .submit(task("e-2", PriorityClass::Standard))
        .await
        .unwrap();
    assert_eq!(d.produced_by, ProducedBy::Manager);
    assert_eq!(d.route, Route::Remote);
}

#[tokio::test]
async fn clearing_the_cache_forces_fresh_decisions() {
    let h = harness();
    h.node
        .router
        .submit(task("c-1", PriorityClass::Standard))
        .await
        .unwrap();
    assert_eq!(h.node.cache.clear(), 1);
    let d = h
        .node
        .router
        .submit(task("c-2", PriorityClass::Standard))
        .await
        .unwrap();
    assert_eq!(d.produced_by, ProducedBy::Manager);
}
