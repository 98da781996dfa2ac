//! Agent selection.
//!
//! Suitability = capability score × health weight, further scaled by local
//! headroom for agents that run on this node's own compute. Scores are
//! quantized to thousandths so float noise never decides a tie. Ties go to
//! the lowest current load, then the lowest failure rate, then the
//! lexicographically smallest agent ref, keeping routing reproducible.

use std::cmp::Ordering;

use edgeline_core::agent::CandidateAgent;

use crate::monitor::ResourceSnapshot;

/// Quantized suitability score, 0..=1000.
pub fn score(agent: &CandidateAgent, snapshot: &ResourceSnapshot) -> u32 {
    let mut s = agent.capability_score.clamp(0.0, 1.0) * agent.health.weight();
    if agent.on_node {
        s *= snapshot.headroom();
    }
    (s * 1000.0).round() as u32
}

fn rank(a: &CandidateAgent, b: &CandidateAgent, snapshot: &ResourceSnapshot) -> Ordering {
    score(b, snapshot)
        .cmp(&score(a, snapshot))
        .then_with(|| a.current_load.total_cmp(&b.current_load))
        .then_with(|| a.failure_rate.total_cmp(&b.failure_rate))
        .then_with(|| a.agent_ref.cmp(&b.agent_ref))
}

/// Best local candidate, or `None` when no healthy local agent exists.
pub fn select_local<'a>(
    candidates: &'a [CandidateAgent],
    snapshot: &ResourceSnapshot,
) -> Option<&'a CandidateAgent> {
    candidates
        .iter()
        .filter(|a| a.is_local_candidate())
        .min_by(|a, b| rank(a, b, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeline_core::agent::{AgentHealth, AgentLocation};

    fn snapshot(cpu: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_utilization: cpu,
            memory_utilization: 0.1,
            network_rtt_ms: None,
            age_ms: 0,
            stale: false,
            saturated: false,
        }
    }

    fn pick(candidates: &[CandidateAgent]) -> &str {
        select_local(candidates, &snapshot(0.0)).unwrap().agent_ref.as_str()
    }

    #[test]
    fn equal_scores_prefer_lowest_load() {
        let c = vec![
            CandidateAgent::new("B", 0.8, 0.5),
            CandidateAgent::new("A", 0.8, 0.2),
        ];
        assert_eq!(pick(&c), "A");
    }

    #[test]
    fn higher_score_beats_lower_load() {
        let c = vec![
            CandidateAgent::new("A", 0.6, 0.0),
            CandidateAgent::new("B", 0.9, 0.8),
        ];
        assert_eq!(pick(&c), "B");
    }

    #[test]
    fn failure_rate_then_id_break_remaining_ties() {
        let c = vec![
            CandidateAgent::new("C", 0.8, 0.3).with_failure_rate(0.2),
            CandidateAgent::new("B", 0.8, 0.3).with_failure_rate(0.1),
            CandidateAgent::new("A", 0.8, 0.3).with_failure_rate(0.1),
        ];
        assert_eq!(pick(&c), "A");
    }

    #[test]
    fn degraded_health_halves_score() {
        let c = vec![
            CandidateAgent::new("A", 0.9, 0.1).with_health(AgentHealth::Degraded),
            CandidateAgent::new("B", 0.6, 0.1),
        ];
        assert_eq!(pick(&c), "B");
    }

    #[test]
    fn unhealthy_and_cloud_agents_are_skipped() {
        let c = vec![
            CandidateAgent::new("A", 1.0, 0.0).with_health(AgentHealth::Unhealthy),
            CandidateAgent::new("B", 1.0, 0.0).with_location(AgentLocation::Cloud),
        ];
        assert!(select_local(&c, &snapshot(0.0)).is_none());
    }

    #[test]
    fn on_node_agents_scale_with_headroom() {
        let c = vec![
            CandidateAgent::new("vision", 0.9, 0.1).on_node(),
            CandidateAgent::new("remote-cam", 0.6, 0.1),
        ];
        assert_eq!(select_local(&c, &snapshot(0.1)).unwrap().agent_ref.as_str(), "vision");
        assert_eq!(
            select_local(&c, &snapshot(0.5)).unwrap().agent_ref.as_str(),
            "remote-cam"
        );
    }
}
