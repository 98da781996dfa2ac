//! Candidate agent registry.
//!
//! Fed by the external registry (HTTP `PUT /api/agents/{task_type}`) and
//! seeded from config. Every agent carries a health epoch that bumps when
//! its health changes; cached decisions remember the epoch they were made
//! against and are invalidated when it moves.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use edgeline_core::agent::{AgentHealth, AgentRef, CandidateAgent};
use edgeline_core::config::AgentSeed;

#[derive(Debug, Clone, Copy)]
struct HealthRecord {
    health: AgentHealth,
    epoch: u64,
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    by_type: Arc<DashMap<String, Vec<CandidateAgent>>>,
    health: Arc<DashMap<AgentRef, HealthRecord>>,
    next_epoch: Arc<AtomicU64>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: &[AgentSeed]) -> Self {
        let registry = Self::new();
        let mut grouped: BTreeMap<&str, Vec<CandidateAgent>> = BTreeMap::new();
        for seed in seeds {
            grouped
                .entry(seed.task_type.as_str())
                .or_default()
                .push(seed.agent.clone());
        }
        for (task_type, agents) in grouped {
            registry.set_candidates(task_type, agents);
        }
        registry
    }

    fn bump(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replace the candidate set for a task type.
    pub fn set_candidates(&self, task_type: &str, agents: Vec<CandidateAgent>) {
        for agent in &agents {
            self.track_health(&agent.agent_ref, agent.health);
        }
        let count = agents.len();
        self.by_type.insert(task_type.to_string(), agents);
        self.forget_orphans();
        tracing::debug!(task_type, agents = count, "candidate set updated");
    }

    /// Update one agent's health everywhere it appears.
    pub fn update_health(&self, agent_ref: &AgentRef, health: AgentHealth) -> bool {
        if !self.health.contains_key(agent_ref) {
            return false;
        }
        for mut entry in self.by_type.iter_mut() {
            for agent in entry.value_mut().iter_mut() {
                if &agent.agent_ref == agent_ref {
                    agent.health = health;
                }
            }
        }
        self.track_health(agent_ref, health);
        true
    }

    pub fn remove_task_type(&self, task_type: &str) -> bool {
        let removed = self.by_type.remove(task_type).is_some();
        if removed {
            self.forget_orphans();
        }
        removed
    }

    fn track_health(&self, agent_ref: &AgentRef, health: AgentHealth) {
        let changed = match self.health.get(agent_ref) {
            Some(rec) => rec.health != health,
            None => true,
        };
        if changed {
            let epoch = self.bump();
            self.health
                .insert(agent_ref.clone(), HealthRecord { health, epoch });
        }
    }

    /// Drop health records for agents no longer listed under any task type.
    fn forget_orphans(&self) {
        let listed: HashSet<AgentRef> = self
            .by_type
            .iter()
            .flat_map(|e| e.value().iter().map(|a| a.agent_ref.clone()).collect::<Vec<_>>())
            .collect();
        self.health.retain(|agent_ref, _| listed.contains(agent_ref));
    }

    pub fn candidates(&self, task_type: &str) -> Vec<CandidateAgent> {
        self.by_type
            .get(task_type)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Health epoch for an agent. `None` if the registry does not know it.
    pub fn epoch(&self, agent_ref: &AgentRef) -> Option<u64> {
        self.health.get(agent_ref).map(|r| r.epoch)
    }

    pub fn health(&self, agent_ref: &AgentRef) -> Option<AgentHealth> {
        self.health.get(agent_ref).map(|r| r.health)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<CandidateAgent>> {
        self.by_type
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.health.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_change_bumps_epoch() {
        let registry = AgentRegistry::new();
        registry.set_candidates("pick", vec![CandidateAgent::new("arm-1", 0.9, 0.1)]);
        let arm = AgentRef::from("arm-1");
        let before = registry.epoch(&arm).unwrap();

        // Same health again: no bump.
        registry.set_candidates("pick", vec![CandidateAgent::new("arm-1", 0.9, 0.4)]);
        assert_eq!(registry.epoch(&arm), Some(before));

        assert!(registry.update_health(&arm, AgentHealth::Degraded));
        assert!(registry.epoch(&arm).unwrap() > before);
        assert_eq!(registry.candidates("pick")[0].health, AgentHealth::Degraded);
    }

    #[test]
    fn removed_agents_are_forgotten() {
        let registry = AgentRegistry::new();
        registry.set_candidates(
            "pick",
            vec![
                CandidateAgent::new("arm-1", 0.9, 0.1),
                CandidateAgent::new("arm-2", 0.9, 0.1),
            ],
        );
        registry.set_candidates("pick", vec![CandidateAgent::new("arm-2", 0.9, 0.1)]);
        assert_eq!(registry.epoch(&AgentRef::from("arm-1")), None);
        assert!(registry.epoch(&AgentRef::from("arm-2")).is_some());
    }

    #[test]
    fn agent_shared_between_types_survives_partial_removal() {
        let registry = AgentRegistry::new();
        registry.set_candidates("pick", vec![CandidateAgent::new("arm-1", 0.9, 0.1)]);
        registry.set_candidates("place", vec![CandidateAgent::new("arm-1", 0.7, 0.1)]);
        assert!(registry.remove_task_type("pick"));
        assert!(registry.epoch(&AgentRef::from("arm-1")).is_some());
        assert_eq!(registry.agent_count(), 1);
    }

    #[test]
    fn unknown_agent_health_update_is_rejected() {
        let registry = AgentRegistry::new();
        assert!(!registry.update_health(&AgentRef::from("ghost"), AgentHealth::Unhealthy));
    }

    #[test]
    fn seeds_group_by_task_type() {
        let seeds = vec![
            AgentSeed {
                task_type: "pick".into(),
                agent: CandidateAgent::new("arm-1", 0.9, 0.1),
            },
            AgentSeed {
                task_type: "pick".into(),
                agent: CandidateAgent::new("arm-2", 0.8, 0.1),
            },
            AgentSeed {
                task_type: "inspect".into(),
                agent: CandidateAgent::new("cam-1", 0.8, 0.1),
            },
        ];
        let registry = AgentRegistry::from_seeds(&seeds);
        assert_eq!(registry.candidates("pick").len(), 2);
        assert_eq!(registry.candidates("inspect").len(), 1);
        assert!(registry.candidates("weld").is_empty());
    }
}
