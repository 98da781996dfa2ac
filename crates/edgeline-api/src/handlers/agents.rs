//! /agents handlers: the candidate registry is fed from outside.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use edgeline_core::agent::CandidateAgent;

use super::{bad_request, ApiState};

pub async fn handle_agents(
    State(state): State<ApiState>,
) -> Json<BTreeMap<String, Vec<CandidateAgent>>> {
    Json(state.node.registry.snapshot())
}

#[derive(Serialize)]
pub struct SetAgentsResponse {
    pub task_type: String,
    pub agents: usize,
}

pub async fn handle_set_agents(
    State(state): State<ApiState>,
    Path(task_type): Path<String>,
    Json(agents): Json<Vec<CandidateAgent>>,
) -> Result<Json<SetAgentsResponse>, (StatusCode, String)> {
    validate_agents(&agents).map_err(bad_request)?;
    let count = agents.len();
    state.node.registry.set_candidates(&task_type, agents);
    tracing::info!(task_type = %task_type, agents = count, "candidate agents updated via API");
    Ok(Json(SetAgentsResponse {
        task_type,
        agents: count,
    }))
}

fn validate_agents(agents: &[CandidateAgent]) -> Result<(), String> {
    for a in agents {
        if a.agent_ref.as_str().is_empty() {
            return Err("agent_ref must not be empty".into());
        }
        for (name, v) in [
            ("capability_score", a.capability_score),
            ("current_load", a.current_load),
            ("failure_rate", a.failure_rate),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{}: {name} must be within 0..=1, got {v}", a.agent_ref));
            }
        }
    }
    Ok(())
}
