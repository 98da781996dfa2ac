//! /tasks and /events handlers.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use edgeline_core::decision::Decision;
use edgeline_core::task::{PriorityClass, Task, TaskId};

use super::{bad_request, submit_error, ApiState};

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub task_type: String,
    pub priority_class: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Hex-encoded opaque payload.
    #[serde(default)]
    pub payload: Option<String>,
}

impl TaskRequest {
    fn into_task(self, state: &ApiState) -> Result<Task, (StatusCode, String)> {
        if self.task_type.is_empty() {
            return Err(bad_request("task_type must not be empty"));
        }
        let priority_class: PriorityClass = self.priority_class.parse().map_err(bad_request)?;
        let payload = match self.payload {
            Some(h) => Bytes::from(hex::decode(&h).map_err(|_| bad_request("payload is not valid hex"))?),
            None => Bytes::new(),
        };
        let id = match self.id {
            Some(id) if !id.is_empty() => TaskId(id),
            _ => state.assign_id(),
        };
        Ok(Task {
            id,
            priority_class,
            task_type: self.task_type,
            context: self.context,
            payload,
        })
    }
}

// ── /tasks (POST) ─────────────────────────────────────────────────────────────

pub async fn handle_submit_task(
    State(state): State<ApiState>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<Decision>, (StatusCode, String)> {
    let task = req.into_task(&state)?;
    let decision = state.node.router.submit(task).await.map_err(submit_error)?;
    Ok(Json(decision))
}

// ── /events (POST) ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventBatch {
    pub tasks: Vec<TaskRequest>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub accepted: usize,
    pub task_ids: Vec<TaskId>,
}

/// Queue a batch for the ingress workers. Decisions are reported through
/// telemetry, not in the response.
pub async fn handle_events(
    State(state): State<ApiState>,
    Json(batch): Json<EventBatch>,
) -> Result<(StatusCode, Json<EventsResponse>), (StatusCode, String)> {
    let tasks = batch
        .tasks
        .into_iter()
        .map(|r| r.into_task(&state))
        .collect::<Result<Vec<_>, _>>()?;

    let mut task_ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        let id = task.id.clone();
        state.events.send(task).await.map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "ingress is shutting down".to_string(),
            )
        })?;
        task_ids.push(id);
    }
    tracing::debug!(accepted = task_ids.len(), "event batch queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(EventsResponse {
            accepted: task_ids.len(),
            task_ids,
        }),
    ))
}
