//! HTTP client for the cloud orchestrator.
//!
//!   POST {endpoint}/decide     {task, timeout_ms} → RemoteVerdict
//!   GET  {endpoint}/heartbeat                      → 2xx
//!   POST {endpoint}/sync       {records}           → SyncAck

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use edgeline_core::task::Task;
use edgeline_engine::remote::{RemoteDecisionService, RemoteError, RemoteVerdict, SyncAck, SyncRecord};

pub struct HttpRemote {
    base: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    task: &'a Task,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct SyncRequest<'a> {
    records: &'a [SyncRecord],
}

impl HttpRemote {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, RemoteError> {
        let resp = self
            .client
            .post(self.url(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::Rejected(format!("{path} returned {status}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Rejected(format!("{path}: bad response body: {e}")))
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(timeout)
    } else if e.is_connect() || e.is_request() {
        RemoteError::Unreachable(e.to_string())
    } else {
        RemoteError::Rejected(e.to_string())
    }
}

#[async_trait]
impl RemoteDecisionService for HttpRemote {
    async fn remote_decide(&self, task: &Task, timeout: Duration) -> Result<RemoteVerdict, RemoteError> {
        let body = DecideRequest {
            task,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.post_json("/decide", &body, timeout).await
    }

    async fn heartbeat(&self) -> Result<Duration, RemoteError> {
        let start = Instant::now();
        let resp = self
            .client
            .get(self.url("/heartbeat"))
            .send()
            .await
            .map_err(|e| classify(e, self.request_timeout))?;
        if !resp.status().is_success() {
            return Err(RemoteError::Rejected(format!("/heartbeat returned {}", resp.status())));
        }
        Ok(start.elapsed())
    }

    async fn submit_sync_batch(&self, records: &[SyncRecord]) -> Result<SyncAck, RemoteError> {
        self.post_json("/sync", &SyncRequest { records }, self.request_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::routing::{get, post};
    use axum::{Json, Router};
    use edgeline_core::decision::Route;
    use edgeline_core::task::PriorityClass;

    async fn mock_cloud() -> String {
        async fn decide(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            assert!(body["timeout_ms"].as_u64().is_some());
            Json(serde_json::json!({ "route": "remote", "agent_ref": "planner-1" }))
        }
        async fn sync(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            let last = body["records"]
                .as_array()
                .and_then(|r| r.last())
                .and_then(|r| r["seq"].as_u64())
                .unwrap_or(0);
            Json(serde_json::json!({ "acked_through": last }))
        }
        let app = Router::new()
            .route("/decide", post(decide))
            .route("/heartbeat", get(|| async { "ok" }))
            .route("/sync", post(sync));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn talks_to_cloud() {
        let remote = HttpRemote::new(&mock_cloud().await, Duration::from_secs(2)).unwrap();
        let task = Task::new("t-1", "pick", PriorityClass::Standard);
        let verdict = remote.remote_decide(&task, Duration::from_secs(1)).await.unwrap();
        assert_eq!(verdict.route, Route::Remote);
        assert_eq!(verdict.agent_ref.unwrap().as_str(), "planner-1");
        assert!(remote.heartbeat().await.is_ok());
        let ack = remote.submit_sync_batch(&[]).await.unwrap();
        assert_eq!(ack.acked_through, 0);
    }

    #[tokio::test]
    async fn missing_route_is_rejected() {
        let base = mock_cloud().await;
        let remote = HttpRemote::new(&format!("{base}nope"), Duration::from_secs(2)).unwrap();
        let err = remote.heartbeat().await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let remote = HttpRemote::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = remote.heartbeat().await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_) | RemoteError::Timeout(_)));
    }
}
