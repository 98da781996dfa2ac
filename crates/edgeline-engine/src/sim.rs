//! Simulated collaborators for tests and local experiments.
//!
//! `SimulatedRemote` is a scriptable stand-in for the cloud: reachability,
//! latency, verdicts and sync acknowledgements can be changed while the
//! engine runs. All waiting goes through `tokio::time`, so paused-clock
//! tests stay deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use edgeline_core::agent::AgentRef;
use edgeline_core::decision::Route;
use edgeline_core::task::Task;

use crate::remote::{RemoteDecisionService, RemoteError, RemoteVerdict, SyncAck, SyncRecord};

#[derive(Debug, Clone)]
struct Script {
    reachable: bool,
    latency: Duration,
    verdict: RemoteVerdict,
    /// Acknowledge at most this many records per batch.
    ack_limit: Option<usize>,
    fail_sync: bool,
}

#[derive(Default)]
struct Calls {
    decide: AtomicU64,
    heartbeat: AtomicU64,
    sync: AtomicU64,
}

#[derive(Clone)]
pub struct SimulatedRemote {
    script: Arc<Mutex<Script>>,
    synced: Arc<Mutex<Vec<SyncRecord>>>,
    calls: Arc<Calls>,
}

impl SimulatedRemote {
    /// Reachable, 1ms latency, keeps every task (`route = Remote`) on
    /// `cloud-planner`.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                reachable: true,
                latency: Duration::from_millis(1),
                verdict: RemoteVerdict {
                    route: Route::Remote,
                    agent_ref: Some(AgentRef::from("cloud-planner")),
                },
                ack_limit: None,
                fail_sync: false,
            })),
            synced: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Calls::default()),
        }
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) {
        if let Ok(mut s) = self.script.lock() {
            f(&mut s);
        }
    }

    fn script(&self) -> Option<Script> {
        self.script.lock().ok().map(|s| s.clone())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.edit(|s| s.reachable = reachable);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.edit(|s| s.latency = latency);
    }

    pub fn set_verdict(&self, route: Route, agent: Option<&str>) {
        self.edit(|s| {
            s.verdict = RemoteVerdict {
                route,
                agent_ref: agent.map(AgentRef::from),
            }
        });
    }

    pub fn set_ack_limit(&self, limit: Option<usize>) {
        self.edit(|s| s.ack_limit = limit);
    }

    pub fn set_fail_sync(&self, fail: bool) {
        self.edit(|s| s.fail_sync = fail);
    }

    /// Every record acknowledged so far, in arrival order.
    pub fn synced(&self) -> Vec<SyncRecord> {
        self.synced.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn decide_calls(&self) -> u64 {
        self.calls.decide.load(Ordering::Relaxed)
    }

    pub fn heartbeat_calls(&self) -> u64 {
        self.calls.heartbeat.load(Ordering::Relaxed)
    }

    pub fn sync_calls(&self) -> u64 {
        self.calls.sync.load(Ordering::Relaxed)
    }

    async fn reach(&self) -> Result<Script, RemoteError> {
        let script = self
            .script()
            .ok_or_else(|| RemoteError::Unreachable("script lock poisoned".into()))?;
        if !script.reachable {
            return Err(RemoteError::Unreachable("simulated partition".into()));
        }
        tokio::time::sleep(script.latency).await;
        Ok(script)
    }
}

impl Default for SimulatedRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteDecisionService for SimulatedRemote {
    async fn remote_decide(&self, _task: &Task, _timeout: Duration) -> Result<RemoteVerdict, RemoteError> {
        self.calls.decide.fetch_add(1, Ordering::Relaxed);
        Ok(self.reach().await?.verdict)
    }

    async fn heartbeat(&self) -> Result<Duration, RemoteError> {
        self.calls.heartbeat.fetch_add(1, Ordering::Relaxed);
        Ok(self.reach().await?.latency)
    }

    async fn submit_sync_batch(&self, records: &[SyncRecord]) -> Result<SyncAck, RemoteError> {
        self.calls.sync.fetch_add(1, Ordering::Relaxed);
        let script = self.reach().await?;
        if script.fail_sync {
            return Err(RemoteError::Rejected("simulated sync failure".into()));
        }
        let take = script.ack_limit.unwrap_or(records.len()).min(records.len());
        let accepted = &records[..take];
        if let Ok(mut synced) = self.synced.lock() {
            synced.extend_from_slice(accepted);
        }
        Ok(SyncAck {
            acked_through: accepted.last().map(|r| r.seq).unwrap_or(0),
        })
    }
}
