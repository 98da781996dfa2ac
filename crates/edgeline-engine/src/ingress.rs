//! Ingress worker pool: feeds a stream of tasks through the router with
//! bounded concurrency and sends one reply per task.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use edgeline_core::decision::Decision;
use edgeline_core::task::{Task, TaskId};

use crate::router::{Router, SubmitError};

#[derive(Debug, Clone)]
pub struct IngressReply {
    pub task_id: TaskId,
    pub result: Result<Decision, SubmitError>,
}

/// Resolve a configured worker count. 0 means one per available core.
pub fn worker_count(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        configured
    }
}

/// Route every task from `tasks` until the channel closes, at most
/// `max_concurrent` at a time. Returns after the last reply is sent.
pub async fn run_stream(
    router: Router,
    mut tasks: mpsc::Receiver<Task>,
    replies: mpsc::Sender<IngressReply>,
    max_concurrent: usize,
) {
    let max_concurrent = max_concurrent.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    tracing::info!(max_concurrent, "ingress started");

    let mut accepted = 0u64;
    while let Some(task) = tasks.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        accepted += 1;

        let router = router.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let task_id = task.id.clone();
            let result = router.submit(task).await;
            if let Err(e) = &result {
                tracing::debug!(task_id = %task_id, error = %e, "task rejected");
            }
            // A dropped reply receiver just means nobody is listening.
            let _ = replies.send(IngressReply { task_id, result }).await;
            drop(permit);
        });
    }

    // Wait for in-flight tasks by taking back every permit.
    let _ = semaphore.acquire_many(max_concurrent as u32).await;
    tracing::info!(accepted, "ingress drained");
}
