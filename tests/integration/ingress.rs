//! Stream ingestion: one terminal decision per unique task id.

use std::collections::HashMap;

use tokio::sync::mpsc;

use edgeline_core::task::PriorityClass;
use edgeline_engine::ingress::{run_stream, IngressReply};
use edgeline_engine::SubmitError;

use crate::*;

async fn stream(h: &Harness, ids: &[String], workers: usize) -> Vec<IngressReply> {
    let (task_tx, task_rx) = mpsc::channel(8);
    let (reply_tx, mut reply_rx) = mpsc::channel(ids.len().max(1));
    let pool = tokio::spawn(run_stream(h.node.router.clone(), task_rx, reply_tx, workers));
    for (i, id) in ids.iter().enumerate() {
        let class = PriorityClass::ALL[i % PriorityClass::ALL.len()];
        task_tx.send(task(id, class)).await.unwrap();
    }
    drop(task_tx);
    pool.await.unwrap();

    let mut replies = Vec::new();
    while let Some(r) = reply_rx.recv().await {
        replies.push(r);
    }
    replies
}

#[tokio::test]
async fn unique_ids_each_get_one_decision() {
    let h = harness();
    let ids: Vec<String> = (0..200).map(|i| format!("s-{i}")).collect();
    let replies = stream(&h, &ids, 8).await;

    assert_eq!(replies.len(), 200);
    for id in &ids {
        assert_eq!(decisions_for(&h.sink, id), 1, "{id}");
    }
    assert!(replies.iter().all(|r| r.result.is_ok()));
}

#[tokio::test]
async fn duplicate_ids_never_produce_a_second_decision() {
    let h = harness();
    // Every id appears three times in the stream.
    let ids: Vec<String> = (0..30)
        .flat_map(|i| std::iter::repeat(format!("d-{i}")).take(3))
        .collect();
    let replies = stream(&h, &ids, 4).await;
    assert_eq!(replies.len(), 90);

    let mut by_id: HashMap<String, Vec<_>> = HashMap::new();
    for r in replies {
        by_id.entry(r.task_id.as_str().to_string()).or_default().push(r.result);
    }
    assert_eq!(by_id.len(), 30);
    for (id, results) in by_id {
        assert_eq!(decisions_for(&h.sink, &id), 1, "{id}");
        let decided: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert!(!decided.is_empty(), "{id} was never decided");
        // Replays are identical to the original terminal decision.
        assert!(decided.windows(2).all(|w| w[0] == w[1]), "{id}");
        for r in &results {
            if let Err(e) = r {
                assert_eq!(e, &SubmitError::InFlight(id.as_str().into()));
            }
        }
    }
}
