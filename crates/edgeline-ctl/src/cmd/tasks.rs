//! Task submission.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{base_url, post_json_body};

#[derive(Serialize)]
struct TaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    task_type: String,
    priority_class: String,
    context: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Decision {
    task_id: String,
    priority_class: String,
    route: String,
    agent_ref: Option<String>,
    decision_latency_ns: u64,
    produced_by: String,
}

/// Parse trailing `key=value` arguments into a task context.
pub fn parse_context(args: &[&str]) -> Result<BTreeMap<String, String>> {
    args.iter()
        .map(|a| {
            let (k, v) = a
                .split_once('=')
                .with_context(|| format!("expected key=value, got '{}'", a))?;
            if k.is_empty() {
                anyhow::bail!("empty context key in '{}'", a);
            }
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}

pub async fn cmd_submit(
    port: u16,
    task_type: &str,
    class: &str,
    id: Option<String>,
    context_args: &[&str],
) -> Result<()> {
    let req = TaskRequest {
        id,
        task_type: task_type.to_string(),
        priority_class: class.to_string(),
        context: parse_context(context_args)?,
    };
    let d: Decision = post_json_body(&format!("{}/tasks", base_url(port)), &req).await?;

    println!("═══════════════════════════════════════");
    println!("  Decision for {}", d.task_id);
    println!("═══════════════════════════════════════");
    println!("  Class        : {}", d.priority_class);
    println!("  Route        : {}", d.route);
    println!("  Agent        : {}", d.agent_ref.as_deref().unwrap_or("-"));
    println!("  Produced by  : {}", d.produced_by);
    println!("  Latency      : {:.1} µs", d.decision_latency_ns as f64 / 1000.0);
    Ok(())
}
