//! Candidate agent registry commands.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::http::{base_url, get_json, put_json_body};

#[derive(Deserialize)]
struct Agent {
    agent_ref: String,
    capability_score: f64,
    current_load: f64,
    failure_rate: f64,
    health: String,
    location: String,
}

#[derive(Deserialize)]
struct SetAgentsResponse {
    task_type: String,
    agents: usize,
}

pub async fn cmd_agents(port: u16) -> Result<()> {
    let resp: BTreeMap<String, Vec<Agent>> = get_json(&format!("{}/agents", base_url(port))).await?;

    if resp.is_empty() {
        println!("No candidate agents registered.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Candidate Agents");
    println!("═══════════════════════════════════════");
    for (task_type, agents) in &resp {
        println!("  {}", task_type);
        for a in agents {
            println!(
                "    {:<20} score {:.2}  load {:.2}  fail {:.2}  {:<9} {}",
                a.agent_ref, a.capability_score, a.current_load, a.failure_rate, a.health, a.location
            );
        }
    }
    Ok(())
}

/// Replace the candidates for `task_type` with the JSON array in `file`.
pub async fn cmd_agents_set(port: u16, task_type: &str, file: &str) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))?;
    let agents: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", file))?;
    if !agents.is_array() {
        anyhow::bail!("{} must contain a JSON array of agents", file);
    }
    let resp: SetAgentsResponse =
        put_json_body(&format!("{}/agents/{}", base_url(port), task_type), &agents).await?;
    println!("Registered {} agents for '{}'.", resp.agents, resp.task_type);
    Ok(())
}
