//! Cluster view.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct ClusterView {
    node_id: String,
    role: String,
    epoch: u64,
    primary: Option<String>,
    peers: Vec<PeerView>,
}

#[derive(Deserialize)]
struct PeerView {
    node_id: String,
    role: String,
    epoch: u64,
    health_pct: u8,
    alive: bool,
    last_seen_ms: u64,
}

pub async fn cmd_cluster(port: u16) -> Result<()> {
    let view: ClusterView = get_json(&format!("{}/cluster", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Cluster");
    println!("═══════════════════════════════════════");
    println!("  This node : {} ({})", view.node_id, view.role);
    println!("  Epoch     : {}", view.epoch);
    println!("  Primary   : {}", view.primary.as_deref().unwrap_or("none"));

    if view.peers.is_empty() {
        println!("\n  No peers heard from.");
        return Ok(());
    }
    println!("\n  Peers:");
    for p in &view.peers {
        println!("  ┌─ {}", p.node_id);
        println!("  │  role      : {} (epoch {})", p.role, p.epoch);
        println!("  │  health    : {}%", p.health_pct);
        println!("  └─ last seen : {} ms ago{}", p.last_seen_ms, if p.alive { "" } else { "  (down)" });
    }
    Ok(())
}
