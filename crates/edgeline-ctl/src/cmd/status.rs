//! Node status, cache, connectivity and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    node_id: String,
    role: String,
    epoch: u64,
    connectivity: ConnectivityInfo,
    resources: ResourceInfo,
    router: RouterInfo,
    cache: CacheStats,
    agents: usize,
}

#[derive(Deserialize)]
struct ConnectivityInfo {
    mode: String,
    disconnected_since_ms: Option<u64>,
    pending_sync: usize,
    dropped_sync: u64,
}

#[derive(Deserialize)]
struct ResourceInfo {
    cpu_utilization: f64,
    memory_utilization: f64,
    network_rtt_ms: Option<u64>,
    stale: bool,
    saturated: bool,
}

#[derive(Deserialize)]
struct RouterInfo {
    classes: Vec<ClassLatency>,
    by_cache: u64,
    by_router: u64,
    by_manager: u64,
    by_fallback: u64,
    rejected: u64,
}

#[derive(Deserialize)]
struct ClassLatency {
    priority_class: String,
    budget_us: u64,
    decisions: u64,
    expired: u64,
    mean_ns: u64,
    max_ns: u64,
}

#[derive(Deserialize)]
struct CacheStats {
    hot: usize,
    warm: usize,
    predictive: usize,
    hot_hits: u64,
    warm_hits: u64,
    predictive_hits: u64,
    misses: u64,
    evictions: u64,
    corruptions: u64,
}

#[derive(Deserialize)]
struct CacheResponse {
    stats: CacheStats,
    entries: Vec<CacheEntry>,
}

#[derive(Deserialize)]
struct CacheEntry {
    key: String,
    tier: String,
    route: String,
    agent_ref: Option<String>,
    hits: u32,
    ttl_ms: u64,
}

#[derive(Deserialize)]
struct ClearResponse {
    cleared: usize,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Edgeline Node Status");
    println!("═══════════════════════════════════════");
    println!("  Node          : {}", resp.node_id);
    println!("  Role          : {} (epoch {})", resp.role, resp.epoch);
    println!("  Connectivity  : {}", resp.connectivity.mode);
    println!("  Pending sync  : {}", resp.connectivity.pending_sync);
    println!("  Agents        : {}", resp.agents);
    println!(
        "  CPU / memory  : {:.0}% / {:.0}%{}{}",
        resp.resources.cpu_utilization * 100.0,
        resp.resources.memory_utilization * 100.0,
        if resp.resources.saturated { "  SATURATED" } else { "" },
        if resp.resources.stale { "  (stale)" } else { "" },
    );
    if let Some(rtt) = resp.resources.network_rtt_ms {
        println!("  Cloud RTT     : {} ms", rtt);
    }

    let r = &resp.router;
    println!("\n  Decisions:");
    println!(
        "  cache {}  router {}  manager {}  fallback {}  rejected {}",
        r.by_cache, r.by_router, r.by_manager, r.by_fallback, r.rejected
    );
    for c in &r.classes {
        println!("  ┌─ {}", c.priority_class);
        println!("  │  budget   : {} µs", c.budget_us);
        println!("  │  decided  : {} ({} expired)", c.decisions, c.expired);
        println!("  └─ latency  : mean {} ns, max {} ns", c.mean_ns, c.max_ns);
    }

    println!(
        "\n  Cache: {} hot, {} warm, {} predictive",
        resp.cache.hot, resp.cache.warm, resp.cache.predictive
    );
    Ok(())
}

pub async fn cmd_cache(port: u16) -> Result<()> {
    let resp: CacheResponse = get_json(&format!("{}/cache", base_url(port))).await?;
    let s = &resp.stats;

    println!("═══════════════════════════════════════");
    println!("  Decision Cache");
    println!("═══════════════════════════════════════");
    println!("  Entries     : {} hot / {} warm / {} predictive", s.hot, s.warm, s.predictive);
    println!("  Hits        : {} hot / {} warm / {} predictive", s.hot_hits, s.warm_hits, s.predictive_hits);
    println!("  Misses      : {}", s.misses);
    println!("  Evictions   : {} ({} corrupt)", s.evictions, s.corruptions);

    if !resp.entries.is_empty() {
        println!();
        for e in &resp.entries {
            println!(
                "  {}  {:<10} {:<28} {:<12} hits {:>4}  ttl {} ms",
                &e.key[..16.min(e.key.len())],
                e.tier,
                e.route,
                e.agent_ref.as_deref().unwrap_or("-"),
                e.hits,
                e.ttl_ms
            );
        }
    }
    Ok(())
}

pub async fn cmd_cache_clear(port: u16) -> Result<()> {
    let resp: ClearResponse = post_json(&format!("{}/cache/clear", base_url(port))).await?;
    println!("Cleared {} decisions from cache.", resp.cleared);
    Ok(())
}

pub async fn cmd_connectivity(port: u16) -> Result<()> {
    let resp: ConnectivityInfo = get_json(&format!("{}/connectivity", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Connectivity");
    println!("═══════════════════════════════════════");
    println!("  Mode          : {}", resp.mode);
    match resp.disconnected_since_ms {
        Some(ms) => println!("  Disconnected  : since {} (unix ms)", ms),
        None => println!("  Disconnected  : -"),
    }
    println!("  Pending sync  : {}", resp.pending_sync);
    println!("  Dropped sync  : {}", resp.dropped_sync);
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
