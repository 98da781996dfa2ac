//! Tiered decision cache.
//!
//! Three concurrent maps keyed by classification key:
//!   hot:        frequently reused keys, checked first
//!   warm:       ad hoc decisions; promoted to hot after enough hits
//!   predictive: decisions precomputed by the predictor, confirmed against
//!               the live resource snapshot before they are served
//!
//! A key lives in at most one tier. An entry is served only while it is
//! unexpired and its agent's health epoch is unchanged. An entry whose agent
//! the registry no longer knows is corrupt: it is evicted and reported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use edgeline_core::agent::AgentRef;
use edgeline_core::cluster::ReplicatedDecision;
use edgeline_core::config::CacheConfig;
use edgeline_core::decision::{unix_ms, Decision};
use edgeline_core::error::EngineError;
use edgeline_core::task::ClassificationKey;

use crate::agents::AgentRegistry;
use crate::monitor::ResourceMonitor;
use crate::telemetry::{SharedSink, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Predictive,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Predictive => "predictive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub decision: Decision,
    pub tier: Tier,
    pub expires_at: Instant,
    /// Health epoch of the decision's agent at insert time. `None` when the
    /// agent is not tracked by the registry (e.g. a cloud-side executor).
    pub agent_epoch: Option<u64>,
    pub hits: u32,
    pub last_hit: Instant,
}

/// A served cache entry.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub decision: Decision,
    pub tier: Tier,
}

/// One row of `GET /api/cache`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryView {
    pub key: String,
    pub tier: Tier,
    pub route: &'static str,
    pub agent_ref: Option<AgentRef>,
    pub hits: u32,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hot: usize,
    pub warm: usize,
    pub predictive: usize,
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub predictive_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub corruptions: u64,
}

#[derive(Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    predictive_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    corruptions: AtomicU64,
}

enum Verdict {
    Serve(Decision, u32),
    Stale(Staleness),
    Absent,
}

enum Staleness {
    Expired,
    EpochChanged,
    Corrupt(AgentRef),
}

struct Inner {
    hot: DashMap<ClassificationKey, CacheEntry>,
    warm: DashMap<ClassificationKey, CacheEntry>,
    predictive: DashMap<ClassificationKey, CacheEntry>,
    settings: CacheConfig,
    registry: AgentRegistry,
    monitor: ResourceMonitor,
    telemetry: SharedSink,
    counters: Counters,
}

#[derive(Clone)]
pub struct DecisionCache {
    inner: Arc<Inner>,
}

impl DecisionCache {
    pub fn new(
        settings: CacheConfig,
        registry: AgentRegistry,
        monitor: ResourceMonitor,
        telemetry: SharedSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hot: DashMap::new(),
                warm: DashMap::new(),
                predictive: DashMap::new(),
                settings,
                registry,
                monitor,
                telemetry,
                counters: Counters::default(),
            }),
        }
    }

    fn map(&self, tier: Tier) -> &DashMap<ClassificationKey, CacheEntry> {
        match tier {
            Tier::Hot => &self.inner.hot,
            Tier::Warm => &self.inner.warm,
            Tier::Predictive => &self.inner.predictive,
        }
    }

    fn ttl(&self, tier: Tier) -> Duration {
        let s = &self.inner.settings;
        Duration::from_millis(match tier {
            Tier::Hot => s.hot_ttl_ms,
            Tier::Warm => s.warm_ttl_ms,
            Tier::Predictive => s.predictive_ttl_ms,
        })
    }

    fn transition(&self, key: ClassificationKey, from: Tier, to: Option<Tier>, reason: &'static str) {
        tracing::trace!(key = %key, from = from.as_str(), to = to.map(Tier::as_str).unwrap_or("evicted"), reason, "cache tier transition");
        self.inner.telemetry.emit(TelemetryEvent::CacheTierTransition { key, from, to, reason });
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    /// Hot, then warm, then predictive. Never blocks on anything but a
    /// shard lock.
    pub fn lookup(&self, key: &ClassificationKey) -> Option<CacheHit> {
        let now = Instant::now();
        for tier in [Tier::Hot, Tier::Warm, Tier::Predictive] {
            if let Some(hit) = self.probe(tier, key, now) {
                return Some(hit);
            }
        }
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn verdict(&self, tier: Tier, key: &ClassificationKey, now: Instant) -> Verdict {
        // The shard guard is dropped before the caller touches any map.
        let Some(mut entry) = self.map(tier).get_mut(key) else {
            return Verdict::Absent;
        };
        if let Some(stale) = self.staleness(tier, &entry, now) {
            return Verdict::Stale(stale);
        }
        entry.hits = entry.hits.saturating_add(1);
        entry.last_hit = now;
        Verdict::Serve(entry.decision.clone(), entry.hits)
    }

    fn staleness(&self, tier: Tier, entry: &CacheEntry, now: Instant) -> Option<Staleness> {
        if now >= entry.expires_at {
            return Some(Staleness::Expired);
        }
        if let (Some(agent), Some(epoch)) = (&entry.decision.agent_ref, entry.agent_epoch) {
            match self.inner.registry.epoch(agent) {
                None => return Some(Staleness::Corrupt(agent.clone())),
                Some(current) if current != epoch => return Some(Staleness::EpochChanged),
                Some(_) => {}
            }
        }
        if tier == Tier::Predictive && !self.confirm_predictive(entry) {
            return Some(Staleness::EpochChanged);
        }
        None
    }

    /// Predictive entries were computed ahead of time; only serve them if
    /// the node still looks the way it did.
    fn confirm_predictive(&self, entry: &CacheEntry) -> bool {
        let snapshot = self.inner.monitor.snapshot();
        if snapshot.stale || snapshot.saturated {
            return false;
        }
        entry
            .decision
            .agent_ref
            .as_ref()
            .and_then(|a| self.inner.registry.health(a))
            .is_some_and(|h| h.is_available())
    }

    fn probe(&self, tier: Tier, key: &ClassificationKey, now: Instant) -> Option<CacheHit> {
        match self.verdict(tier, key, now) {
            Verdict::Absent => None,
            Verdict::Stale(Staleness::Expired) => {
                self.evict_stale(tier, key, now, "expired");
                None
            }
            Verdict::Stale(Staleness::EpochChanged) => {
                self.evict_stale(tier, key, now, "invalidated");
                None
            }
            Verdict::Stale(Staleness::Corrupt(agent)) => {
                self.evict_stale(tier, key, now, "corrupt");
                self.inner.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                let err = EngineError::CacheCorruption {
                    key: *key,
                    agent: agent.clone(),
                };
                tracing::warn!(kind = err.kind(), "{err}, evicted");
                self.inner
                    .telemetry
                    .emit(TelemetryEvent::CacheCorruption { key: *key, agent });
                None
            }
            Verdict::Serve(decision, hits) => {
                self.after_hit(tier, key, hits, now);
                Some(CacheHit { decision, tier })
            }
        }
    }

    fn after_hit(&self, tier: Tier, key: &ClassificationKey, hits: u32, now: Instant) {
        let c = &self.inner.counters;
        match tier {
            Tier::Hot => {
                c.hot_hits.fetch_add(1, Ordering::Relaxed);
            }
            Tier::Warm => {
                c.warm_hits.fetch_add(1, Ordering::Relaxed);
                if hits >= self.inner.settings.promote_after_hits {
                    self.move_entry(key, Tier::Warm, Tier::Hot, None, "promoted");
                }
            }
            Tier::Predictive => {
                c.predictive_hits.fetch_add(1, Ordering::Relaxed);
                // Confirmed: it now lives as an ordinary warm entry.
                let expires_at = now + self.ttl(Tier::Warm);
                self.move_entry(key, Tier::Predictive, Tier::Warm, Some(expires_at), "confirmed");
            }
        }
    }

    fn move_entry(
        &self,
        key: &ClassificationKey,
        from: Tier,
        to: Tier,
        expires_at: Option<Instant>,
        reason: &'static str,
    ) {
        if let Some((k, mut entry)) = self.map(from).remove(key) {
            entry.tier = to;
            if let Some(at) = expires_at {
                entry.expires_at = at;
                entry.decision.valid_until_ms = Some(unix_ms() + self.ttl(to).as_millis() as u64);
            }
            self.map(to).insert(k, entry);
            self.transition(k, from, Some(to), reason);
        }
    }

    fn evict(&self, tier: Tier, key: &ClassificationKey, reason: &'static str) {
        self.evict_if(tier, key, reason, |_| true);
    }

    /// Evict `key` only if the entry there is still stale. A writer may have
    /// replaced it since the verdict was taken.
    fn evict_stale(&self, tier: Tier, key: &ClassificationKey, now: Instant, reason: &'static str) {
        self.evict_if(tier, key, reason, |e| self.staleness(tier, e, now).is_some());
    }

    fn evict_if(
        &self,
        tier: Tier,
        key: &ClassificationKey,
        reason: &'static str,
        still_due: impl FnOnce(&CacheEntry) -> bool,
    ) {
        if self.map(tier).remove_if(key, |_, e| still_due(e)).is_some() {
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.transition(*key, tier, None, reason);
        }
    }

    // ── Insert ───────────────────────────────────────────────────────────────

    /// Store a decision. Returns it stamped with `valid_until_ms`. Expired
    /// decisions are never stored and are returned unchanged.
    pub fn insert(&self, key: ClassificationKey, decision: Decision, tier: Tier) -> Decision {
        self.insert_with_ttl(key, decision, tier, self.ttl(tier))
    }

    fn insert_with_ttl(
        &self,
        key: ClassificationKey,
        mut decision: Decision,
        tier: Tier,
        ttl: Duration,
    ) -> Decision {
        if decision.is_expired() || ttl.is_zero() {
            return decision;
        }
        let now = Instant::now();
        decision.valid_until_ms = Some(unix_ms() + ttl.as_millis() as u64);
        let agent_epoch = decision
            .agent_ref
            .as_ref()
            .and_then(|a| self.inner.registry.epoch(a));

        for other in [Tier::Hot, Tier::Warm, Tier::Predictive] {
            if other != tier {
                self.map(other).remove(&key);
            }
        }
        self.map(tier).insert(
            key,
            CacheEntry {
                decision: decision.clone(),
                tier,
                expires_at: now + ttl,
                agent_epoch,
                hits: 0,
                last_hit: now,
            },
        );
        decision
    }

    /// Store a precomputed decision unless the key is already cached.
    pub fn insert_predictive(&self, key: ClassificationKey, decision: Decision) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.insert(key, decision, Tier::Predictive);
        true
    }

    pub fn contains(&self, key: &ClassificationKey) -> bool {
        self.inner.hot.contains_key(key)
            || self.inner.warm.contains_key(key)
            || self.inner.predictive.contains_key(key)
    }

    // ── Replication ──────────────────────────────────────────────────────────

    /// Hot-tier decisions with their remaining validity, for `StateSync`.
    pub fn hot_snapshot(&self) -> Vec<ReplicatedDecision> {
        let now = Instant::now();
        self.inner
            .hot
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| ReplicatedDecision {
                key: *e.key(),
                decision: e.decision.clone(),
                ttl_ms: e.expires_at.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }

    /// Warm the cache from a primary's snapshot. Returns how many were kept.
    pub fn apply_replicated(&self, entries: Vec<ReplicatedDecision>) -> usize {
        let mut applied = 0;
        for r in entries {
            if self.contains(&r.key) || r.ttl_ms == 0 {
                continue;
            }
            self.insert_with_ttl(r.key, r.decision, Tier::Warm, Duration::from_millis(r.ttl_ms));
            applied += 1;
        }
        applied
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Expire entries, demote idle hot entries, enforce capacities.
    pub fn sweep(&self) {
        let now = Instant::now();
        for tier in [Tier::Hot, Tier::Warm, Tier::Predictive] {
            let expired: Vec<ClassificationKey> = self
                .map(tier)
                .iter()
                .filter(|e| now >= e.expires_at)
                .map(|e| *e.key())
                .collect();
            for key in expired {
                self.evict_if(tier, &key, "expired", |e| now >= e.expires_at);
            }
        }

        let idle = Duration::from_millis(self.inner.settings.hot_idle_ms);
        let idle_keys: Vec<ClassificationKey> = self
            .inner
            .hot
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_hit) >= idle)
            .map(|e| *e.key())
            .collect();
        for key in idle_keys {
            self.move_entry(&key, Tier::Hot, Tier::Warm, None, "idle");
        }

        let s = &self.inner.settings;
        self.enforce_capacity(Tier::Hot, s.hot_capacity);
        self.enforce_capacity(Tier::Warm, s.warm_capacity);
        self.enforce_capacity(Tier::Predictive, s.predictive_capacity);
    }

    fn enforce_capacity(&self, tier: Tier, capacity: usize) {
        let map = self.map(tier);
        let excess = map.len().saturating_sub(capacity);
        if excess == 0 {
            return;
        }
        let mut ranked: Vec<(u32, Instant, ClassificationKey)> = map
            .iter()
            .map(|e| (e.hits, e.last_hit, *e.key()))
            .collect();
        ranked.sort();
        for (_, _, key) in ranked.into_iter().take(excess) {
            self.evict(tier, &key, "capacity");
        }
    }

    pub fn clear(&self) -> usize {
        let n = self.inner.hot.len() + self.inner.warm.len() + self.inner.predictive.len();
        self.inner.hot.clear();
        self.inner.warm.clear();
        self.inner.predictive.clear();
        tracing::info!(entries = n, "decision cache cleared");
        n
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hot: self.inner.hot.len(),
            warm: self.inner.warm.len(),
            predictive: self.inner.predictive.len(),
            hot_hits: c.hot_hits.load(Ordering::Relaxed),
            warm_hits: c.warm_hits.load(Ordering::Relaxed),
            predictive_hits: c.predictive_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            corruptions: c.corruptions.load(Ordering::Relaxed),
        }
    }

    pub fn entries(&self) -> Vec<CacheEntryView> {
        let now = Instant::now();
        let mut out = Vec::new();
        for tier in [Tier::Hot, Tier::Warm, Tier::Predictive] {
            for e in self.map(tier).iter() {
                out.push(CacheEntryView {
                    key: e.key().to_hex(),
                    tier,
                    route: e.decision.route.as_str(),
                    agent_ref: e.decision.agent_ref.clone(),
                    hits: e.hits,
                    ttl_ms: e.expires_at.saturating_duration_since(now).as_millis() as u64,
                });
            }
        }
        out
    }

    pub fn tier_of(&self, key: &ClassificationKey) -> Option<Tier> {
        [Tier::Hot, Tier::Warm, Tier::Predictive]
            .into_iter()
            .find(|t| self.map(*t).contains_key(key))
    }
}
