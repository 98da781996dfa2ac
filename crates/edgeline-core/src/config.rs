//! Configuration system for Edgeline.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $EDGELINE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/edgeline/config.toml
//!   3. ~/.config/edgeline/config.toml
//!
//! Latency budgets are special: if a `[budgets]` table is present it must
//! name every priority class. A node never runs with an undefined budget,
//! so `validate()` rejects the config and the daemon refuses to start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::CandidateAgent;
use crate::cluster::{NodeId, NodeRole};
use crate::task::PriorityClass;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgelineConfig {
    pub node: NodeConfig,
    pub budgets: BudgetConfig,
    pub cache: CacheConfig,
    pub predictor: PredictorConfig,
    pub monitor: MonitorConfig,
    pub remote: RemoteConfig,
    pub autonomy: AutonomyConfig,
    pub cluster: ClusterConfig,
    pub api: ApiConfig,
    pub ingress: IngressConfig,
    /// Seed entries for the candidate agent registry.
    pub agents: Vec<AgentSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique within the cluster, at most 32 bytes.
    pub node_id: String,
    /// Physical zone this node covers. Informational.
    pub zone: String,
}

/// Per-class decision budgets in microseconds.
///
/// No struct-level `#[serde(default)]`: a present `[budgets]` table with a
/// missing key deserializes to `None` and fails validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub safety_critical_us: Option<u64>,
    #[serde(default)]
    pub quality_critical_us: Option<u64>,
    #[serde(default)]
    pub efficiency_critical_us: Option<u64>,
    #[serde(default)]
    pub standard_us: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub hot_ttl_ms: u64,
    pub warm_ttl_ms: u64,
    pub predictive_ttl_ms: u64,
    /// Warm hits before an entry moves to hot.
    pub promote_after_hits: u32,
    /// Recent sightings of a key (predictor window) that send a fresh
    /// decision straight to hot.
    pub hot_reuse_threshold: u32,
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    pub predictive_capacity: usize,
    pub sweep_interval_ms: u64,
    /// Hot entries without a hit for this long are demoted to warm.
    pub hot_idle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub enabled: bool,
    /// How many recent classification keys the frequency model remembers.
    pub window: usize,
    /// Successor keys precomputed after each observation.
    pub prefetch_top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Snapshots older than this are reported stale.
    pub stale_after_ms: u64,
    /// CPU or memory utilization at which the node counts as saturated.
    pub saturation_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the cloud decision service. Empty = offline.
    pub endpoint: String,
    /// Timeout for heartbeat and reconciliation requests.
    pub request_timeout_ms: u64,
    /// Timeout for background validation dispatches.
    pub validation_timeout_ms: u64,
    /// Budget held back from a remote dispatch so a local fallback still fits.
    pub fallback_reserve_us: u64,
    /// Below this remaining budget a remote round trip is not attempted.
    pub min_remote_slack_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    pub heartbeat_interval_ms: u64,
    /// Consecutive heartbeat failures that switch the node to Autonomous.
    pub failure_threshold: u32,
    /// The failures must fall within this window.
    pub failure_window_ms: u64,
    pub sync_batch_size: usize,
    /// Upper bound on the pending sync log.
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Disabled = single node, always Primary.
    pub enabled: bool,
    /// Network interface for multicast gossip.
    pub interface: String,
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    /// Missed intervals before a peer is suspected down.
    pub suspect_after_missed: u32,
    pub initial_role: NodeRole,
    /// Replicate hot-tier decisions every N heartbeats (primary only).
    pub state_sync_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Concurrent stream workers. 0 = available parallelism.
    pub workers: usize,
    pub queue_depth: usize,
    /// How long terminal decisions are remembered for duplicate detection.
    pub ledger_retention_ms: u64,
}

/// One registry seed: `[[agents]]` with a `task_type` and agent fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSeed {
    pub task_type: String,
    #[serde(flatten)]
    pub agent: CandidateAgent,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for EdgelineConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            budgets: BudgetConfig::default(),
            cache: CacheConfig::default(),
            predictor: PredictorConfig::default(),
            monitor: MonitorConfig::default(),
            remote: RemoteConfig::default(),
            autonomy: AutonomyConfig::default(),
            cluster: ClusterConfig::default(),
            api: ApiConfig::default(),
            ingress: IngressConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "edge-1".to_string(),
            zone: String::new(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let us = |c: PriorityClass| Some(c.ceiling().as_micros() as u64);
        Self {
            safety_critical_us: us(PriorityClass::SafetyCritical),
            quality_critical_us: us(PriorityClass::QualityCritical),
            efficiency_critical_us: us(PriorityClass::EfficiencyCritical),
            standard_us: us(PriorityClass::Standard),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_ttl_ms: 2_000,
            warm_ttl_ms: 10_000,
            predictive_ttl_ms: 1_000,
            promote_after_hits: 3,
            hot_reuse_threshold: 3,
            hot_capacity: 4_096,
            warm_capacity: 16_384,
            predictive_capacity: 1_024,
            sweep_interval_ms: 250,
            hot_idle_ms: 1_000,
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 256,
            prefetch_top_k: 4,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 50,
            stale_after_ms: 100,
            saturation_threshold: 0.9,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            request_timeout_ms: 2_000,
            validation_timeout_ms: 2_000,
            fallback_reserve_us: 250,
            min_remote_slack_ms: 5,
        }
    }
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            failure_threshold: 3,
            failure_window_ms: 5_000,
            sync_batch_size: 64,
            max_pending: 100_000,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: String::new(),
            port: 9100,
            heartbeat_interval_ms: 20,
            suspect_after_missed: 2,
            initial_role: NodeRole::Primary,
            state_sync_every: 25,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9101 }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: 1_024,
            ledger_retention_ms: 60_000,
        }
    }
}

// ── Validated budgets ─────────────────────────────────────────────────────────

/// Checked per-class budgets. Only obtainable through validation, so every
/// holder has a budget for every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyBudgets {
    per_class: [Duration; 4],
}

impl LatencyBudgets {
    pub fn budget(&self, class: PriorityClass) -> Duration {
        self.per_class[class.index()]
    }

    /// The hard ceilings: 1ms / 10ms / 100ms / 500ms.
    pub fn ceilings() -> Self {
        Self {
            per_class: PriorityClass::ALL.map(PriorityClass::ceiling),
        }
    }
}

impl Default for LatencyBudgets {
    fn default() -> Self {
        Self::ceilings()
    }
}

impl BudgetConfig {
    fn get(&self, class: PriorityClass) -> Option<u64> {
        match class {
            PriorityClass::SafetyCritical => self.safety_critical_us,
            PriorityClass::QualityCritical => self.quality_critical_us,
            PriorityClass::EfficiencyCritical => self.efficiency_critical_us,
            PriorityClass::Standard => self.standard_us,
        }
    }

    fn slot(&mut self, class: PriorityClass) -> &mut Option<u64> {
        match class {
            PriorityClass::SafetyCritical => &mut self.safety_critical_us,
            PriorityClass::QualityCritical => &mut self.quality_critical_us,
            PriorityClass::EfficiencyCritical => &mut self.efficiency_critical_us,
            PriorityClass::Standard => &mut self.standard_us,
        }
    }

    /// Validate and convert. Every class must be present, non-zero, and
    /// within its ceiling.
    pub fn resolve(&self) -> Result<LatencyBudgets, ConfigError> {
        let mut per_class = [Duration::ZERO; 4];
        for class in PriorityClass::ALL {
            let us = self.get(class).ok_or(ConfigError::MissingBudget(class))?;
            if us == 0 {
                return Err(ConfigError::ZeroBudget(class));
            }
            let ceiling_us = class.ceiling().as_micros() as u64;
            if us > ceiling_us {
                return Err(ConfigError::BudgetAboveCeiling {
                    class,
                    configured_us: us,
                    ceiling_us,
                });
            }
            per_class[class.index()] = Duration::from_micros(us);
        }
        Ok(LatencyBudgets { per_class })
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("edgeline")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("no latency budget configured for {0}")]
    MissingBudget(PriorityClass),
    #[error("latency budget for {0} is zero")]
    ZeroBudget(PriorityClass),
    #[error("latency budget for {class} is {configured_us}us, above the {ceiling_us}us ceiling")]
    BudgetAboveCeiling {
        class: PriorityClass,
        configured_us: u64,
        ceiling_us: u64,
    },
    #[error("invalid node id '{0}': must be 1..=32 bytes without NUL")]
    InvalidNodeId(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EdgelineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from a specific file without env overrides. Missing file = defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::from_toml_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("EDGELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EdgelineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Check everything the engine relies on. The daemon calls this once at
    /// startup and exits on error.
    pub fn validate(&self) -> Result<LatencyBudgets, ConfigError> {
        let budgets = self.budgets.resolve()?;

        if !self.node_id().is_valid() {
            return Err(ConfigError::InvalidNodeId(self.node.node_id.clone()));
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(invalid("monitor.sample_interval_ms", "must be non-zero"));
        }
        if self.monitor.stale_after_ms < self.monitor.sample_interval_ms {
            return Err(invalid(
                "monitor.stale_after_ms",
                "must be at least monitor.sample_interval_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.saturation_threshold) {
            return Err(invalid("monitor.saturation_threshold", "must be within 0..=1"));
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err(invalid("cache.sweep_interval_ms", "must be non-zero"));
        }
        if self.cache.promote_after_hits == 0 {
            return Err(invalid("cache.promote_after_hits", "must be non-zero"));
        }
        if self.autonomy.heartbeat_interval_ms == 0 {
            return Err(invalid("autonomy.heartbeat_interval_ms", "must be non-zero"));
        }
        if self.autonomy.failure_threshold == 0 {
            return Err(invalid("autonomy.failure_threshold", "must be non-zero"));
        }
        if self.autonomy.sync_batch_size == 0 {
            return Err(invalid("autonomy.sync_batch_size", "must be non-zero"));
        }
        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(invalid("cluster.heartbeat_interval_ms", "must be non-zero"));
        }
        if self.cluster.suspect_after_missed == 0 {
            return Err(invalid("cluster.suspect_after_missed", "must be non-zero"));
        }
        if self.cluster.enabled && self.cluster.interface.is_empty() {
            return Err(invalid(
                "cluster.interface",
                "required when cluster.enabled = true",
            ));
        }
        if self.ingress.queue_depth == 0 {
            return Err(invalid("ingress.queue_depth", "must be non-zero"));
        }
        for seed in &self.agents {
            let score = seed.agent.capability_score;
            let load = seed.agent.current_load;
            if !(0.0..=1.0).contains(&score) || !(0.0..=1.0).contains(&load) {
                return Err(invalid(
                    "agents",
                    format!(
                        "{}: capability_score and current_load must be within 0..=1",
                        seed.agent.agent_ref
                    ),
                ));
            }
        }
        Ok(budgets)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node.node_id.clone())
    }

    /// Apply EDGELINE_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn flag(v: &str) -> bool {
            v == "true" || v == "1"
        }

        if let Ok(v) = std::env::var("EDGELINE_NODE__NODE_ID") {
            self.node.node_id = v;
        }
        if let Ok(v) = std::env::var("EDGELINE_REMOTE__ENDPOINT") {
            self.remote.endpoint = v;
        }
        if let Ok(v) = std::env::var("EDGELINE_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
        if let Ok(v) = std::env::var("EDGELINE_CLUSTER__ENABLED") {
            self.cluster.enabled = flag(&v);
        }
        if let Ok(v) = std::env::var("EDGELINE_CLUSTER__INTERFACE") {
            self.cluster.interface = v;
        }
        if let Ok(v) = std::env::var("EDGELINE_CLUSTER__INITIAL_ROLE") {
            self.cluster.initial_role = v
                .parse()
                .map_err(|e: String| invalid("cluster.initial_role", e))?;
        }
        if let Ok(v) = std::env::var("EDGELINE_PREDICTOR__ENABLED") {
            self.predictor.enabled = flag(&v);
        }

        // A budget override that does not parse is fatal, never ignored.
        for class in PriorityClass::ALL {
            let var = format!("EDGELINE_BUDGETS__{}_US", class.as_str().to_ascii_uppercase());
            if let Ok(v) = std::env::var(&var) {
                let us = v
                    .parse::<u64>()
                    .map_err(|e| invalid("budgets", format!("{var}: {e}")))?;
                *self.budgets.slot(class) = Some(us);
            }
        }
        Ok(())
    }
}
