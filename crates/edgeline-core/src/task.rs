//! Tasks: the unit of work submitted for routing.
//!
//! A task carries an opaque payload that only downstream collaborators
//! interpret. Routing never looks at the payload: it works from the
//! task's *shape* (priority class, task type, context fields), condensed
//! into a `ClassificationKey`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Priority class ───────────────────────────────────────────────────────────

/// Priority class. Fixes the maximum allowable decision latency.
///
/// Declared most urgent first, so `class <= QualityCritical` reads as
/// "needs an immediate local answer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Emergency stops, collision avoidance. Local only, ≤ 1ms.
    SafetyCritical,
    /// Inline quality inspection. ≤ 10ms.
    QualityCritical,
    /// Throughput optimisation. ≤ 100ms.
    EfficiencyCritical,
    /// Everything else. ≤ 500ms.
    Standard,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::SafetyCritical,
        PriorityClass::QualityCritical,
        PriorityClass::EfficiencyCritical,
        PriorityClass::Standard,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SafetyCritical => "safety_critical",
            Self::QualityCritical => "quality_critical",
            Self::EfficiencyCritical => "efficiency_critical",
            Self::Standard => "standard",
        }
    }

    /// Hard ceiling on the class budget. Configuration may tighten a
    /// budget but never raise it above this.
    pub fn ceiling(self) -> Duration {
        match self {
            Self::SafetyCritical => Duration::from_millis(1),
            Self::QualityCritical => Duration::from_millis(10),
            Self::EfficiencyCritical => Duration::from_millis(100),
            Self::Standard => Duration::from_millis(500),
        }
    }

    /// Dense index, for per-class counter arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "safety_critical" | "safety" => Ok(Self::SafetyCritical),
            "quality_critical" | "quality" => Ok(Self::QualityCritical),
            "efficiency_critical" | "efficiency" => Ok(Self::EfficiencyCritical),
            "standard" => Ok(Self::Standard),
            other => Err(format!("unknown priority class '{other}'")),
        }
    }
}

// ── Task id ──────────────────────────────────────────────────────────────────

/// Opaque unique task identifier, assigned by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Task ─────────────────────────────────────────────────────────────────────

/// A unit of work submitted for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub priority_class: PriorityClass,
    /// Kind of work, e.g. "pick", "inspect". Selects the candidate agent set.
    pub task_type: String,
    /// Classification-relevant context fields (zone, line, sku, ...).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Opaque to the engine.
    #[serde(default)]
    pub payload: Bytes,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        task_type: impl Into<String>,
        priority_class: PriorityClass,
    ) -> Self {
        Self {
            id: id.into(),
            priority_class,
            task_type: task_type.into(),
            context: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn classification_key(&self) -> ClassificationKey {
        ClassificationKey::compute(self.priority_class, &self.task_type, &self.context)
    }

    pub fn shape(&self) -> TaskShape {
        TaskShape {
            priority_class: self.priority_class,
            task_type: self.task_type.clone(),
            context: self.context.clone(),
        }
    }
}

/// Everything routing looks at: a task minus its id and payload.
///
/// The predictor keeps shapes of recently seen keys so it can precompute
/// decisions for tasks that have not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskShape {
    pub priority_class: PriorityClass,
    pub task_type: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

// ── Classification key ───────────────────────────────────────────────────────

/// BLAKE3 hash of a task's shape. Two tasks with the same key are routed
/// identically, which is what makes decisions cacheable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassificationKey(pub [u8; 32]);

impl ClassificationKey {
    pub fn compute(
        class: PriorityClass,
        task_type: &str,
        context: &BTreeMap<String, String>,
    ) -> Self {
        // Length-prefixed so ("ab", "c") and ("a", "bc") never collide.
        fn field(h: &mut blake3::Hasher, bytes: &[u8]) {
            h.update(&(bytes.len() as u32).to_le_bytes());
            h.update(bytes);
        }

        let mut h = blake3::Hasher::new();
        h.update(&[class as u8]);
        field(&mut h, task_type.as_bytes());
        for (k, v) in context {
            field(&mut h, k.as_bytes());
            field(&mut h, v.as_bytes());
        }
        Self(*h.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes, hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for ClassificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassificationKey({})", self.short())
    }
}

impl fmt::Display for ClassificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl FromStr for ClassificationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "classification key must be 32 bytes".to_string())?;
        Ok(Self(arr))
    }
}

impl Serialize for ClassificationKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ClassificationKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
