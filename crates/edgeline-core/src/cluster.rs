//! Cluster message types: what edge nodes covering the same zone tell
//! each other.
//!
//! These are transport-agnostic. `wire` turns them into datagrams for the
//! UDP gossip transport; the in-memory hub passes them as values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::task::ClassificationKey;

/// Maximum node id length. Node ids travel in fixed 32-byte wire fields.
pub const MAX_NODE_ID_LEN: usize = 32;

/// Edge node identifier. Ordering matters: on promotion the greatest id
/// wins, and in a split brain the lower id yields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, at most 32 bytes, no NUL bytes.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_NODE_ID_LEN && !self.0.contains('\0')
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role of a node in its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum NodeRole {
    Primary = 0x01,
    Backup = 0x02,
}

impl TryFrom<u8> for NodeRole {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::Primary),
            0x02 => Ok(Self::Backup),
            other => Err(other),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "backup" => Ok(Self::Backup),
            other => Err(format!("unknown node role '{other}'")),
        }
    }
}

/// Periodic liveness broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub role: NodeRole,
    /// Topology epoch the sender believes is current.
    pub epoch: u64,
    /// Per-sender sequence number.
    pub seq: u64,
    /// Who the sender currently considers Primary. `None` once the sender
    /// suspects the primary is down; backups count that as confirmation
    /// before promoting.
    pub primary: Option<NodeId>,
    /// Local resource headroom, 0..=100.
    pub health_pct: u8,
}

/// Sent by a node right after it promotes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyAnnouncement {
    pub epoch: u64,
    pub primary: NodeId,
    pub members: Vec<NodeId>,
}

/// A hot-tier decision replicated from the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedDecision {
    pub key: ClassificationKey,
    pub decision: Decision,
    /// Remaining validity when the snapshot was taken.
    pub ttl_ms: u64,
}

/// Minimal state a backup needs to take over with a warm cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSync {
    pub from: NodeId,
    pub epoch: u64,
    pub entries: Vec<ReplicatedDecision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMessage {
    Heartbeat(Heartbeat),
    Topology(TopologyAnnouncement),
    StateSync(StateSync),
}

impl ClusterMessage {
    /// Node that originated the message.
    pub fn sender(&self) -> &NodeId {
        match self {
            Self::Heartbeat(hb) => &hb.node_id,
            Self::Topology(t) => &t.primary,
            Self::StateSync(s) => &s.from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_validation() {
        assert!(NodeId::from("edge-a").is_valid());
        assert!(!NodeId::from("").is_valid());
        assert!(!NodeId::from("x".repeat(33).as_str()).is_valid());
    }

    #[test]
    fn node_ids_order_lexicographically() {
        assert!(NodeId::from("edge-a") < NodeId::from("edge-b"));
    }

    #[test]
    fn role_byte_roundtrip() {
        assert_eq!(NodeRole::try_from(NodeRole::Backup as u8), Ok(NodeRole::Backup));
        assert_eq!(NodeRole::try_from(0x7f), Err(0x7f));
    }
}
