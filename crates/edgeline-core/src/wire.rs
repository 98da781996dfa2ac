//! Cluster wire format: datagrams exchanged by the gossip transport.
//!
//! Every datagram is a fixed `FrameHeader` followed by `length` bytes of
//! body. Heartbeats are hot (one per node every interval), so their body
//! is a fixed-layout `HeartbeatFrame`. Topology announcements and state
//! syncs are rare and variable-length; their bodies are JSON.
//!
//! Multi-byte integers are little-endian on the wire.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::cluster::{ClusterMessage, Heartbeat, NodeId, NodeRole, MAX_NODE_ID_LEN};

/// First two bytes of every frame.
pub const MAGIC: u16 = 0xED6E;

/// Current wire version. Receivers drop frames with any other version.
pub const WIRE_VERSION: u8 = 0x01;

/// Largest datagram we send or accept.
pub const MAX_FRAME: usize = 60 * 1024;

/// Frame kinds.
pub mod kind {
    pub const HEARTBEAT: u8 = 0x01;
    pub const TOPOLOGY: u8 = 0x02;
    pub const STATE_SYNC: u8 = 0x03;
}

// ── Frame header ─────────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub magic: u16,
    pub version: u8,
    pub kind: u8,
    /// Body length in bytes, not including this header.
    pub length: u32,
}

assert_eq_size!(FrameHeader, [u8; 8]);

// ── Heartbeat body ───────────────────────────────────────────────────────────

/// Wire size: 88 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HeartbeatFrame {
    /// UTF-8 node id, zero padded.
    pub node_id: [u8; 32],
    /// Sender's view of the primary, zero padded. Meaningful only when
    /// `has_primary` is 1.
    pub primary: [u8; 32],
    pub epoch: u64,
    pub seq: u64,
    /// `NodeRole` as u8.
    pub role: u8,
    pub has_primary: u8,
    pub health_pct: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 5],
}

assert_eq_size!(HeartbeatFrame, [u8; 88]);

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    TooLarge(usize),
    #[error("invalid node id on the wire")]
    InvalidNodeId,
    #[error("invalid role byte {0:#04x}")]
    InvalidRole(u8),
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Serialize a cluster message into one datagram.
pub fn encode(msg: &ClusterMessage) -> Result<Vec<u8>, WireError> {
    let (kind, body) = match msg {
        ClusterMessage::Heartbeat(hb) => (kind::HEARTBEAT, heartbeat_frame(hb)?.as_bytes().to_vec()),
        ClusterMessage::Topology(t) => (kind::TOPOLOGY, serde_json::to_vec(t)?),
        ClusterMessage::StateSync(s) => (kind::STATE_SYNC, serde_json::to_vec(s)?),
    };

    let total = std::mem::size_of::<FrameHeader>() + body.len();
    if total > MAX_FRAME {
        return Err(WireError::TooLarge(total));
    }

    let header = FrameHeader {
        magic: MAGIC.to_le(),
        version: WIRE_VERSION,
        kind,
        length: (body.len() as u32).to_le(),
    };

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse one datagram.
pub fn decode(buf: &[u8]) -> Result<ClusterMessage, WireError> {
    if buf.len() > MAX_FRAME {
        return Err(WireError::TooLarge(buf.len()));
    }
    let header_len = std::mem::size_of::<FrameHeader>();
    let header = FrameHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
        needed: header_len,
        have: buf.len(),
    })?;

    // Copy out of the packed struct before use.
    let magic = u16::from_le(header.magic);
    let version = header.version;
    let frame_kind = header.kind;
    let length = u32::from_le(header.length) as usize;

    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let body = buf
        .get(header_len..header_len + length)
        .ok_or(WireError::Truncated {
            needed: header_len + length,
            have: buf.len(),
        })?;

    match frame_kind {
        kind::HEARTBEAT => {
            let frame = HeartbeatFrame::read_from_prefix(body).ok_or(WireError::Truncated {
                needed: std::mem::size_of::<HeartbeatFrame>(),
                have: body.len(),
            })?;
            Ok(ClusterMessage::Heartbeat(heartbeat_from_frame(&frame)?))
        }
        kind::TOPOLOGY => Ok(ClusterMessage::Topology(serde_json::from_slice(body)?)),
        kind::STATE_SYNC => Ok(ClusterMessage::StateSync(serde_json::from_slice(body)?)),
        other => Err(WireError::UnknownKind(other)),
    }
}

fn heartbeat_frame(hb: &Heartbeat) -> Result<HeartbeatFrame, WireError> {
    let (has_primary, primary) = match &hb.primary {
        Some(p) => (1, node_id_bytes(p)?),
        None => (0, [0u8; 32]),
    };
    Ok(HeartbeatFrame {
        node_id: node_id_bytes(&hb.node_id)?,
        primary,
        epoch: hb.epoch.to_le(),
        seq: hb.seq.to_le(),
        role: hb.role as u8,
        has_primary,
        health_pct: hb.health_pct.min(100),
        reserved: [0u8; 5],
    })
}

fn heartbeat_from_frame(frame: &HeartbeatFrame) -> Result<Heartbeat, WireError> {
    let node_id_raw = frame.node_id;
    let primary_raw = frame.primary;
    let role_byte = frame.role;
    let primary = if frame.has_primary == 1 {
        Some(node_id_from_bytes(&primary_raw)?)
    } else {
        None
    };
    Ok(Heartbeat {
        node_id: node_id_from_bytes(&node_id_raw)?,
        role: NodeRole::try_from(role_byte).map_err(WireError::InvalidRole)?,
        epoch: u64::from_le(frame.epoch),
        seq: u64::from_le(frame.seq),
        primary,
        health_pct: frame.health_pct,
    })
}

fn node_id_bytes(id: &NodeId) -> Result<[u8; 32], WireError> {
    if !id.is_valid() {
        return Err(WireError::InvalidNodeId);
    }
    let mut out = [0u8; MAX_NODE_ID_LEN];
    out[..id.0.len()].copy_from_slice(id.0.as_bytes());
    Ok(out)
}

fn node_id_from_bytes(raw: &[u8; 32]) -> Result<NodeId, WireError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let s = std::str::from_utf8(&raw[..end]).map_err(|_| WireError::InvalidNodeId)?;
    let id = NodeId(s.to_string());
    if !id.is_valid() {
        return Err(WireError::InvalidNodeId);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TopologyAnnouncement;

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            node_id: NodeId::from("edge-b"),
            role: NodeRole::Backup,
            epoch: 7,
            seq: 1234,
            primary: Some(NodeId::from("edge-a")),
            health_pct: 80,
        }
    }

    #[test]
    fn heartbeat_datagram_is_fixed_size() {
        let bytes = encode(&ClusterMessage::Heartbeat(heartbeat())).unwrap();
        assert_eq!(bytes.len(), 8 + 88);
        assert_eq!(decode(&bytes).unwrap(), ClusterMessage::Heartbeat(heartbeat()));
    }

    #[test]
    fn heartbeat_without_primary_decodes_to_none() {
        let mut hb = heartbeat();
        hb.primary = None;
        let bytes = encode(&ClusterMessage::Heartbeat(hb.clone())).unwrap();
        match decode(&bytes).unwrap() {
            ClusterMessage::Heartbeat(back) => assert_eq!(back.primary, None),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn topology_uses_json_body() {
        let msg = ClusterMessage::Topology(TopologyAnnouncement {
            epoch: 3,
            primary: NodeId::from("edge-c"),
            members: vec![NodeId::from("edge-b"), NodeId::from("edge-c")],
        });
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode(&ClusterMessage::Heartbeat(heartbeat())).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(&ClusterMessage::Heartbeat(heartbeat())).unwrap();
        bytes[2] = 0x09;
        assert!(matches!(decode(&bytes), Err(WireError::UnsupportedVersion(0x09))));
    }

    #[test]
    fn rejects_truncated_body() {
        let bytes = encode(&ClusterMessage::Heartbeat(heartbeat())).unwrap();
        assert!(matches!(
            decode(&bytes[..40]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_oversized_node_id() {
        let mut hb = heartbeat();
        hb.node_id = NodeId("n".repeat(40));
        assert!(matches!(
            encode(&ClusterMessage::Heartbeat(hb)),
            Err(WireError::InvalidNodeId)
        ));
    }
}
