//! Cluster transports.
//!
//! The failover machine only ever sees `ClusterMessage` values; how they
//! travel is a transport concern. `MemoryHub` connects nodes inside one
//! process and can kill nodes or cut links between them. The daemon uses
//! UDP multicast gossip.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use edgeline_core::cluster::{ClusterMessage, NodeId};
use edgeline_core::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Deliver to every other member. Best effort.
    async fn send(&self, msg: &ClusterMessage) -> Result<(), TransportError>;

    /// Next message from another member.
    async fn recv(&self) -> Result<ClusterMessage, TransportError>;
}

#[derive(Debug, Clone)]
struct Envelope {
    from: NodeId,
    msg: ClusterMessage,
}

#[derive(Default)]
struct Faults {
    killed: HashSet<NodeId>,
    /// Unordered pairs that cannot reach each other.
    cut: HashSet<(NodeId, NodeId)>,
}

impl Faults {
    fn blocked(&self, from: &NodeId, to: &NodeId) -> bool {
        self.killed.contains(from)
            || self.killed.contains(to)
            || self.cut.contains(&pair(from, to))
    }
}

fn pair(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// In-process broadcast medium with fault injection.
#[derive(Clone)]
pub struct MemoryHub {
    tx: broadcast::Sender<Envelope>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn join(&self, node_id: NodeId) -> MemoryTransport {
        MemoryTransport {
            node_id,
            rx: tokio::sync::Mutex::new(self.tx.subscribe()),
            hub: self.clone(),
        }
    }

    /// The node stops sending and receiving.
    pub fn kill(&self, node_id: &NodeId) {
        if let Ok(mut f) = self.faults.lock() {
            f.killed.insert(node_id.clone());
        }
    }

    pub fn revive(&self, node_id: &NodeId) {
        if let Ok(mut f) = self.faults.lock() {
            f.killed.remove(node_id);
        }
    }

    /// Cut the link between two nodes in both directions.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        if let Ok(mut f) = self.faults.lock() {
            f.cut.insert(pair(a, b));
        }
    }

    pub fn heal(&self) {
        if let Ok(mut f) = self.faults.lock() {
            f.cut.clear();
        }
    }

    fn blocked(&self, from: &NodeId, to: &NodeId) -> bool {
        self.faults.lock().map(|f| f.blocked(from, to)).unwrap_or(true)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryTransport {
    node_id: NodeId,
    rx: tokio::sync::Mutex<broadcast::Receiver<Envelope>>,
    hub: MemoryHub,
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    async fn send(&self, msg: &ClusterMessage) -> Result<(), TransportError> {
        // No receivers is fine: the node may be alone.
        let _ = self.hub.tx.send(Envelope {
            from: self.node_id.clone(),
            msg: msg.clone(),
        });
        Ok(())
    }

    async fn recv(&self) -> Result<ClusterMessage, TransportError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(env) => {
                    if env.from == self.node_id || self.hub.blocked(&env.from, &self.node_id) {
                        continue;
                    }
                    return Ok(env.msg);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(node = %self.node_id, skipped = n, "cluster hub receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }
}
