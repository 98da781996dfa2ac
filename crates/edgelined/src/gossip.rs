//! UDP multicast cluster transport.
//!
//! Every member joins one link-local IPv6 group on the configured
//! interface and port. A message is one datagram in the cluster wire
//! format; senders hear their own traffic through multicast loopback, so
//! `recv` filters it out.

use std::net::{Ipv6Addr, SocketAddrV6};

use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use edgeline_core::cluster::{ClusterMessage, NodeId};
use edgeline_core::wire::{self, MAX_FRAME};
use edgeline_engine::transport::{ClusterTransport, TransportError};

/// Link-local group shared by all cluster members.
pub const GOSSIP_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xed6e);

pub struct GossipTransport {
    node_id: NodeId,
    send: UdpSocket,
    recv: UdpSocket,
    dest: SocketAddrV6,
}

impl GossipTransport {
    pub fn bind(interface: &str, port: u16, node_id: NodeId) -> Result<Self> {
        let interface_index = if_index(interface)?;
        let send = make_sender_socket(interface_index)
            .context("failed to create gossip send socket")?;
        let recv = make_listener_socket(interface_index, port)
            .context("failed to create gossip listen socket")?;
        tracing::info!(interface, interface_index, port, group = %GOSSIP_GROUP, "cluster gossip bound");
        Ok(Self {
            node_id,
            send: UdpSocket::from_std(send.into()).context("failed to convert send socket")?,
            recv: UdpSocket::from_std(recv).context("failed to convert listen socket")?,
            dest: SocketAddrV6::new(GOSSIP_GROUP, port, 0, interface_index),
        })
    }
}

#[async_trait]
impl ClusterTransport for GossipTransport {
    async fn send(&self, msg: &ClusterMessage) -> Result<(), TransportError> {
        let frame = wire::encode(msg)?;
        let n = self.send.send_to(&frame, self.dest).await?;
        tracing::trace!(bytes = n, "gossip sent");
        Ok(())
    }

    async fn recv(&self) -> Result<ClusterMessage, TransportError> {
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let (len, from) = self.recv.recv_from(&mut buf).await?;
            let msg = wire::decode(&buf[..len])?;
            if msg.sender() == &self.node_id {
                continue;
            }
            tracing::trace!(from = %from, sender = %msg.sender(), "gossip received");
            return Ok(msg);
        }
    }
}

/// Create a UDP socket suitable for sending IPv6 multicast.
fn make_sender_socket(interface_index: u32) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_multicast_if_v6(interface_index).context("IPV6_MULTICAST_IF")?;
    // TTL 1: link-local only
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    Ok(socket)
}

/// Create a UDP socket joined to the gossip group.
fn make_listener_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v6(&GOSSIP_GROUP, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
