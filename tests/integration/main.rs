//! Playnet integration test harness.
//!
//! Every test runs hosts and browsers as real UDP endpoints on the loopback
//! interface. Browsers "broadcast" to a host's unicast address, so nothing
//! here needs a broadcast-capable network or root.
//!
//! Lobby tests map segments under the system temp directory with names
//! unique to the test run.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use playnet_core::SessionDescriptor;
use playnet_services::node::NodeSettings;
use playnet_services::{Node, NodeRole, UdpTransport};

mod discovery;
mod lobby;
mod players;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Port 9 on loopback; nothing answers there.
pub const NOWHERE: &str = "127.0.0.1:9";

/// A node with its receiver running. Dropping it stops the receiver.
pub struct Peer {
    pub node: Arc<Node>,
    pub addr: SocketAddr,
    _shutdown: broadcast::Sender<()>,
}

pub fn spawn_peer(role: NodeRole, broadcast_to: SocketAddr, reply_timeout: Duration) -> Result<Peer> {
    let bind: SocketAddr = "127.0.0.1:0".parse()?;
    let transport = UdpTransport::bind(bind, broadcast_to).context("failed to bind peer socket")?;
    let addr = transport.local_addr()?;
    let socket = transport.socket();
    let settings = NodeSettings {
        reply_timeout,
        ..NodeSettings::default()
    };
    let node = Arc::new(Node::new(Arc::new(transport), role, settings)?);
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(node.clone().run_receiver(socket, rx));
    Ok(Peer {
        node,
        addr,
        _shutdown: tx,
    })
}

pub fn spawn_host(session: SessionDescriptor) -> Result<Peer> {
    spawn_peer(NodeRole::Host(session), NOWHERE.parse()?, Duration::from_secs(2))
}

pub fn spawn_browser(host: SocketAddr) -> Result<Peer> {
    spawn_peer(NodeRole::Client, host, Duration::from_secs(2))
}
