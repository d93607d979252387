//! Datagram transport used by discovery and session traffic.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Outbound half of the datagram path. Sends never block.
pub trait Transport: Send + Sync + 'static {
    /// Send to every listener on the local segment.
    fn broadcast(&self, datagram: &[u8]) -> io::Result<()>;

    /// Send to one peer.
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<()>;
}

/// UDP transport over a single broadcast-capable socket.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind `bind` and direct broadcasts at `broadcast_addr`. Must be called
    /// from inside a tokio runtime.
    pub fn bind(bind: SocketAddr, broadcast_addr: SocketAddr) -> Result<Self> {
        let socket = make_broadcast_socket(bind)
            .with_context(|| format!("failed to create UDP socket on {bind}"))?;
        let socket =
            UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

        tracing::info!(
            local = %socket.local_addr().context("local_addr")?,
            broadcast = %broadcast_addr,
            "udp transport bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            broadcast_addr,
        })
    }

    /// The socket, shared with the receive loop.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast_addr
    }
}

impl Transport for UdpTransport {
    fn broadcast(&self, datagram: &[u8]) -> io::Result<()> {
        self.send_to(datagram, self.broadcast_addr)
    }

    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<()> {
        let n = self.socket.try_send_to(datagram, addr)?;
        tracing::trace!(bytes = n, %addr, "datagram sent");
        Ok(())
    }
}

/// Create a non-blocking UDP socket with SO_BROADCAST set.
fn make_broadcast_socket(bind: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if bind.is_ipv4() {
        socket.set_broadcast(true).context("SO_BROADCAST")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&bind.into()).context("bind()")?;

    Ok(socket.into())
}
