//! UDP transport over a tokio socket.

use core::net::{SocketAddr, SocketAddrV4};
use std::io;

use tokio::net::UdpSocket;

use crate::error::{KnxError, Result};
use crate::net::Transport;

/// [`Transport`] backed by a [`tokio::net::UdpSocket`].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a socket to `local`. Port 0 picks an ephemeral port.
    pub async fn bind(local: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind(local).await.map_err(KnxError::bind_failed)?;
        Ok(Self { socket })
    }

    /// Hop limit for multicast datagrams sent from this socket.
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.socket
            .set_multicast_ttl_v4(ttl)
            .map_err(KnxError::bind_failed)
    }

    /// The wrapped socket
    pub const fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

fn v4_only(addr: SocketAddr) -> io::Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("KNXnet/IP is IPv4 only, got {v6}"),
        )),
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddrV4> {
        self.socket
            .local_addr()
            .and_then(v4_only)
            .map_err(KnxError::bind_failed)
    }

    async fn send_to(&self, data: &[u8], target: SocketAddrV4) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map_err(KnxError::send_failed)?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let (len, from) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(KnxError::receive_failed)?;
        let from = v4_only(from).map_err(KnxError::receive_failed)?;
        Ok((len, from))
    }
}
