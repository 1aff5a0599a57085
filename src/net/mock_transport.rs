//! In-memory transport for testing.
//!
//! [`mock_pair`] returns the two ends of a fake UDP conversation: a
//! [`MockTransport`] handed to the client, and a [`MockPeer`] the test uses
//! to play the gateway. Everything the client sends shows up at the peer
//! together with the address it was sent to; everything the peer sends is
//! received by the client as coming from the peer's address.
//!
//! ## Example
//!
//! ```rust
//! use core::net::SocketAddrV4;
//! use knx_tunnel::net::{mock_pair, Transport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client: SocketAddrV4 = "192.168.1.20:50000".parse().unwrap();
//! let gateway: SocketAddrV4 = "192.168.1.10:3671".parse().unwrap();
//! let (transport, mut peer) = mock_pair(client, gateway);
//!
//! transport.send_to(&[0x06, 0x10], gateway).await.unwrap();
//! assert_eq!(peer.recv().await, Some((vec![0x06, 0x10], gateway)));
//!
//! peer.send(&[0x06, 0x10, 0x02, 0x06]);
//! let mut buf = [0u8; 64];
//! let (len, from) = transport.recv_from(&mut buf).await.unwrap();
//! assert_eq!((&buf[..len], from), (&[0x06, 0x10, 0x02, 0x06][..], gateway));
//! # }
//! ```

use core::net::SocketAddrV4;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::error::{KnxError, Result};
use crate::net::Transport;
use crate::protocol::frame::{self, Body};

type Packet = (Vec<u8>, SocketAddrV4);

/// Client end of an in-memory datagram pipe.
#[derive(Debug)]
pub struct MockTransport {
    local: SocketAddrV4,
    outbound: UnboundedSender<Packet>,
    inbound: Mutex<UnboundedReceiver<Packet>>,
}

/// Test end of an in-memory datagram pipe, playing the remote side.
#[derive(Debug)]
pub struct MockPeer {
    address: SocketAddrV4,
    to_client: UnboundedSender<Packet>,
    from_client: UnboundedReceiver<Packet>,
}

/// Create a connected transport/peer pair.
///
/// `local` is what the transport reports as its bound address, `remote` is
/// the source address of everything the peer sends.
pub fn mock_pair(local: SocketAddrV4, remote: SocketAddrV4) -> (MockTransport, MockPeer) {
    let (to_peer, from_client) = unbounded_channel();
    let (to_client, from_peer) = unbounded_channel();
    let transport = MockTransport {
        local,
        outbound: to_peer,
        inbound: Mutex::new(from_peer),
    };
    let peer = MockPeer {
        address: remote,
        to_client,
        from_client,
    };
    (transport, peer)
}

impl Transport for MockTransport {
    fn local_addr(&self) -> Result<SocketAddrV4> {
        Ok(self.local)
    }

    async fn send_to(&self, data: &[u8], target: SocketAddrV4) -> Result<()> {
        self.outbound
            .send((data.to_vec(), target))
            .ok()
            .ok_or_else(KnxError::transport_closed)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let (data, from) = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(KnxError::transport_closed)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }
}

impl MockPeer {
    /// Address the peer sends from
    pub const fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Deliver raw bytes to the client. Returns `false` once the client's
    /// transport is gone.
    pub fn send(&self, data: &[u8]) -> bool {
        self.to_client.send((data.to_vec(), self.address)).is_ok()
    }

    /// Encode `body` and deliver it to the client.
    pub fn send_body(&self, body: &Body) -> Result<()> {
        let frame = frame::encode(body)?;
        if self.send(&frame) {
            Ok(())
        } else {
            Err(KnxError::transport_closed())
        }
    }

    /// Next datagram sent by the client with its target address. `None`
    /// once the transport is dropped and drained.
    pub async fn recv(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        self.from_client.recv().await
    }

    /// Next datagram sent by the client, decoded. Datagrams that do not
    /// decode are skipped.
    pub async fn recv_body(&mut self) -> Option<Body> {
        loop {
            let (data, _) = self.recv().await?;
            if let Ok(body) = frame::decode(&data) {
                return Some(body);
            }
        }
    }

    /// Next already queued datagram, without waiting.
    pub fn try_recv(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        self.from_client.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::Hpai;
    use crate::protocol::services::ConnectionStateRequest;

    fn addrs() -> (SocketAddrV4, SocketAddrV4) {
        ("10.0.0.2:50000".parse().unwrap(), "10.0.0.1:3671".parse().unwrap())
    }

    #[tokio::test]
    async fn test_transport_to_peer() {
        let (local, remote) = addrs();
        let (transport, mut peer) = mock_pair(local, remote);
        assert_eq!(transport.local_addr().unwrap(), local);

        let body = Body::from(ConnectionStateRequest::new(7, Hpai::NAT));
        let frame = frame::encode(&body).unwrap();
        transport.send_to(&frame, remote).await.unwrap();
        assert_eq!(peer.recv_body().await, Some(body));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_peer_to_transport_truncates() {
        let (local, remote) = addrs();
        let (transport, peer) = mock_pair(local, remote);
        assert!(peer.send(&[1, 2, 3, 4]));

        let mut buf = [0u8; 2];
        let (len, from) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!((len, from), (2, remote));
        assert_eq!(buf, [1, 2]);
    }

    #[tokio::test]
    async fn test_closed_ends() {
        let (local, remote) = addrs();
        let (transport, peer) = mock_pair(local, remote);
        drop(peer);

        let err = transport.send_to(&[0], remote).await.unwrap_err();
        assert!(matches!(err, KnxError::Transport(ref e) if e.is_closed()));
        let mut buf = [0u8; 8];
        assert!(transport.recv_from(&mut buf).await.is_err());
    }
}
