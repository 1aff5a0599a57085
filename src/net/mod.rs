//! Datagram transport and the two tunnel channels.
//!
//! A KNXnet/IP tunnel talks over two UDP conversations with the gateway: the
//! control channel (connect, heartbeat, disconnect) and the data channel
//! (tunneling requests and acks). [`ChannelManager`] owns both and is the
//! single point where incoming datagrams enter the client.
//!
//! The socket itself sits behind the [`Transport`] trait so the client can
//! run over [`udp::UdpTransport`] in production and over
//! [`mock_transport::MockTransport`] in tests.
//!
//! ```text
//!            ┌──────────── ChannelManager ────────────┐
//!  client ──▶│ Channel(Control) ─▶ Transport ─▶ UDP    │──▶ gateway:3671
//!            │ Channel(Data)    ─▶ Transport ─▶ UDP    │──▶ gateway data endpoint
//!            └────────────────────────────────────────┘
//! ```

pub mod mock_transport;
pub mod udp;

use core::future::Future;
use core::net::SocketAddrV4;
use core::time::Duration;
use std::sync::{Mutex, PoisonError};

use crate::error::{KnxError, Result};
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::frame::{ChannelAffinity, FrameBuf};

pub use mock_transport::{mock_pair, MockPeer, MockTransport};
pub use udp::UdpTransport;

/// Asynchronous datagram transport.
///
/// Methods take `&self` so one transport can be sent on by request tasks
/// while the dispatch task is parked in `recv_from`.
///
/// # Examples
///
/// ```rust,no_run
/// use core::net::SocketAddrV4;
/// use knx_tunnel::net::{Transport, UdpTransport};
///
/// # async fn run() -> knx_tunnel::Result<()> {
/// let transport = UdpTransport::bind(SocketAddrV4::new([0, 0, 0, 0].into(), 0)).await?;
/// transport.send_to(&[0x06, 0x10], "192.168.1.10:3671".parse().unwrap()).await?;
/// # Ok(())
/// # }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Local address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddrV4>;

    /// Send one datagram to `target`.
    fn send_to(&self, data: &[u8], target: SocketAddrV4)
        -> impl Future<Output = Result<()>> + Send;

    /// Wait for one datagram. Returns its length and source address.
    ///
    /// Datagrams longer than `buf` are truncated. The future must be
    /// cancel-safe: dropping it must not lose a datagram.
    fn recv_from(&self, buf: &mut [u8])
        -> impl Future<Output = Result<(usize, SocketAddrV4)>> + Send;
}

/// Which of the two tunnel conversations a datagram belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Connection management
    Control,
    /// Tunneled bus traffic
    Data,
}

impl ChannelRole {
    /// Role that carries bodies of the given affinity, if any.
    pub const fn for_affinity(affinity: ChannelAffinity) -> Option<Self> {
        match affinity {
            ChannelAffinity::Control => Some(Self::Control),
            ChannelAffinity::Data => Some(Self::Data),
            ChannelAffinity::Multicast => None,
        }
    }
}

/// One tunnel conversation: a transport plus the remote it talks to.
#[derive(Debug)]
pub struct Channel<T> {
    role: ChannelRole,
    transport: T,
    remote: Mutex<SocketAddrV4>,
    recv_timeout: Duration,
}

impl<T: Transport> Channel<T> {
    /// Open a channel on `transport` towards `remote`.
    pub fn open(role: ChannelRole, transport: T, remote: SocketAddrV4, recv_timeout: Duration) -> Self {
        Self {
            role,
            transport,
            remote: Mutex::new(remote),
            recv_timeout,
        }
    }

    /// Role of this channel
    pub const fn role(&self) -> ChannelRole {
        self.role
    }

    /// Local address of the underlying transport
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.transport.local_addr()
    }

    /// Current remote endpoint
    pub fn remote(&self) -> SocketAddrV4 {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point the channel at a new remote endpoint.
    ///
    /// The data channel is retargeted once the gateway reports its data
    /// endpoint in the connect response.
    pub fn retarget(&self, remote: SocketAddrV4) {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) = remote;
    }

    /// Send one encoded frame to the current remote.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        let remote = self.remote();
        knx_log!(trace, "{:?} -> {}: {} bytes", self.role, remote, frame.len());
        self.transport.send_to(frame, remote).await
    }

    /// Receive one datagram.
    ///
    /// `Ok(None)` means nothing arrived within the receive timeout; errors
    /// are transport failures.
    pub async fn recv(&self) -> Result<Option<(FrameBuf, SocketAddrV4)>> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let Ok(received) = tokio::time::timeout(self.recv_timeout, self.transport.recv_from(&mut buf)).await
        else {
            return Ok(None);
        };
        let (len, from) = received?;
        knx_log!(trace, "{:?} <- {}: {} bytes", self.role, from, len);
        let frame = FrameBuf::from_slice(&buf[..len])
            .ok()
            .ok_or(KnxError::capacity_exceeded())?;
        Ok(Some((frame, from)))
    }
}

/// Datagram received by [`ChannelManager::poll`]
pub type Datagram = (ChannelRole, FrameBuf, SocketAddrV4);

/// Owner of the control and data channels.
#[derive(Debug)]
pub struct ChannelManager<T> {
    control: Channel<T>,
    data: Channel<T>,
}

impl<T: Transport> ChannelManager<T> {
    /// Open both channels towards the gateway control endpoint.
    ///
    /// The data channel starts out aimed at the control endpoint and is
    /// retargeted after the connect response.
    pub fn open(
        control: T,
        data: T,
        gateway: SocketAddrV4,
        control_timeout: Duration,
        data_timeout: Duration,
    ) -> Self {
        Self {
            control: Channel::open(ChannelRole::Control, control, gateway, control_timeout),
            data: Channel::open(ChannelRole::Data, data, gateway, data_timeout),
        }
    }

    /// Channel for `role`
    pub const fn channel(&self, role: ChannelRole) -> &Channel<T> {
        match role {
            ChannelRole::Control => &self.control,
            ChannelRole::Data => &self.data,
        }
    }

    /// Send an encoded frame on the channel for `role`.
    pub async fn send(&self, role: ChannelRole, frame: &[u8]) -> Result<()> {
        self.channel(role).send(frame).await
    }

    /// Wait for the next datagram on either channel.
    ///
    /// Returns `Ok(None)` when a receive timeout elapsed first.
    pub async fn poll(&self) -> Result<Option<Datagram>> {
        tokio::select! {
            received = self.control.recv() => {
                Ok(received?.map(|(frame, from)| (ChannelRole::Control, frame, from)))
            }
            received = self.data.recv() => {
                Ok(received?.map(|(frame, from)| (ChannelRole::Data, frame, from)))
            }
        }
    }
}
