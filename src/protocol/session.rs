//! Sans-IO tunneling session.
//!
//! [`Session`] holds everything a tunnel connection has to remember: the
//! lifecycle [`Phase`], the channel id assigned by the gateway, both
//! sequence counters and the endpoints on either side. It builds the
//! outbound bodies and judges the inbound ones, but never touches a socket;
//! the async client drives it and the unit tests below drive it by hand.
//!
//! ## State Machine
//!
//! ```text
//! Discovering → Connecting → Connected → Disconnecting → Closed
//!      │             │           │              ▲
//!      └─────────────┴───────────┴──────────────┘ (fatal error)
//! ```
//!
//! `Closed` is terminal. A new connection needs a new session.

use core::fmt;
use core::net::SocketAddrV4;

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::Status;
use crate::protocol::frame::Hpai;
use crate::protocol::services::{
    Cemi, ConnectResponse, ConnectionStateRequest, DisconnectRequest, DisconnectResponse,
    TunnelingAck, TunnelingRequest,
};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// Waiting for the gateway description
    Discovering,
    /// Connect request sent, waiting for the channel
    Connecting,
    /// Channel established, data may flow
    Connected,
    /// Disconnect in progress
    Disconnecting,
    /// Terminal
    Closed,
}

impl Phase {
    /// `true` once nothing more can happen on this session
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    const fn can_advance_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Discovering, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connected, Self::Disconnecting)
                | (Self::Discovering | Self::Connecting | Self::Connected | Self::Disconnecting, Self::Closed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovering => "DISCOVERING",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CloseCause {
    /// The application asked for a disconnect
    ClientRequest,
    /// The gateway sent a disconnect request
    RemoteRequest,
    /// Too many consecutive connection-state probes went unanswered
    ConnectionStateTimeout,
    /// No description response after all attempts
    DescriptionNotReceived,
    /// Connect rejected or unanswered after all attempts
    ChannelNotEstablished,
    /// The gateway does not offer tunneling
    TunnelingNotSupported,
    /// The socket failed
    TransportFailure,
    /// The client was dropped while open
    Dropped,
}

/// Verdict on an inbound tunneling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Inbound {
    /// New frame: acknowledge and deliver
    Deliver,
    /// Same or older sequence: acknowledge again, do not deliver
    Duplicate,
    /// Channel id is not ours: ignore
    ForeignChannel,
}

/// Tunnel connection state.
#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    close_cause: Option<CloseCause>,
    channel_id: Option<u8>,
    send_sequence: u8,
    last_inbound: Option<u8>,
    local_control: Hpai,
    local_data: Hpai,
    remote_control: SocketAddrV4,
    remote_data: Option<SocketAddrV4>,
    tunnel_address: Option<IndividualAddress>,
    heartbeat_misses: u8,
}

impl Session {
    /// New session in [`Phase::Discovering`].
    ///
    /// `local_control` and `local_data` are the HPAIs advertised to the
    /// gateway; `remote_control` is the gateway control endpoint.
    pub const fn new(local_control: Hpai, local_data: Hpai, remote_control: SocketAddrV4) -> Self {
        Self {
            phase: Phase::Discovering,
            close_cause: None,
            channel_id: None,
            send_sequence: 0,
            last_inbound: None,
            local_control,
            local_data,
            remote_control,
            remote_data: None,
            tunnel_address: None,
            heartbeat_misses: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Current phase
    #[inline]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Why the session closed, once it has
    #[inline]
    pub const fn close_cause(&self) -> Option<CloseCause> {
        self.close_cause
    }

    /// Channel id assigned by the gateway
    #[inline]
    pub const fn channel_id(&self) -> Option<u8> {
        self.channel_id
    }

    /// Sequence number the next tunneling request will carry
    #[inline]
    pub const fn send_sequence(&self) -> u8 {
        self.send_sequence
    }

    /// Sequence of the last delivered inbound request
    #[inline]
    pub const fn last_inbound(&self) -> Option<u8> {
        self.last_inbound
    }

    /// Control HPAI advertised to the gateway
    #[inline]
    pub const fn local_control(&self) -> Hpai {
        self.local_control
    }

    /// Data HPAI advertised to the gateway
    #[inline]
    pub const fn local_data(&self) -> Hpai {
        self.local_data
    }

    /// Gateway control endpoint
    #[inline]
    pub const fn remote_control(&self) -> SocketAddrV4 {
        self.remote_control
    }

    /// Gateway data endpoint, known once connected
    #[inline]
    pub const fn remote_data(&self) -> Option<SocketAddrV4> {
        self.remote_data
    }

    /// Individual address assigned to the tunnel
    #[inline]
    pub const fn tunnel_address(&self) -> Option<IndividualAddress> {
        self.tunnel_address
    }

    /// Consecutive connection-state probes without `NO_ERROR`
    #[inline]
    pub const fn heartbeat_misses(&self) -> u8 {
        self.heartbeat_misses
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Move to `to` if the state machine allows it.
    ///
    /// Returns the `(from, to)` pair on change, `None` when the transition
    /// is not allowed (including anything out of `Closed`).
    pub fn advance(&mut self, to: Phase) -> Option<(Phase, Phase)> {
        let from = self.phase;
        if !from.can_advance_to(to) {
            return None;
        }
        self.phase = to;
        Some((from, to))
    }

    /// Close the session, keeping the first recorded cause.
    pub fn close(&mut self, cause: CloseCause) -> Option<(Phase, Phase)> {
        let change = self.advance(Phase::Closed)?;
        self.close_cause.get_or_insert(cause);
        Some(change)
    }

    /// Apply a successful connect response (`Connecting → Connected`).
    ///
    /// A `0.0.0.0:0` data endpoint means "send data to the control endpoint".
    pub fn establish(&mut self, response: &ConnectResponse) -> Result<(Phase, Phase)> {
        if self.phase != Phase::Connecting {
            return Err(KnxError::closed(self.close_cause.unwrap_or(CloseCause::ChannelNotEstablished)));
        }
        if !response.status().is_ok() {
            return Err(KnxError::rejected(response.status()));
        }
        let data = response
            .data_endpoint()
            .ok_or(KnxError::invalid_structure())?;

        self.channel_id = Some(response.channel_id());
        self.remote_data = Some(if data.is_nat() {
            self.remote_control
        } else {
            data.endpoint()
        });
        self.tunnel_address = response.crd().and_then(|crd| crd.address());
        self.send_sequence = 0;
        self.last_inbound = None;
        self.heartbeat_misses = 0;

        self.advance(Phase::Connected)
            .ok_or_else(|| KnxError::closed(CloseCause::ChannelNotEstablished))
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    fn connected_channel(&self) -> Result<u8> {
        match (self.phase, self.channel_id) {
            (Phase::Connected, Some(id)) => Ok(id),
            _ => Err(KnxError::closed(self.close_cause.unwrap_or(CloseCause::ChannelNotEstablished))),
        }
    }

    /// Tunneling request for `cemi` with the current send sequence.
    pub fn tunneling_request(&self, cemi: Cemi) -> Result<TunnelingRequest> {
        TunnelingRequest::new(self.connected_channel()?, self.send_sequence, cemi)
    }

    /// Record a `NO_ERROR` ack for `sequence`. The counter only moves when
    /// the ack is for the current sequence.
    pub fn acknowledge_sent(&mut self, sequence: u8) -> bool {
        if sequence != self.send_sequence {
            return false;
        }
        self.send_sequence = self.send_sequence.wrapping_add(1);
        true
    }

    /// Connection-state probe for the established channel
    pub fn connection_state_request(&self) -> Result<ConnectionStateRequest> {
        Ok(ConnectionStateRequest::new(self.connected_channel()?, self.local_control))
    }

    /// Disconnect request for the established channel
    pub fn disconnect_request(&self) -> Result<DisconnectRequest> {
        match self.channel_id {
            Some(id) if matches!(self.phase, Phase::Connected | Phase::Disconnecting) => {
                Ok(DisconnectRequest::new(id, self.local_control))
            }
            _ => Err(KnxError::closed(self.close_cause.unwrap_or(CloseCause::ClientRequest))),
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Whether `channel_id` is this session's channel
    #[inline]
    pub fn owns_channel(&self, channel_id: u8) -> bool {
        self.channel_id == Some(channel_id)
    }

    /// Judge an inbound tunneling request and remember it when new.
    ///
    /// Sequence comparison is modulo 256: anything up to 127 ahead of the
    /// last delivered sequence is new, the rest is a repeat.
    pub fn classify_inbound(&mut self, request: &TunnelingRequest) -> Inbound {
        if !self.owns_channel(request.channel_id()) {
            return Inbound::ForeignChannel;
        }
        let seq = request.sequence();
        if let Some(last) = self.last_inbound {
            let ahead = seq.wrapping_sub(last);
            if ahead == 0 || ahead >= 128 {
                return Inbound::Duplicate;
            }
        }
        self.last_inbound = Some(seq);
        Inbound::Deliver
    }

    /// Ack for an inbound request
    pub fn ack_for(&self, request: &TunnelingRequest) -> TunnelingAck {
        TunnelingAck::new(request.channel_id(), request.sequence(), Status::NoError)
    }

    /// Whether an ack answers the outstanding request `sequence`
    pub fn ack_matches(&self, ack: &TunnelingAck, sequence: u8) -> bool {
        self.owns_channel(ack.channel_id()) && ack.sequence() == sequence
    }

    /// Accept a gateway disconnect request for our channel.
    ///
    /// Moves `Disconnecting → Closed` and returns the response to send, or
    /// `None` when the request names another channel.
    pub fn remote_disconnect(
        &mut self,
        request: &DisconnectRequest,
    ) -> Option<(DisconnectResponse, heapless::Vec<(Phase, Phase), 2>)> {
        if !self.owns_channel(request.channel_id()) || self.phase.is_closed() {
            return None;
        }
        let mut changes = heapless::Vec::new();
        if let Some(change) = self.advance(Phase::Disconnecting) {
            // capacity 2, two pushes at most
            let _ = changes.push(change);
        }
        if let Some(change) = self.close(CloseCause::RemoteRequest) {
            let _ = changes.push(change);
        }
        Some((DisconnectResponse::new(request.channel_id(), Status::NoError), changes))
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    /// Record a probe outcome; `None` means no response at all.
    ///
    /// Returns the consecutive miss count.
    pub fn record_heartbeat(&mut self, status: Option<Status>) -> u8 {
        match status {
            Some(Status::NoError) => self.heartbeat_misses = 0,
            _ => self.heartbeat_misses = self.heartbeat_misses.saturating_add(1),
        }
        self.heartbeat_misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::services::Crd;
    use core::net::Ipv4Addr;

    const CEMI: [u8; 11] = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x08, 0x01, 0x01, 0x00, 0x81];

    fn gateway() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671)
    }

    fn connected(channel: u8) -> Session {
        let mut session = Session::new(Hpai::NAT, Hpai::NAT, gateway());
        session.advance(Phase::Connecting).unwrap();
        let resp = ConnectResponse::accepted(
            channel,
            Hpai::NAT,
            Crd::tunnel(IndividualAddress::new(1, 1, 250).unwrap()),
        );
        session.establish(&resp).unwrap();
        session
    }

    fn inbound(channel: u8, seq: u8) -> TunnelingRequest {
        TunnelingRequest::new(channel, seq, Cemi::new(&CEMI).unwrap()).unwrap()
    }

    #[test]
    fn test_phase_transitions() {
        let mut session = Session::new(Hpai::NAT, Hpai::NAT, gateway());
        assert_eq!(session.phase(), Phase::Discovering);
        assert_eq!(session.advance(Phase::Connected), None);
        assert_eq!(
            session.advance(Phase::Connecting),
            Some((Phase::Discovering, Phase::Connecting))
        );
        assert_eq!(
            session.close(CloseCause::ChannelNotEstablished),
            Some((Phase::Connecting, Phase::Closed))
        );
        // Closed is terminal
        assert_eq!(session.advance(Phase::Connecting), None);
        assert_eq!(session.close(CloseCause::ClientRequest), None);
        assert_eq!(session.close_cause(), Some(CloseCause::ChannelNotEstablished));
    }

    #[test]
    fn test_establish() {
        let session = connected(7);
        assert_eq!(session.phase(), Phase::Connected);
        assert_eq!(session.channel_id(), Some(7));
        // NAT data endpoint resolves to the gateway control endpoint
        assert_eq!(session.remote_data(), Some(gateway()));
        assert_eq!(session.tunnel_address().unwrap().to_string(), "1.1.250");
    }

    #[test]
    fn test_establish_rejected() {
        let mut session = Session::new(Hpai::NAT, Hpai::NAT, gateway());
        session.advance(Phase::Connecting).unwrap();
        let resp = ConnectResponse::rejected(0, Status::NoMoreConnections).unwrap();
        let err = session.establish(&resp).unwrap_err();
        assert_eq!(err.rejection(), Some(Status::NoMoreConnections));
        assert_eq!(session.phase(), Phase::Connecting);
    }

    #[test]
    fn test_send_sequence_wraps() {
        let mut session = connected(3);
        for expected in 0..=255u8 {
            let req = session.tunneling_request(Cemi::new(&CEMI).unwrap()).unwrap();
            assert_eq!(req.sequence(), expected);
            assert!(session.acknowledge_sent(expected));
        }
        assert_eq!(session.send_sequence(), 0);
        // a late ack for an old sequence does not move the counter
        assert!(!session.acknowledge_sent(200));
        assert_eq!(session.send_sequence(), 0);
    }

    #[test]
    fn test_tunneling_requires_connected() {
        let session = Session::new(Hpai::NAT, Hpai::NAT, gateway());
        let err = session.tunneling_request(Cemi::new(&CEMI).unwrap()).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn test_inbound_duplicates() {
        let mut session = connected(7);
        assert_eq!(session.classify_inbound(&inbound(7, 0)), Inbound::Deliver);
        assert_eq!(session.classify_inbound(&inbound(7, 0)), Inbound::Duplicate);
        assert_eq!(session.classify_inbound(&inbound(7, 1)), Inbound::Deliver);
        assert_eq!(session.classify_inbound(&inbound(8, 2)), Inbound::ForeignChannel);
        assert_eq!(session.last_inbound(), Some(1));
    }

    #[test]
    fn test_inbound_wraparound() {
        let mut session = connected(7);
        assert_eq!(session.classify_inbound(&inbound(7, 254)), Inbound::Deliver);
        assert_eq!(session.classify_inbound(&inbound(7, 255)), Inbound::Deliver);
        assert_eq!(session.classify_inbound(&inbound(7, 0)), Inbound::Deliver);
        // 255 is now behind 0
        assert_eq!(session.classify_inbound(&inbound(7, 255)), Inbound::Duplicate);
        assert_eq!(session.classify_inbound(&inbound(7, 1)), Inbound::Deliver);
    }

    #[test]
    fn test_ack_matching() {
        let session = connected(7);
        assert!(session.ack_matches(&TunnelingAck::new(7, 5, Status::NoError), 5));
        assert!(!session.ack_matches(&TunnelingAck::new(7, 4, Status::NoError), 5));
        assert!(!session.ack_matches(&TunnelingAck::new(8, 5, Status::NoError), 5));
    }

    #[test]
    fn test_remote_disconnect() {
        let mut session = connected(7);
        assert!(session.remote_disconnect(&DisconnectRequest::new(9, Hpai::NAT)).is_none());

        let (response, changes) = session
            .remote_disconnect(&DisconnectRequest::new(7, Hpai::NAT))
            .unwrap();
        assert_eq!(response, DisconnectResponse::new(7, Status::NoError));
        assert_eq!(
            changes.as_slice(),
            &[
                (Phase::Connected, Phase::Disconnecting),
                (Phase::Disconnecting, Phase::Closed)
            ]
        );
        assert_eq!(session.close_cause(), Some(CloseCause::RemoteRequest));
    }

    #[test]
    fn test_heartbeat_misses() {
        let mut session = connected(7);
        assert_eq!(session.record_heartbeat(None), 1);
        assert_eq!(session.record_heartbeat(Some(Status::ConnectionId)), 2);
        assert_eq!(session.record_heartbeat(Some(Status::NoError)), 0);
    }
}
