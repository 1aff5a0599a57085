//! KNXnet/IP frame decoding and encoding.
//!
//! ## Frame Structure
//!
//! All KNXnet/IP frames follow this structure:
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  Header (6 bytes)           │
//! │  - Header Length: 0x06      │
//! │  - Protocol Version: 0x10   │
//! │  - Service Type: 2 bytes    │
//! │  - Total Length: 2 bytes    │
//! ├─────────────────────────────┤
//! │  Body (variable)            │
//! │  - Service-specific data    │
//! └─────────────────────────────┘
//! ```
//!
//! [`decode`] and [`encode`] are the only entry points. Decoding checks the
//! header, requires the total length to match the datagram exactly, then
//! hands the body to the variant selected by the service type. Every
//! variant checks its own length rule before reading a single field.
//!
//! ## Example
//!
//! ```rust
//! use knx_tunnel::protocol::frame::{self, Body, Hpai};
//! use knx_tunnel::protocol::services::DescriptionRequest;
//!
//! let request = Body::from(DescriptionRequest::new(Hpai::NAT));
//! let bytes = frame::encode(&request).unwrap();
//! assert_eq!(bytes.len(), 14);
//! assert_eq!(frame::decode(&bytes).unwrap(), request);
//! ```

use core::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{KnxError, LengthBound, Result};
use crate::protocol::constants::{
    ServiceType, HEADER_SIZE_10, IPV4_UDP, KNXNETIP_VERSION_10, MAX_FRAME_SIZE,
};
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionStateRequest, ConnectionStateResponse,
    DescriptionRequest, DescriptionResponse, DisconnectRequest, DisconnectResponse,
    RoutingIndication, SearchRequest, SearchResponse, TunnelingAck, TunnelingRequest,
};

/// Encoded frame as returned by [`encode`].
pub type FrameBuf = heapless::Vec<u8, MAX_FRAME_SIZE>;

// =============================================================================
// Header
// =============================================================================

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl Header {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a header for a body of `body_length` bytes
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from the start of a datagram.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let [header_length, version, st_hi, st_lo, len_hi, len_lo, ..] = *data else {
            return Err(KnxError::length_mismatch(LengthBound::AtLeast(Self::SIZE), data.len()));
        };

        if header_length != HEADER_SIZE_10 {
            return Err(KnxError::invalid_header());
        }
        if version != KNXNETIP_VERSION_10 {
            return Err(KnxError::unsupported_version(version));
        }

        let total_length = u16::from_be_bytes([len_hi, len_lo]);
        if usize::from(total_length) < Self::SIZE {
            return Err(KnxError::invalid_header());
        }

        let raw = u16::from_be_bytes([st_hi, st_lo]);
        let service_type =
            ServiceType::from_u16(raw).ok_or(KnxError::unsupported_service_type(raw))?;

        Ok(Self { service_type, total_length })
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        w.put_u8(HEADER_SIZE_10)?;
        w.put_u8(KNXNETIP_VERSION_10)?;
        w.put_u16(self.service_type.to_u16())?;
        w.put_u16(self.total_length)?;
        Ok(w.position())
    }

    /// Body length announced by the header
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

// =============================================================================
// HPAI
// =============================================================================

/// Host Protocol Address Information (HPAI)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
///
/// The all-zero endpoint ([`Hpai::NAT`]) asks the peer to answer to the
/// source address of the datagram instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hpai {
    host_protocol: u8,
    endpoint: SocketAddrV4,
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Route-back endpoint `0.0.0.0:0` over UDP
    pub const NAT: Self = Self::udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

    /// HPAI for an IPv4 UDP endpoint
    pub const fn udp(endpoint: SocketAddrV4) -> Self {
        Self { host_protocol: IPV4_UDP, endpoint }
    }

    /// HPAI with an explicit host protocol code
    pub const fn with_protocol(host_protocol: u8, endpoint: SocketAddrV4) -> Self {
        Self { host_protocol, endpoint }
    }

    /// Host protocol code (0x01 for UDP)
    pub const fn host_protocol(&self) -> u8 {
        self.host_protocol
    }

    /// IPv4 endpoint
    pub const fn endpoint(&self) -> SocketAddrV4 {
        self.endpoint
    }

    /// `true` for the `0.0.0.0:0` route-back endpoint
    pub fn is_nat(&self) -> bool {
        self.endpoint.ip().is_unspecified() && self.endpoint.port() == 0
    }

    /// Parse an HPAI from the first 8 bytes of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        let [len, proto, a, b, c, d, p_hi, p_lo, ..] = *data else {
            return Err(KnxError::length_mismatch(LengthBound::AtLeast(Self::SIZE), data.len()));
        };
        if usize::from(len) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            host_protocol: proto,
            endpoint: SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), u16::from_be_bytes([p_hi, p_lo])),
        })
    }

    /// Encode HPAI into bytes
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        self.write(&mut w)?;
        Ok(w.position())
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(Self::SIZE as u8)?;
        w.put_u8(self.host_protocol)?;
        w.put_slice(&self.endpoint.ip().octets())?;
        w.put_u16(self.endpoint.port())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Hpai {
    fn format(&self, f: defmt::Formatter<'_>) {
        let ip = self.endpoint.ip().octets();
        defmt::write!(
            f,
            "{}.{}.{}.{}:{}",
            ip[0],
            ip[1],
            ip[2],
            ip[3],
            self.endpoint.port()
        );
    }
}

// =============================================================================
// Body
// =============================================================================

/// Channel a body travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelAffinity {
    /// Session management: description, connect, connection state, disconnect
    Control,
    /// Tunneled bus data
    Data,
    /// Search and routing, sent to the multicast group
    Multicast,
}

/// Whether a body asks or answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Initiates an exchange
    Request,
    /// Answers a request (acks included)
    Response,
}

/// Decoded KNXnet/IP body, one variant per supported service type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// `SEARCH_REQUEST`
    SearchRequest(SearchRequest),
    /// `SEARCH_RESPONSE`
    SearchResponse(SearchResponse),
    /// `DESCRIPTION_REQUEST`
    DescriptionRequest(DescriptionRequest),
    /// `DESCRIPTION_RESPONSE`
    DescriptionResponse(DescriptionResponse),
    /// `CONNECT_REQUEST`
    ConnectRequest(ConnectRequest),
    /// `CONNECT_RESPONSE`
    ConnectResponse(ConnectResponse),
    /// `CONNECTIONSTATE_REQUEST`
    ConnectionStateRequest(ConnectionStateRequest),
    /// `CONNECTIONSTATE_RESPONSE`
    ConnectionStateResponse(ConnectionStateResponse),
    /// `DISCONNECT_REQUEST`
    DisconnectRequest(DisconnectRequest),
    /// `DISCONNECT_RESPONSE`
    DisconnectResponse(DisconnectResponse),
    /// `TUNNELING_REQUEST`
    TunnelingRequest(TunnelingRequest),
    /// `TUNNELING_ACK`
    TunnelingAck(TunnelingAck),
    /// `ROUTING_INDICATION`
    RoutingIndication(RoutingIndication),
}

impl Body {
    /// Service type written in the header
    pub const fn service_type(&self) -> ServiceType {
        match self {
            Self::SearchRequest(_) => ServiceType::SearchRequest,
            Self::SearchResponse(_) => ServiceType::SearchResponse,
            Self::DescriptionRequest(_) => ServiceType::DescriptionRequest,
            Self::DescriptionResponse(_) => ServiceType::DescriptionResponse,
            Self::ConnectRequest(_) => ServiceType::ConnectRequest,
            Self::ConnectResponse(_) => ServiceType::ConnectResponse,
            Self::ConnectionStateRequest(_) => ServiceType::ConnectionStateRequest,
            Self::ConnectionStateResponse(_) => ServiceType::ConnectionStateResponse,
            Self::DisconnectRequest(_) => ServiceType::DisconnectRequest,
            Self::DisconnectResponse(_) => ServiceType::DisconnectResponse,
            Self::TunnelingRequest(_) => ServiceType::TunnelingRequest,
            Self::TunnelingAck(_) => ServiceType::TunnelingAck,
            Self::RoutingIndication(_) => ServiceType::RoutingIndication,
        }
    }

    /// Channel this body belongs on
    pub const fn affinity(&self) -> ChannelAffinity {
        match self {
            Self::SearchRequest(_) | Self::SearchResponse(_) | Self::RoutingIndication(_) => {
                ChannelAffinity::Multicast
            }
            Self::TunnelingRequest(_) | Self::TunnelingAck(_) => ChannelAffinity::Data,
            Self::DescriptionRequest(_)
            | Self::DescriptionResponse(_)
            | Self::ConnectRequest(_)
            | Self::ConnectResponse(_)
            | Self::ConnectionStateRequest(_)
            | Self::ConnectionStateResponse(_)
            | Self::DisconnectRequest(_)
            | Self::DisconnectResponse(_) => ChannelAffinity::Control,
        }
    }

    /// Request or response
    pub const fn direction(&self) -> Direction {
        match self {
            Self::SearchRequest(_)
            | Self::DescriptionRequest(_)
            | Self::ConnectRequest(_)
            | Self::ConnectionStateRequest(_)
            | Self::DisconnectRequest(_)
            | Self::TunnelingRequest(_)
            | Self::RoutingIndication(_) => Direction::Request,
            Self::SearchResponse(_)
            | Self::DescriptionResponse(_)
            | Self::ConnectResponse(_)
            | Self::ConnectionStateResponse(_)
            | Self::DisconnectResponse(_)
            | Self::TunnelingAck(_) => Direction::Response,
        }
    }

    /// Decode a body whose service type is already known
    pub fn parse(service_type: ServiceType, body: &[u8]) -> Result<Self> {
        Ok(match service_type {
            ServiceType::SearchRequest => Self::SearchRequest(SearchRequest::parse(body)?),
            ServiceType::SearchResponse => Self::SearchResponse(SearchResponse::parse(body)?),
            ServiceType::DescriptionRequest => {
                Self::DescriptionRequest(DescriptionRequest::parse(body)?)
            }
            ServiceType::DescriptionResponse => {
                Self::DescriptionResponse(DescriptionResponse::parse(body)?)
            }
            ServiceType::ConnectRequest => Self::ConnectRequest(ConnectRequest::parse(body)?),
            ServiceType::ConnectResponse => Self::ConnectResponse(ConnectResponse::parse(body)?),
            ServiceType::ConnectionStateRequest => {
                Self::ConnectionStateRequest(ConnectionStateRequest::parse(body)?)
            }
            ServiceType::ConnectionStateResponse => {
                Self::ConnectionStateResponse(ConnectionStateResponse::parse(body)?)
            }
            ServiceType::DisconnectRequest => {
                Self::DisconnectRequest(DisconnectRequest::parse(body)?)
            }
            ServiceType::DisconnectResponse => {
                Self::DisconnectResponse(DisconnectResponse::parse(body)?)
            }
            ServiceType::TunnelingRequest => Self::TunnelingRequest(TunnelingRequest::parse(body)?),
            ServiceType::TunnelingAck => Self::TunnelingAck(TunnelingAck::parse(body)?),
            ServiceType::RoutingIndication => {
                Self::RoutingIndication(RoutingIndication::parse(body)?)
            }
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            Self::SearchRequest(b) => b.write(w),
            Self::SearchResponse(b) => b.write(w),
            Self::DescriptionRequest(b) => b.write(w),
            Self::DescriptionResponse(b) => b.write(w),
            Self::ConnectRequest(b) => b.write(w),
            Self::ConnectResponse(b) => b.write(w),
            Self::ConnectionStateRequest(b) => b.write(w),
            Self::ConnectionStateResponse(b) => b.write(w),
            Self::DisconnectRequest(b) => b.write(w),
            Self::DisconnectResponse(b) => b.write(w),
            Self::TunnelingRequest(b) => b.write(w),
            Self::TunnelingAck(b) => b.write(w),
            Self::RoutingIndication(b) => b.write(w),
        }
    }
}

macro_rules! body_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Body {
                fn from(body: $variant) -> Self {
                    Self::$variant(body)
                }
            }
        )*
    };
}

body_from!(
    SearchRequest,
    SearchResponse,
    DescriptionRequest,
    DescriptionResponse,
    ConnectRequest,
    ConnectResponse,
    ConnectionStateRequest,
    ConnectionStateResponse,
    DisconnectRequest,
    DisconnectResponse,
    TunnelingRequest,
    TunnelingAck,
    RoutingIndication,
);

// =============================================================================
// Entry points
// =============================================================================

/// Decode one datagram into a [`Body`].
///
/// The header's total length must equal `data.len()`; anything else is a
/// length mismatch, trailing bytes included.
pub fn decode(data: &[u8]) -> Result<Body> {
    let header = Header::parse(data)?;
    LengthBound::Exact(usize::from(header.total_length)).check(data.len())?;
    Body::parse(header.service_type, &data[Header::SIZE..])
}

/// Encode `body` with its header into `buf`, returning the frame length.
pub fn encode_into(body: &Body, buf: &mut [u8]) -> Result<usize> {
    let Some(body_buf) = buf.get_mut(Header::SIZE..) else {
        return Err(KnxError::buffer_too_small());
    };
    let mut w = Writer::new(body_buf);
    body.write(&mut w)?;
    let body_len = w.position();

    let total = Header::SIZE + body_len;
    if total > MAX_FRAME_SIZE {
        return Err(KnxError::capacity_exceeded());
    }
    Header::new(body.service_type(), body_len as u16).encode(buf)?;
    Ok(total)
}

/// Encode `body` with its header.
pub fn encode(body: &Body) -> Result<FrameBuf> {
    let mut buf = [0u8; MAX_FRAME_SIZE];
    let len = encode_into(body, &mut buf)?;
    FrameBuf::from_slice(&buf[..len])
        .ok()
        .ok_or(KnxError::capacity_exceeded())
}

// =============================================================================
// Cursor helpers
// =============================================================================

/// Bounds-checked writer over a caller buffer.
#[derive(Debug)]
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_slice(&[value])
    }

    pub(crate) fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub(crate) fn put_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        let dst = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(KnxError::buffer_too_small())?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

/// Bounds-checked reader. Callers validate lengths first, so running out
/// of input here means a structure lied about its size.
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn ipv4(&mut self) -> Result<Ipv4Addr> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn hpai(&mut self) -> Result<Hpai> {
        Hpai::parse(self.take(Hpai::SIZE)?)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let out = self
            .data
            .get(self.pos..end)
            .ok_or(KnxError::length_mismatch(LengthBound::AtLeast(end), self.data.len()))?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::Status;

    #[test]
    fn test_header_parse() {
        let data = [
            0x06, // header length
            0x10, // protocol version
            0x02, 0x01, // service type (SEARCH_REQUEST)
            0x00, 0x0E, // total length (14 bytes)
        ];

        let header = Header::parse(&data).unwrap();
        assert_eq!(header.service_type, ServiceType::SearchRequest);
        assert_eq!(header.total_length, 14);
        assert_eq!(header.body_length(), 8);
    }

    #[test]
    fn test_header_errors() {
        let err = Header::parse(&[0x06, 0x10, 0x02]).unwrap_err();
        assert!(err.is_length_mismatch());

        let err = Header::parse(&[0x05, 0x10, 0x02, 0x01, 0x00, 0x0E]).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(_)));

        let err = Header::parse(&[0x06, 0x20, 0x02, 0x01, 0x00, 0x0E]).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(ref e) if e.is_unsupported_version()));

        let err = Header::parse(&[0x06, 0x10, 0x03, 0x10, 0x00, 0x06]).unwrap_err();
        assert!(matches!(err, KnxError::Protocol(ref e) if e.is_unsupported_service_type()));

        // total length smaller than the header itself
        assert!(Header::parse(&[0x06, 0x10, 0x02, 0x01, 0x00, 0x05]).is_err());
    }

    #[test]
    fn test_header_encode() {
        let header = Header::new(ServiceType::SearchRequest, 8);
        let mut buf = [0u8; 6];
        let size = header.encode(&mut buf).unwrap();

        assert_eq!(size, 6);
        assert_eq!(buf, [0x06, 0x10, 0x02, 0x01, 0x00, 0x0E]);
        assert!(header.encode(&mut [0u8; 5]).is_err());
    }

    #[test]
    fn test_hpai_parse() {
        let data = [
            0x08, // structure length
            0x01, // IPv4 UDP
            192, 168, 1, 100, // IP address
            0x0E, 0x57, // port 3671
        ];

        let hpai = Hpai::parse(&data).unwrap();
        assert_eq!(hpai.endpoint(), "192.168.1.100:3671".parse().unwrap());
        assert_eq!(hpai.host_protocol(), IPV4_UDP);
        assert!(!hpai.is_nat());

        let mut bad = data;
        bad[0] = 0x07;
        assert!(Hpai::parse(&bad).is_err());
        assert!(Hpai::parse(&data[..7]).unwrap_err().is_length_mismatch());
    }

    #[test]
    fn test_hpai_encode() {
        let mut buf = [0u8; 8];
        let size = Hpai::NAT.encode(&mut buf).unwrap();
        assert_eq!(size, 8);
        assert_eq!(buf, [0x08, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(Hpai::NAT.is_nat());
    }

    #[test]
    fn test_decode_rejects_total_length_mismatch() {
        let frame = encode(&Body::from(ConnectionStateResponse::new(7, Status::NoError))).unwrap();
        assert_eq!(frame.len(), 8);

        // one byte of trailing garbage
        let mut longer = frame.clone();
        longer.push(0).unwrap();
        let err = decode(&longer).unwrap_err();
        assert_eq!(err.length_mismatch_details(), Some((LengthBound::Exact(8), 9)));

        // truncated datagram
        let err = decode(&frame[..7]).unwrap_err();
        assert_eq!(err.length_mismatch_details(), Some((LengthBound::Exact(8), 7)));
    }

    #[test]
    fn test_affinity_and_direction() {
        let ack = Body::from(TunnelingAck::new(1, 0, Status::NoError));
        assert_eq!(ack.affinity(), ChannelAffinity::Data);
        assert_eq!(ack.direction(), Direction::Response);

        let search = Body::from(SearchRequest::new(Hpai::NAT));
        assert_eq!(search.affinity(), ChannelAffinity::Multicast);
        assert_eq!(search.direction(), Direction::Request);

        let disconnect = Body::from(DisconnectRequest::new(1, Hpai::NAT));
        assert_eq!(disconnect.affinity(), ChannelAffinity::Control);
        assert_eq!(disconnect.service_type(), ServiceType::DisconnectRequest);
    }

    #[test]
    fn test_encode_into_small_buffer() {
        let body = Body::from(DescriptionRequest::new(Hpai::NAT));
        assert!(encode_into(&body, &mut [0u8; 10]).is_err());
        assert!(encode_into(&body, &mut [0u8; 4]).is_err());
        assert_eq!(encode_into(&body, &mut [0u8; 14]).unwrap(), 14);
    }
}
