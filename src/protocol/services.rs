//! KNXnet/IP service bodies.
//!
//! One type per service type. Every type is an immutable value: fields are
//! set by its constructor (which validates them) or by `parse`, and read
//! through accessors. `parse` takes the body without the 6-byte header and
//! checks the variant's length rule before touching any field.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |---- DESCRIPTION_REQUEST ------>|
//!   |<--- DESCRIPTION_RESPONSE ------|
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|  (every 60s)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, LengthBound, Result};
use crate::protocol::constants::{
    Status, MAX_ROUTING_CEMI_SIZE, MAX_TUNNELING_CEMI_SIZE, MIN_CEMI_SIZE, TUNNEL_CONNECTION,
    TUNNEL_LINKLAYER,
};
use crate::protocol::dib::{self, Description, DeviceInfo, SupportedFamilies};
use crate::protocol::frame::{Hpai, Reader, Writer};

// =============================================================================
// cEMI payload
// =============================================================================

/// Opaque cEMI frame, 11 to 255 bytes.
///
/// The crate does not interpret cEMI; it only enforces the size limits of
/// the services that carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cemi(heapless::Vec<u8, MAX_ROUTING_CEMI_SIZE>);

impl Cemi {
    /// Accepted length range
    pub const BOUND: LengthBound = LengthBound::Range {
        min: MIN_CEMI_SIZE,
        max: MAX_ROUTING_CEMI_SIZE,
    };

    /// Copy `bytes` into a cEMI value.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        Self::BOUND.check(bytes.len())?;
        heapless::Vec::from_slice(bytes)
            .ok()
            .map(Self)
            .ok_or(KnxError::capacity_exceeded())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Cemi {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// =============================================================================
// CRI / CRD
// =============================================================================

/// Connection Request Information (CRI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cri {
    connection_type: u8,
    knx_layer: u8,
}

impl Cri {
    /// Encoded size
    pub const SIZE: usize = 4;

    /// CRI for a link-layer tunnel
    pub const fn tunnel_link_layer() -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            knx_layer: TUNNEL_LINKLAYER,
        }
    }

    /// CRI with explicit codes
    pub const fn new(connection_type: u8, knx_layer: u8) -> Self {
        Self { connection_type, knx_layer }
    }

    /// Requested connection type
    pub const fn connection_type(&self) -> u8 {
        self.connection_type
    }

    /// Requested KNX layer
    pub const fn knx_layer(&self) -> u8 {
        self.knx_layer
    }

    fn parse(data: &[u8]) -> Result<Self> {
        LengthBound::Exact(Self::SIZE).check(data.len())?;
        if usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            connection_type: data[1],
            knx_layer: data[2],
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(Self::SIZE as u8)?;
        w.put_u8(self.connection_type)?;
        w.put_u8(self.knx_layer)?;
        w.put_u8(0x00)
    }
}

/// Connection Response Data (CRD)
///
/// Tunnel connections carry the individual address assigned to the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Crd {
    connection_type: u8,
    address: Option<IndividualAddress>,
}

impl Crd {
    /// Accepted structure lengths: 2 (no data) or 4 (tunnel address)
    pub const BOUND: LengthBound = LengthBound::Range { min: 2, max: 4 };

    /// CRD for a tunnel connection
    pub const fn tunnel(address: IndividualAddress) -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            address: Some(address),
        }
    }

    /// CRD without connection-specific data
    pub const fn bare(connection_type: u8) -> Self {
        Self { connection_type, address: None }
    }

    /// Connection type
    pub const fn connection_type(&self) -> u8 {
        self.connection_type
    }

    /// Individual address assigned to the tunnel
    pub const fn address(&self) -> Option<IndividualAddress> {
        self.address
    }

    const fn encoded_len(&self) -> usize {
        if self.address.is_some() {
            4
        } else {
            2
        }
    }

    fn parse(data: &[u8]) -> Result<Self> {
        Self::BOUND.check(data.len())?;
        if usize::from(data[0]) != data.len() || data.len() == 3 {
            return Err(KnxError::invalid_structure());
        }
        let address = if data.len() == 4 {
            Some(IndividualAddress::read(&data[2..])?)
        } else {
            None
        };
        Ok(Self {
            connection_type: data[1],
            address,
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(self.encoded_len() as u8)?;
        w.put_u8(self.connection_type)?;
        if let Some(address) = self.address {
            w.put_u16(address.raw())?;
        }
        Ok(())
    }
}

// =============================================================================
// Search
// =============================================================================

/// `SEARCH_REQUEST` service (0x0201)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest {
    discovery_endpoint: Hpai,
}

impl SearchRequest {
    /// Body length
    pub const BOUND: LengthBound = LengthBound::Exact(Hpai::SIZE);

    /// Search answered to `discovery_endpoint`
    pub const fn new(discovery_endpoint: Hpai) -> Self {
        Self { discovery_endpoint }
    }

    /// Where responses should go
    pub const fn discovery_endpoint(&self) -> Hpai {
        self.discovery_endpoint
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::BOUND.check(body.len())?;
        Ok(Self::new(Hpai::parse(body)?))
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        self.discovery_endpoint.write(w)
    }
}

/// `SEARCH_RESPONSE` service (0x0202)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    control_endpoint: Hpai,
    device: DeviceInfo,
    families: SupportedFamilies,
}

impl SearchResponse {
    /// Body length: HPAI, device DIB and a families DIB of at least 2 bytes
    pub const BOUND: LengthBound = LengthBound::Range {
        min: Hpai::SIZE + DeviceInfo::SIZE + 2,
        max: 254,
    };

    /// Build a search response
    pub fn new(control_endpoint: Hpai, device: DeviceInfo, families: SupportedFamilies) -> Result<Self> {
        let len = Hpai::SIZE + DeviceInfo::SIZE + families.encoded_len();
        Self::BOUND.check(len)?;
        Ok(Self { control_endpoint, device, families })
    }

    /// Gateway control endpoint
    pub const fn control_endpoint(&self) -> Hpai {
        self.control_endpoint
    }

    /// Gateway device information
    pub const fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Gateway service families
    pub const fn families(&self) -> &SupportedFamilies {
        &self.families
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::BOUND.check(body.len())?;
        let control_endpoint = Hpai::parse(body)?;
        let device = dib::parse_device_info(&body[Hpai::SIZE..])?;
        let families_start = Hpai::SIZE + DeviceInfo::SIZE;
        let families_dib = &body[families_start..];
        // the families block must end exactly where the body does
        LengthBound::Exact(usize::from(families_dib[0])).check(families_dib.len())?;
        let families = dib::parse_families(families_dib)?;
        Ok(Self { control_endpoint, device, families })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        self.control_endpoint.write(w)?;
        dib::write_device_info(&self.device, w)?;
        self.families.write(w)
    }
}

// =============================================================================
// Description
// =============================================================================

/// `DESCRIPTION_REQUEST` service (0x0203)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptionRequest {
    control_endpoint: Hpai,
}

impl DescriptionRequest {
    /// Body length
    pub const BOUND: LengthBound = LengthBound::Exact(Hpai::SIZE);

    /// Description request answered to `control_endpoint`
    pub const fn new(control_endpoint: Hpai) -> Self {
        Self { control_endpoint }
    }

    /// Where the response should go
    pub const fn control_endpoint(&self) -> Hpai {
        self.control_endpoint
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::BOUND.check(body.len())?;
        Ok(Self::new(Hpai::parse(body)?))
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        self.control_endpoint.write(w)
    }
}

/// `DESCRIPTION_RESPONSE` service (0x0204)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResponse {
    description: Description,
}

impl DescriptionResponse {
    /// Wrap a gateway description
    pub const fn new(description: Description) -> Self {
        Self { description }
    }

    /// Decoded DIBs
    pub const fn description(&self) -> &Description {
        &self.description
    }

    /// Take the decoded DIBs
    pub fn into_description(self) -> Description {
        self.description
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self::new(Description::parse(body)?))
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        self.description.write(w)
    }
}

// =============================================================================
// Connect
// =============================================================================

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    control_endpoint: Hpai,
    data_endpoint: Hpai,
    cri: Cri,
}

impl ConnectRequest {
    /// Body length
    pub const BOUND: LengthBound = LengthBound::Exact(2 * Hpai::SIZE + Cri::SIZE);

    /// Link-layer tunnel request
    pub const fn tunnel(control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        Self::new(control_endpoint, data_endpoint, Cri::tunnel_link_layer())
    }

    /// Connect request with an explicit CRI
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai, cri: Cri) -> Self {
        Self { control_endpoint, data_endpoint, cri }
    }

    /// Client control endpoint
    pub const fn control_endpoint(&self) -> Hpai {
        self.control_endpoint
    }

    /// Client data endpoint
    pub const fn data_endpoint(&self) -> Hpai {
        self.data_endpoint
    }

    /// Connection request information
    pub const fn cri(&self) -> Cri {
        self.cri
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::BOUND.check(body.len())?;
        let mut r = Reader::new(body);
        let control_endpoint = r.hpai()?;
        let data_endpoint = r.hpai()?;
        let cri = Cri::parse(r.rest())?;
        Ok(Self::new(control_endpoint, data_endpoint, cri))
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        self.control_endpoint.write(w)?;
        self.data_endpoint.write(w)?;
        self.cri.write(w)
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
///
/// A rejection may carry only channel id and status (2 bytes). A success
/// always carries the gateway data endpoint and a CRD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    channel_id: u8,
    status: Status,
    endpoint: Option<(Hpai, Crd)>,
}

impl ConnectResponse {
    /// Successful connect
    pub const fn accepted(channel_id: u8, data_endpoint: Hpai, crd: Crd) -> Self {
        Self {
            channel_id,
            status: Status::NoError,
            endpoint: Some((data_endpoint, crd)),
        }
    }

    /// Rejected connect without endpoint data
    pub fn rejected(channel_id: u8, status: Status) -> Result<Self> {
        if status.is_ok() {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self { channel_id, status, endpoint: None })
    }

    /// Communication channel id
    pub const fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Connect status
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Gateway data endpoint
    pub fn data_endpoint(&self) -> Option<Hpai> {
        self.endpoint.map(|(hpai, _)| hpai)
    }

    /// Connection response data
    pub fn crd(&self) -> Option<Crd> {
        self.endpoint.map(|(_, crd)| crd)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        LengthBound::AtLeast(2).check(body.len())?;
        let channel_id = body[0];
        let status = Status::from_u8(body[1]);
        if body.len() == 2 {
            if status.is_ok() {
                return Err(KnxError::invalid_structure());
            }
            return Ok(Self { channel_id, status, endpoint: None });
        }

        LengthBound::Range { min: 2 + Hpai::SIZE + 2, max: 2 + Hpai::SIZE + 4 }
            .check(body.len())?;
        let data_endpoint = Hpai::parse(&body[2..])?;
        let crd = Crd::parse(&body[2 + Hpai::SIZE..])?;
        Ok(Self {
            channel_id,
            status,
            endpoint: Some((data_endpoint, crd)),
        })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(self.channel_id)?;
        w.put_u8(self.status.to_u8())?;
        if let Some((hpai, crd)) = &self.endpoint {
            hpai.write(w)?;
            crd.write(w)?;
        }
        Ok(())
    }
}

// =============================================================================
// Connection state / disconnect
// =============================================================================

macro_rules! channel_request {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            channel_id: u8,
            control_endpoint: Hpai,
        }

        impl $name {
            /// Body length: channel id, reserved byte, HPAI
            pub const BOUND: LengthBound = LengthBound::Exact(2 + Hpai::SIZE);

            /// Request for `channel_id`, answered to `control_endpoint`
            pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
                Self { channel_id, control_endpoint }
            }

            /// Communication channel id
            pub const fn channel_id(&self) -> u8 {
                self.channel_id
            }

            /// Sender control endpoint
            pub const fn control_endpoint(&self) -> Hpai {
                self.control_endpoint
            }

            /// Parse from frame body
            pub fn parse(body: &[u8]) -> Result<Self> {
                Self::BOUND.check(body.len())?;
                Ok(Self::new(body[0], Hpai::parse(&body[2..])?))
            }

            pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
                w.put_u8(self.channel_id)?;
                w.put_u8(0x00)?;
                self.control_endpoint.write(w)
            }
        }
    };
}

macro_rules! channel_response {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        pub struct $name {
            channel_id: u8,
            status: Status,
        }

        impl $name {
            /// Body length: channel id, status
            pub const BOUND: LengthBound = LengthBound::Exact(2);

            /// Response for `channel_id`
            pub const fn new(channel_id: u8, status: Status) -> Self {
                Self { channel_id, status }
            }

            /// Communication channel id
            pub const fn channel_id(&self) -> u8 {
                self.channel_id
            }

            /// Response status
            pub const fn status(&self) -> Status {
                self.status
            }

            /// Parse from frame body
            pub fn parse(body: &[u8]) -> Result<Self> {
                Self::BOUND.check(body.len())?;
                Ok(Self::new(body[0], Status::from_u8(body[1])))
            }

            pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
                w.put_u8(self.channel_id)?;
                w.put_u8(self.status.to_u8())
            }
        }
    };
}

channel_request!(
    /// `CONNECTIONSTATE_REQUEST` service (0x0207)
    ConnectionStateRequest
);
channel_response!(
    /// `CONNECTIONSTATE_RESPONSE` service (0x0208)
    ConnectionStateResponse
);
channel_request!(
    /// `DISCONNECT_REQUEST` service (0x0209)
    DisconnectRequest
);
channel_response!(
    /// `DISCONNECT_RESPONSE` service (0x020A)
    DisconnectResponse
);

// =============================================================================
// Tunneling / routing
// =============================================================================

/// Connection header shared by tunneling request and ack.
const CONNECTION_HEADER_SIZE: usize = 4;

/// `TUNNELING_REQUEST` service (0x0420)
///
/// ```text
/// ┌──────────────┬──────────────┬──────────────┬──────────────┐
/// │ Struct Len=4 │ Channel ID   │ Sequence     │ Reserved     │
/// ├──────────────┴──────────────┴──────────────┴──────────────┤
/// │                cEMI frame (11..=251 bytes)                 │
/// └────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelingRequest {
    channel_id: u8,
    sequence: u8,
    cemi: Cemi,
}

impl TunnelingRequest {
    /// Body length
    pub const BOUND: LengthBound = LengthBound::Range {
        min: CONNECTION_HEADER_SIZE + MIN_CEMI_SIZE,
        max: CONNECTION_HEADER_SIZE + MAX_TUNNELING_CEMI_SIZE,
    };

    /// Wrap `cemi` for `channel_id` with `sequence`
    pub fn new(channel_id: u8, sequence: u8, cemi: Cemi) -> Result<Self> {
        LengthBound::Range { min: MIN_CEMI_SIZE, max: MAX_TUNNELING_CEMI_SIZE }
            .check(cemi.len())?;
        Ok(Self { channel_id, sequence, cemi })
    }

    /// Communication channel id
    pub const fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Sequence counter
    pub const fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Tunneled cEMI frame
    pub const fn cemi(&self) -> &Cemi {
        &self.cemi
    }

    /// Take the tunneled cEMI frame
    pub fn into_cemi(self) -> Cemi {
        self.cemi
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::BOUND.check(body.len())?;
        if usize::from(body[0]) != CONNECTION_HEADER_SIZE {
            return Err(KnxError::invalid_structure());
        }
        Self::new(body[1], body[2], Cemi::new(&body[CONNECTION_HEADER_SIZE..])?)
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(CONNECTION_HEADER_SIZE as u8)?;
        w.put_u8(self.channel_id)?;
        w.put_u8(self.sequence)?;
        w.put_u8(0x00)?;
        w.put_slice(self.cemi.as_bytes())
    }
}

/// `TUNNELING_ACK` service (0x0421)
///
/// The status takes the place of the reserved byte of the connection header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TunnelingAck {
    channel_id: u8,
    sequence: u8,
    status: Status,
}

impl TunnelingAck {
    /// Body length
    pub const BOUND: LengthBound = LengthBound::Exact(CONNECTION_HEADER_SIZE);

    /// Ack for `sequence` on `channel_id`
    pub const fn new(channel_id: u8, sequence: u8, status: Status) -> Self {
        Self { channel_id, sequence, status }
    }

    /// Communication channel id
    pub const fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Acknowledged sequence counter
    pub const fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Ack status
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::BOUND.check(body.len())?;
        if usize::from(body[0]) != CONNECTION_HEADER_SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self::new(body[1], body[2], Status::from_u8(body[3])))
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(CONNECTION_HEADER_SIZE as u8)?;
        w.put_u8(self.channel_id)?;
        w.put_u8(self.sequence)?;
        w.put_u8(self.status.to_u8())
    }
}

/// `ROUTING_INDICATION` service (0x0530)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingIndication {
    cemi: Cemi,
}

impl RoutingIndication {
    /// Body length
    pub const BOUND: LengthBound = Cemi::BOUND;

    /// Wrap a routed cEMI frame
    pub const fn new(cemi: Cemi) -> Self {
        Self { cemi }
    }

    /// Routed cEMI frame
    pub const fn cemi(&self) -> &Cemi {
        &self.cemi
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        Ok(Self::new(Cemi::new(body)?))
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_slice(self.cemi.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::dib::tests::{sample_device, sample_families};
    use crate::protocol::frame::{decode, encode, Body, Header};
    use core::net::{Ipv4Addr, SocketAddrV4};

    const CEMI: [u8; 11] = [0x11, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x08, 0x01, 0x01, 0x00, 0x81];

    fn hpai(last: u8, port: u16) -> Hpai {
        Hpai::udp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, last), port))
    }

    /// Every variant, with the smallest valid body where the size varies.
    fn minimal_bodies() -> [Body; 13] {
        let cemi = Cemi::new(&CEMI).unwrap();
        [
            SearchRequest::new(hpai(10, 50000)).into(),
            SearchResponse::new(hpai(20, 3671), sample_device(), SupportedFamilies::default())
                .unwrap()
                .into(),
            DescriptionRequest::new(hpai(10, 50000)).into(),
            DescriptionResponse::new(Description::new(sample_device(), sample_families())).into(),
            ConnectRequest::tunnel(hpai(10, 50000), hpai(10, 50001)).into(),
            ConnectResponse::rejected(0, Status::NoMoreConnections).unwrap().into(),
            ConnectionStateRequest::new(7, hpai(10, 50000)).into(),
            ConnectionStateResponse::new(7, Status::NoError).into(),
            DisconnectRequest::new(7, hpai(10, 50000)).into(),
            DisconnectResponse::new(7, Status::NoError).into(),
            TunnelingRequest::new(7, 0, cemi.clone()).unwrap().into(),
            TunnelingAck::new(7, 0, Status::NoError).into(),
            RoutingIndication::new(cemi).into(),
        ]
    }

    /// Rewrite the header total length after resizing a frame.
    fn with_body_len(frame: &[u8], body_len: usize) -> std::vec::Vec<u8> {
        let mut out = frame[..Header::SIZE].to_vec();
        out.resize(Header::SIZE + body_len, 0);
        let copy = frame.len().min(out.len());
        out[Header::SIZE..copy].copy_from_slice(&frame[Header::SIZE..copy]);
        let total = out.len() as u16;
        out[4..6].copy_from_slice(&total.to_be_bytes());
        out
    }

    #[test]
    fn test_round_trip_every_variant() {
        for body in minimal_bodies() {
            let bytes = encode(&body).unwrap();
            assert_eq!(decode(&bytes).unwrap(), body, "{:?}", body.service_type());
        }
    }

    #[test]
    fn test_round_trip_connect_accepted() {
        let body = Body::from(ConnectResponse::accepted(
            7,
            hpai(20, 3671),
            Crd::tunnel(IndividualAddress::new(1, 1, 250).unwrap()),
        ));
        let bytes = encode(&body).unwrap();
        assert_eq!(bytes.len(), 6 + 14);
        assert_eq!(decode(&bytes).unwrap(), body);

        let Body::ConnectResponse(resp) = decode(&bytes).unwrap() else {
            panic!("expected connect response");
        };
        assert_eq!(resp.crd().and_then(|c| c.address()).unwrap().to_string(), "1.1.250");
    }

    #[test]
    fn test_one_byte_shorter_or_longer_fails() {
        let cemi = Cemi::new(&[0u8; MAX_TUNNELING_CEMI_SIZE]).unwrap();
        let maximal: [Body; 2] = [
            ConnectResponse::accepted(7, hpai(20, 3671), Crd::tunnel(IndividualAddress::new(1, 1, 250).unwrap()))
                .into(),
            TunnelingRequest::new(7, 0, cemi).unwrap().into(),
        ];

        for body in minimal_bodies().into_iter().chain(maximal) {
            let frame = encode(&body).unwrap();
            let body_len = frame.len() - Header::SIZE;

            let shorter = with_body_len(&frame, body_len - 1);
            let err = decode(&shorter).unwrap_err();
            assert!(err.is_length_mismatch(), "{:?} shorter: {err}", body.service_type());

            // a minimal cEMI may legitimately grow by one byte
            let grows = match &body {
                Body::TunnelingRequest(r) => r.cemi().len() < MAX_TUNNELING_CEMI_SIZE,
                Body::RoutingIndication(_) => true,
                _ => false,
            };
            if grows {
                continue;
            }
            let longer = with_body_len(&frame, body_len + 1);
            let err = decode(&longer).unwrap_err();
            assert!(err.is_length_mismatch(), "{:?} longer: {err}", body.service_type());
        }
    }

    #[test]
    fn test_description_response_trailing_byte() {
        let body = Body::from(DescriptionResponse::new(Description::new(sample_device(), sample_families())));
        let frame = encode(&body).unwrap();
        let body_len = frame.len() - Header::SIZE;

        for len in [body_len - 1, body_len + 1] {
            let err = decode(&with_body_len(&frame, len)).unwrap_err();
            assert!(err.is_length_mismatch(), "body of {len} bytes: {err}");
        }
        // a trailing partial block is a length error even when its first byte is set
        let mut longer = with_body_len(&frame, body_len + 1);
        *longer.last_mut().unwrap() = 0x08;
        assert!(decode(&longer).unwrap_err().is_length_mismatch());
    }

    #[test]
    fn test_length_mismatch_reports_bound() {
        let frame = encode(&Body::from(TunnelingAck::new(1, 2, Status::NoError))).unwrap();
        let err = decode(&with_body_len(&frame, 5)).unwrap_err();
        assert_eq!(err.length_mismatch_details(), Some((LengthBound::Exact(4), 5)));

        let frame = encode(&Body::from(ConnectRequest::tunnel(Hpai::NAT, Hpai::NAT))).unwrap();
        let err = decode(&with_body_len(&frame, 19)).unwrap_err();
        assert_eq!(err.length_mismatch_details(), Some((LengthBound::Exact(20), 19)));
    }

    #[test]
    fn test_cemi_bounds() {
        assert!(Cemi::new(&[0u8; 10]).unwrap_err().is_length_mismatch());
        assert!(Cemi::new(&[0u8; 255]).is_ok());
        assert!(Cemi::new(&[0u8; 256]).is_err());

        // tunneling is capped at 251, routing at 255
        let big = Cemi::new(&[0u8; 252]).unwrap();
        assert!(TunnelingRequest::new(1, 0, big.clone()).is_err());
        let routed = Body::from(RoutingIndication::new(big));
        assert_eq!(decode(&encode(&routed).unwrap()).unwrap(), routed);

        let max = Cemi::new(&[0u8; 251]).unwrap();
        let tunneled = Body::from(TunnelingRequest::new(1, 0, max).unwrap());
        assert_eq!(decode(&encode(&tunneled).unwrap()).unwrap(), tunneled);
    }

    #[test]
    fn test_status_fallback_in_ack() {
        let frame = [0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x07, 0x05, 0x99];
        let Body::TunnelingAck(ack) = decode(&frame).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(ack.status(), Status::Undefined(0x99));
        assert_eq!(ack.sequence(), 5);
        assert_eq!(encode(&ack.into()).unwrap().as_slice(), &frame);
    }

    #[test]
    fn test_connect_response_forms() {
        // NO_ERROR without an endpoint is malformed
        assert!(ConnectResponse::parse(&[0x07, 0x00]).is_err());
        assert!(ConnectResponse::rejected(7, Status::NoError).is_err());

        let rejected = ConnectResponse::parse(&[0x00, 0x24]).unwrap();
        assert_eq!(rejected.status(), Status::NoMoreConnections);
        assert_eq!(rejected.data_endpoint(), None);

        // endpoint with a 2-byte CRD
        let mut body = [0u8; 12];
        body[0] = 0x03;
        body[2..10].copy_from_slice(&[0x08, 0x01, 192, 168, 1, 20, 0x0E, 0x57]);
        body[10..12].copy_from_slice(&[0x02, 0x04]);
        let resp = ConnectResponse::parse(&body).unwrap();
        assert_eq!(resp.crd(), Some(Crd::bare(0x04)));

        // CRD length byte disagreeing with the body
        body[10] = 0x04;
        assert!(ConnectResponse::parse(&body).is_err());
    }

    #[test]
    fn test_search_response_families_must_fill_body() {
        let resp = SearchResponse::new(hpai(20, 3671), sample_device(), sample_families()).unwrap();
        let mut frame = encode(&resp.into()).unwrap().to_vec();
        // shrink the families DIB length byte by two: body no longer matches
        let families_at = Header::SIZE + Hpai::SIZE + DeviceInfo::SIZE;
        frame[families_at] -= 2;
        assert!(decode(&frame).unwrap_err().is_length_mismatch());
    }

    #[test]
    fn test_cri_rejects_wrong_structure_length() {
        let mut frame = encode(&Body::from(ConnectRequest::tunnel(Hpai::NAT, Hpai::NAT)))
            .unwrap()
            .to_vec();
        frame[Header::SIZE + 16] = 0x05;
        assert!(decode(&frame).is_err());
    }
}
