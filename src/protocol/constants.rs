//! KNXnet/IP protocol constants, service types and status codes.

use core::net::{Ipv4Addr, SocketAddrV4};

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// KNXnet/IP multicast group used for search and routing
pub const KNXNETIP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

/// Multicast endpoint for search requests
pub const KNXNETIP_MULTICAST_ENDPOINT: SocketAddrV4 =
    SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, KNXNETIP_DEFAULT_PORT);

/// Maximum size of an encoded frame.
///
/// The largest body the codec produces is a description response carrying
/// every optional DIB; 512 bytes leaves room for manufacturer data.
pub const MAX_FRAME_SIZE: usize = 512;

/// Smallest cEMI frame accepted (message code, additional-info length,
/// control fields, addresses, NPDU length, TPCI)
pub const MIN_CEMI_SIZE: usize = 11;

/// Largest cEMI frame carried by a tunneling request
pub const MAX_TUNNELING_CEMI_SIZE: usize = 251;

/// Largest cEMI frame carried by a routing indication
pub const MAX_ROUTING_CEMI_SIZE: usize = 255;

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// Service types understood by the codec.
///
/// Any other value on the wire fails decoding with an unsupported service
/// type error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ServiceType {
    /// `SEARCH_REQUEST` - Device discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - Device discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - Device description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - Device description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionStateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionStateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,
    /// `TUNNELING_REQUEST` - Tunneled cEMI frame
    TunnelingRequest = 0x0420,
    /// `TUNNELING_ACK` - Tunneling acknowledgement
    TunnelingAck = 0x0421,
    /// `ROUTING_INDICATION` - Routed cEMI frame (multicast)
    RoutingIndication = 0x0530,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0203 => Some(Self::DescriptionRequest),
            0x0204 => Some(Self::DescriptionResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionStateRequest),
            0x0208 => Some(Self::ConnectionStateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0420 => Some(Self::TunnelingRequest),
            0x0421 => Some(Self::TunnelingAck),
            0x0530 => Some(Self::RoutingIndication),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Status Codes
// =============================================================================

/// Status byte carried by responses and acknowledgements.
///
/// Decoding never fails on a status: unknown bytes become
/// [`Status::Undefined`] and keep their raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// `E_NO_ERROR`
    NoError,
    /// `E_HOST_PROTOCOL_TYPE`
    HostProtocolType,
    /// `E_VERSION_NOT_SUPPORTED`
    VersionNotSupported,
    /// `E_SEQUENCE_NUMBER`
    SequenceNumber,
    /// `E_CONNECTION_ID`
    ConnectionId,
    /// `E_CONNECTION_TYPE`
    ConnectionType,
    /// `E_CONNECTION_OPTION`
    ConnectionOption,
    /// `E_NO_MORE_CONNECTIONS`
    NoMoreConnections,
    /// `E_DATA_CONNECTION`
    DataConnection,
    /// `E_KNX_CONNECTION`
    KnxConnection,
    /// `E_TUNNELLING_LAYER`
    TunnelingLayerNotSupported,
    /// Any byte without a mapping
    Undefined(u8),
}

impl Status {
    /// Map a wire byte to a status. Never fails.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::HostProtocolType,
            0x02 => Self::VersionNotSupported,
            0x04 => Self::SequenceNumber,
            0x21 => Self::ConnectionId,
            0x22 => Self::ConnectionType,
            0x23 => Self::ConnectionOption,
            0x24 => Self::NoMoreConnections,
            0x26 => Self::DataConnection,
            0x27 => Self::KnxConnection,
            0x29 => Self::TunnelingLayerNotSupported,
            other => Self::Undefined(other),
        }
    }

    /// Wire byte for this status.
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::NoError => 0x00,
            Self::HostProtocolType => 0x01,
            Self::VersionNotSupported => 0x02,
            Self::SequenceNumber => 0x04,
            Self::ConnectionId => 0x21,
            Self::ConnectionType => 0x22,
            Self::ConnectionOption => 0x23,
            Self::NoMoreConnections => 0x24,
            Self::DataConnection => 0x26,
            Self::KnxConnection => 0x27,
            Self::TunnelingLayerNotSupported => 0x29,
            Self::Undefined(raw) => raw,
        }
    }

    /// `true` for [`Status::NoError`]
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

// =============================================================================
// Service Families
// =============================================================================

/// Service family identifiers advertised in the supported-families DIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceFamilyId {
    /// KNXnet/IP Core
    Core,
    /// Device Management
    DeviceManagement,
    /// Tunneling
    Tunneling,
    /// Routing
    Routing,
    /// Remote Logging
    RemoteLogging,
    /// Remote Configuration and Diagnosis
    RemoteConfiguration,
    /// Object Server
    ObjectServer,
    /// KNX IP Secure
    Security,
    /// Family id without a mapping
    Unknown(u8),
}

impl ServiceFamilyId {
    /// Map a wire byte to a family id. Never fails.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x02 => Self::Core,
            0x03 => Self::DeviceManagement,
            0x04 => Self::Tunneling,
            0x05 => Self::Routing,
            0x06 => Self::RemoteLogging,
            0x07 => Self::RemoteConfiguration,
            0x08 => Self::ObjectServer,
            0x09 => Self::Security,
            other => Self::Unknown(other),
        }
    }

    /// Wire byte for this family.
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Core => 0x02,
            Self::DeviceManagement => 0x03,
            Self::Tunneling => 0x04,
            Self::Routing => 0x05,
            Self::RemoteLogging => 0x06,
            Self::RemoteConfiguration => 0x07,
            Self::ObjectServer => 0x08,
            Self::Security => 0x09,
            Self::Unknown(raw) => raw,
        }
    }
}

// =============================================================================
// DIB Type Codes
// =============================================================================

/// `DEVICE_INFO` DIB
pub const DIB_DEVICE_INFO: u8 = 0x01;
/// `SUPP_SVC_FAMILIES` DIB
pub const DIB_SUPP_SVC_FAMILIES: u8 = 0x02;
/// `IP_CONFIG` DIB
pub const DIB_IP_CONFIG: u8 = 0x03;
/// `IP_CUR_CONFIG` DIB
pub const DIB_IP_CUR_CONFIG: u8 = 0x04;
/// `KNX_ADDRESSES` DIB
pub const DIB_KNX_ADDRESSES: u8 = 0x05;
/// `MFR_DATA` DIB
pub const DIB_MFR_DATA: u8 = 0xFE;

// =============================================================================
// Connection Type / Layer Codes
// =============================================================================

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// Tunneling on the KNX link layer
pub const TUNNEL_LINKLAYER: u8 = 0x02;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Timing Defaults (KNXnet/IP Core and Tunneling specifications)
// =============================================================================

/// `CONNECT_REQUEST_TIMEOUT`
pub const CONNECT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// `CONNECTIONSTATE_REQUEST_TIMEOUT`
pub const CONNECTIONSTATE_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Connection-state attempts before a probe counts as missed
pub const CONNECTIONSTATE_ATTEMPTS: u8 = 3;

/// Interval between connection-state requests
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// `CONNECTION_ALIVE_TIME`
pub const CONNECTION_ALIVE_TIME_SECS: u64 = 120;

/// `TUNNELING_REQUEST_TIMEOUT`
pub const TUNNELING_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Tunneling request attempts (one repetition)
pub const TUNNELING_ATTEMPTS: u8 = 2;

/// `DEVICE_CONFIGURATION_REQUEST_TIMEOUT`, reused for description requests
pub const DESCRIPTION_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_mapping() {
        assert_eq!(ServiceType::from_u16(0x0420), Some(ServiceType::TunnelingRequest));
        assert_eq!(ServiceType::from_u16(0x0530), Some(ServiceType::RoutingIndication));
        assert_eq!(ServiceType::ConnectionStateRequest.to_u16(), 0x0207);
        assert_eq!(ServiceType::from_u16(0x0310), None);
    }

    #[test]
    fn test_status_fallback() {
        assert_eq!(Status::from_u8(0x24), Status::NoMoreConnections);
        assert_eq!(Status::from_u8(0x03), Status::Undefined(0x03));
        assert_eq!(Status::from_u8(0xFF).to_u8(), 0xFF);
        for raw in 0..=u8::MAX {
            assert_eq!(Status::from_u8(raw).to_u8(), raw);
        }
    }

    #[test]
    fn test_service_family_mapping() {
        assert_eq!(ServiceFamilyId::from_u8(0x04), ServiceFamilyId::Tunneling);
        assert_eq!(ServiceFamilyId::from_u8(0x42), ServiceFamilyId::Unknown(0x42));
        assert_eq!(ServiceFamilyId::Security.to_u8(), 0x09);
    }
}
