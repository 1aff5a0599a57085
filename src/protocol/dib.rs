//! Description Information Blocks (DIBs).
//!
//! Every DIB starts with its own length byte followed by a type code:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ Structure Len│ Type Code    │   Type-specific     │
//! │   (1 byte)   │   (1 byte)   │   (len - 2 bytes)   │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! A description response is a sequence of DIBs. [`Description::parse`] walks
//! it using the length bytes, requires the device-info and supported-families
//! blocks, keeps the first occurrence of each known type and skips unknown
//! types. A length byte below 2 can never describe a block, so it fails the
//! scan immediately, and a trailing fragment shorter than two bytes is a
//! length error.

use core::net::Ipv4Addr;

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, LengthBound, Result};
use crate::protocol::constants::{
    ServiceFamilyId, DIB_DEVICE_INFO, DIB_IP_CONFIG, DIB_IP_CUR_CONFIG, DIB_KNX_ADDRESSES,
    DIB_MFR_DATA, DIB_SUPP_SVC_FAMILIES,
};
use crate::protocol::frame::{Reader, Writer};

/// Most 2-byte entries one DIB can hold: a 255-byte block less its
/// length and type bytes
const MAX_DIB_ENTRIES: usize = (255 - 2) / 2;

/// Maximum service families in a supported-families DIB
pub const MAX_SERVICE_FAMILIES: usize = MAX_DIB_ENTRIES;

/// Maximum individual addresses in a KNX-addresses DIB
pub const MAX_KNX_ADDRESSES: usize = MAX_DIB_ENTRIES;

/// Maximum manufacturer-specific payload
pub const MAX_MFR_DATA: usize = 251;

/// Split the next DIB off `data`, returning `(type, block, rest)`.
fn next_block(data: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    // a block needs at least its length and type bytes
    LengthBound::AtLeast(2).check(data.len())?;
    let len = usize::from(data[0]);
    if len < 2 {
        return Err(KnxError::invalid_structure());
    }
    if len > data.len() {
        return Err(KnxError::length_mismatch(LengthBound::AtLeast(len), data.len()));
    }
    let (block, rest) = data.split_at(len);
    Ok((block[1], block, rest))
}

// =============================================================================
// Device information
// =============================================================================

/// `DEVICE_INFO` DIB (54 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    medium: u8,
    status: u8,
    address: IndividualAddress,
    project_installation_id: u16,
    serial_number: [u8; 6],
    multicast_address: Ipv4Addr,
    mac_address: [u8; 6],
    name: [u8; 30],
}

impl DeviceInfo {
    /// Encoded size
    pub const SIZE: usize = 54;

    /// Build a device-info block. `name` is truncated to 30 bytes.
    #[allow(clippy::too_many_arguments, reason = "mirrors the DIB layout")]
    pub fn new(
        medium: u8,
        status: u8,
        address: IndividualAddress,
        project_installation_id: u16,
        serial_number: [u8; 6],
        multicast_address: Ipv4Addr,
        mac_address: [u8; 6],
        name: &[u8],
    ) -> Self {
        let mut padded = [0u8; 30];
        let n = name.len().min(padded.len());
        padded[..n].copy_from_slice(&name[..n]);
        Self {
            medium,
            status,
            address,
            project_installation_id,
            serial_number,
            multicast_address,
            mac_address,
            name: padded,
        }
    }

    /// KNX medium code (0x02 = TP1, 0x20 = IP)
    pub const fn medium(&self) -> u8 {
        self.medium
    }

    /// Device status byte (bit 0: programming mode)
    pub const fn status(&self) -> u8 {
        self.status
    }

    /// Individual address of the gateway
    pub const fn address(&self) -> IndividualAddress {
        self.address
    }

    /// Project-installation identifier
    pub const fn project_installation_id(&self) -> u16 {
        self.project_installation_id
    }

    /// KNX serial number
    pub const fn serial_number(&self) -> [u8; 6] {
        self.serial_number
    }

    /// Routing multicast address
    pub const fn multicast_address(&self) -> Ipv4Addr {
        self.multicast_address
    }

    /// MAC address
    pub const fn mac_address(&self) -> [u8; 6] {
        self.mac_address
    }

    /// Raw 30-byte name field, NUL padded
    pub const fn name_bytes(&self) -> &[u8; 30] {
        &self.name
    }

    /// Friendly name decoded as ISO 8859-1 up to the first NUL.
    pub fn friendly_name(&self) -> heapless::String<60> {
        let mut out = heapless::String::new();
        for &b in self.name.iter().take_while(|&&b| b != 0) {
            // each latin-1 byte is at most two UTF-8 bytes
            if out.push(char::from(b)).is_err() {
                break;
            }
        }
        out
    }

    fn parse(block: &[u8]) -> Result<Self> {
        LengthBound::Exact(Self::SIZE).check(block.len())?;
        let mut r = Reader::new(&block[2..]);
        Ok(Self {
            medium: r.u8()?,
            status: r.u8()?,
            address: IndividualAddress::from(r.u16()?),
            project_installation_id: r.u16()?,
            serial_number: r.array()?,
            multicast_address: r.ipv4()?,
            mac_address: r.array()?,
            name: r.array()?,
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(Self::SIZE as u8)?;
        w.put_u8(DIB_DEVICE_INFO)?;
        w.put_u8(self.medium)?;
        w.put_u8(self.status)?;
        w.put_u16(self.address.raw())?;
        w.put_u16(self.project_installation_id)?;
        w.put_slice(&self.serial_number)?;
        w.put_slice(&self.multicast_address.octets())?;
        w.put_slice(&self.mac_address)?;
        w.put_slice(&self.name)
    }
}

// =============================================================================
// Supported service families
// =============================================================================

/// `SUPP_SVC_FAMILIES` DIB: (family, version) pairs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SupportedFamilies {
    families: heapless::Vec<(ServiceFamilyId, u8), MAX_SERVICE_FAMILIES>,
}

impl SupportedFamilies {
    /// Build from (family, version) pairs
    pub fn new(families: &[(ServiceFamilyId, u8)]) -> Result<Self> {
        Ok(Self {
            families: heapless::Vec::from_slice(families)
                .ok()
                .ok_or(KnxError::capacity_exceeded())?,
        })
    }

    /// Advertised (family, version) pairs
    pub fn iter(&self) -> impl Iterator<Item = (ServiceFamilyId, u8)> + '_ {
        self.families.iter().copied()
    }

    /// Whether `family` is advertised, any version
    pub fn supports(&self, family: ServiceFamilyId) -> bool {
        self.families.iter().any(|&(f, _)| f == family)
    }

    /// Advertised version of `family`
    pub fn version_of(&self, family: ServiceFamilyId) -> Option<u8> {
        self.families.iter().find(|&&(f, _)| f == family).map(|&(_, v)| v)
    }

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        2 + 2 * self.families.len()
    }

    pub(crate) fn parse(block: &[u8]) -> Result<Self> {
        LengthBound::AtLeast(2).check(block.len())?;
        if block.len() % 2 != 0 {
            return Err(KnxError::invalid_structure());
        }
        let mut families = heapless::Vec::new();
        for pair in block[2..].chunks_exact(2) {
            families
                .push((ServiceFamilyId::from_u8(pair[0]), pair[1]))
                .ok()
                .ok_or(KnxError::capacity_exceeded())?;
        }
        Ok(Self { families })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(self.encoded_len() as u8)?;
        w.put_u8(DIB_SUPP_SVC_FAMILIES)?;
        for &(family, version) in &self.families {
            w.put_u8(family.to_u8())?;
            w.put_u8(version)?;
        }
        Ok(())
    }
}

// =============================================================================
// IP configuration
// =============================================================================

/// `IP_CONFIG` DIB (16 bytes): configured addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpConfig {
    /// Configured IP address
    pub ip_address: Ipv4Addr,
    /// Configured subnet mask
    pub subnet_mask: Ipv4Addr,
    /// Configured default gateway
    pub default_gateway: Ipv4Addr,
    /// Supported assignment methods
    pub capabilities: u8,
    /// Enabled assignment methods
    pub assignment_method: u8,
}

impl IpConfig {
    /// Encoded size
    pub const SIZE: usize = 16;

    fn parse(block: &[u8]) -> Result<Self> {
        LengthBound::Exact(Self::SIZE).check(block.len())?;
        let mut r = Reader::new(&block[2..]);
        Ok(Self {
            ip_address: r.ipv4()?,
            subnet_mask: r.ipv4()?,
            default_gateway: r.ipv4()?,
            capabilities: r.u8()?,
            assignment_method: r.u8()?,
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(Self::SIZE as u8)?;
        w.put_u8(DIB_IP_CONFIG)?;
        w.put_slice(&self.ip_address.octets())?;
        w.put_slice(&self.subnet_mask.octets())?;
        w.put_slice(&self.default_gateway.octets())?;
        w.put_u8(self.capabilities)?;
        w.put_u8(self.assignment_method)
    }
}

/// `IP_CUR_CONFIG` DIB (20 bytes): addressing currently in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCurrentConfig {
    /// Current IP address
    pub ip_address: Ipv4Addr,
    /// Current subnet mask
    pub subnet_mask: Ipv4Addr,
    /// Current default gateway
    pub default_gateway: Ipv4Addr,
    /// DHCP server that assigned the address
    pub dhcp_server: Ipv4Addr,
    /// Assignment method in use
    pub assignment_method: u8,
}

impl IpCurrentConfig {
    /// Encoded size
    pub const SIZE: usize = 20;

    fn parse(block: &[u8]) -> Result<Self> {
        LengthBound::Exact(Self::SIZE).check(block.len())?;
        let mut r = Reader::new(&block[2..]);
        Ok(Self {
            ip_address: r.ipv4()?,
            subnet_mask: r.ipv4()?,
            default_gateway: r.ipv4()?,
            dhcp_server: r.ipv4()?,
            assignment_method: r.u8()?,
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8(Self::SIZE as u8)?;
        w.put_u8(DIB_IP_CUR_CONFIG)?;
        w.put_slice(&self.ip_address.octets())?;
        w.put_slice(&self.subnet_mask.octets())?;
        w.put_slice(&self.default_gateway.octets())?;
        w.put_slice(&self.dhcp_server.octets())?;
        w.put_u8(self.assignment_method)?;
        w.put_u8(0)
    }
}

// =============================================================================
// KNX addresses and manufacturer data
// =============================================================================

/// `KNX_ADDRESSES` DIB: primary plus additional individual addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnxAddresses {
    addresses: heapless::Vec<IndividualAddress, MAX_KNX_ADDRESSES>,
}

impl KnxAddresses {
    /// Build from a non-empty address list
    pub fn new(addresses: &[IndividualAddress]) -> Result<Self> {
        if addresses.is_empty() {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            addresses: heapless::Vec::from_slice(addresses)
                .ok()
                .ok_or(KnxError::capacity_exceeded())?,
        })
    }

    /// All addresses, primary first
    pub fn addresses(&self) -> &[IndividualAddress] {
        &self.addresses
    }

    fn parse(block: &[u8]) -> Result<Self> {
        LengthBound::AtLeast(4).check(block.len())?;
        if block.len() % 2 != 0 {
            return Err(KnxError::invalid_structure());
        }
        let mut addresses = heapless::Vec::new();
        for raw in block[2..].chunks_exact(2) {
            addresses
                .push(IndividualAddress::read(raw)?)
                .ok()
                .ok_or(KnxError::capacity_exceeded())?;
        }
        Ok(Self { addresses })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8((2 + 2 * self.addresses.len()) as u8)?;
        w.put_u8(DIB_KNX_ADDRESSES)?;
        for addr in &self.addresses {
            w.put_u16(addr.raw())?;
        }
        Ok(())
    }
}

/// `MFR_DATA` DIB: manufacturer id plus opaque data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    manufacturer_id: u16,
    data: heapless::Vec<u8, MAX_MFR_DATA>,
}

impl ManufacturerData {
    /// Build a manufacturer block
    pub fn new(manufacturer_id: u16, data: &[u8]) -> Result<Self> {
        Ok(Self {
            manufacturer_id,
            data: heapless::Vec::from_slice(data)
                .ok()
                .ok_or(KnxError::capacity_exceeded())?,
        })
    }

    /// KNX manufacturer id
    pub const fn manufacturer_id(&self) -> u16 {
        self.manufacturer_id
    }

    /// Manufacturer-specific payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn parse(block: &[u8]) -> Result<Self> {
        LengthBound::AtLeast(4).check(block.len())?;
        Self::new(u16::from_be_bytes([block[2], block[3]]), &block[4..])
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u8((4 + self.data.len()) as u8)?;
        w.put_u8(DIB_MFR_DATA)?;
        w.put_u16(self.manufacturer_id)?;
        w.put_slice(&self.data)
    }
}

// =============================================================================
// Description
// =============================================================================

/// Everything a gateway reports about itself in a description response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    /// Mandatory device information
    pub device: DeviceInfo,
    /// Mandatory supported service families
    pub families: SupportedFamilies,
    /// Optional configured IP settings
    pub ip_config: Option<IpConfig>,
    /// Optional current IP settings
    pub ip_current: Option<IpCurrentConfig>,
    /// Optional KNX addresses
    pub addresses: Option<KnxAddresses>,
    /// Optional manufacturer data
    pub manufacturer: Option<ManufacturerData>,
}

impl Description {
    /// Description with only the mandatory blocks
    pub const fn new(device: DeviceInfo, families: SupportedFamilies) -> Self {
        Self {
            device,
            families,
            ip_config: None,
            ip_current: None,
            addresses: None,
            manufacturer: None,
        }
    }

    /// Whether the gateway offers tunneling
    pub fn supports_tunneling(&self) -> bool {
        self.families.supports(ServiceFamilyId::Tunneling)
    }

    /// Scan a sequence of DIBs.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let mut device = None;
        let mut families = None;
        let mut ip_config = None;
        let mut ip_current = None;
        let mut addresses = None;
        let mut manufacturer = None;

        while !data.is_empty() {
            let (dib_type, block, rest) = next_block(data)?;
            match dib_type {
                DIB_DEVICE_INFO if device.is_none() => device = Some(DeviceInfo::parse(block)?),
                DIB_SUPP_SVC_FAMILIES if families.is_none() => {
                    families = Some(SupportedFamilies::parse(block)?);
                }
                DIB_IP_CONFIG if ip_config.is_none() => ip_config = Some(IpConfig::parse(block)?),
                DIB_IP_CUR_CONFIG if ip_current.is_none() => {
                    ip_current = Some(IpCurrentConfig::parse(block)?);
                }
                DIB_KNX_ADDRESSES if addresses.is_none() => {
                    addresses = Some(KnxAddresses::parse(block)?);
                }
                DIB_MFR_DATA if manufacturer.is_none() => {
                    manufacturer = Some(ManufacturerData::parse(block)?);
                }
                other => knx_log!(debug, "Skipping DIB type 0x{:02X}", other),
            }
            data = rest;
        }

        Ok(Self {
            device: device.ok_or(KnxError::missing_dib(DIB_DEVICE_INFO))?,
            families: families.ok_or(KnxError::missing_dib(DIB_SUPP_SVC_FAMILIES))?,
            ip_config,
            ip_current,
            addresses,
            manufacturer,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        self.device.write(w)?;
        self.families.write(w)?;
        if let Some(ip) = &self.ip_config {
            ip.write(w)?;
        }
        if let Some(ip) = &self.ip_current {
            ip.write(w)?;
        }
        if let Some(addresses) = &self.addresses {
            addresses.write(w)?;
        }
        if let Some(mfr) = &self.manufacturer {
            mfr.write(w)?;
        }
        Ok(())
    }
}

/// Parse the device-info DIB at the start of `data` (search responses).
pub(crate) fn parse_device_info(data: &[u8]) -> Result<DeviceInfo> {
    let (dib_type, block, _) = next_block(data)?;
    if dib_type != DIB_DEVICE_INFO {
        return Err(KnxError::missing_dib(DIB_DEVICE_INFO));
    }
    DeviceInfo::parse(block)
}

/// Write a device-info DIB (search responses).
pub(crate) fn write_device_info(device: &DeviceInfo, w: &mut Writer<'_>) -> Result<()> {
    device.write(w)
}

/// Parse the supported-families DIB at the start of `data` (search responses).
pub(crate) fn parse_families(data: &[u8]) -> Result<SupportedFamilies> {
    let (dib_type, block, _) = next_block(data)?;
    if dib_type != DIB_SUPP_SVC_FAMILIES {
        return Err(KnxError::missing_dib(DIB_SUPP_SVC_FAMILIES));
    }
    SupportedFamilies::parse(block)
}
