//! KNX individual addresses (`Area.Line.Device`).
//!
//! Gateways report individual addresses in three places this crate decodes:
//! the device-hardware DIB, the KNX-addresses DIB and the CRD of a tunnel
//! connect response (the address assigned to the tunnel).

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX individual address, 4-bit area, 4-bit line, 8-bit device.
///
/// # Examples
///
/// ```
/// use knx_tunnel::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 250).unwrap();
/// assert_eq!(addr.raw(), 0x11FA);
/// assert_eq!(addr.to_string(), "1.1.250");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Size on the wire
    pub const SIZE: usize = 2;
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// Create an address from its components.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return Err(KnxError::address_out_of_range());
        }
        Ok(Self {
            raw: (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device),
        })
    }

    /// Raw 16-bit value as sent on the wire.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Area component (0-15).
    #[inline]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Line component (0-15).
    #[inline]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Device component (0-255).
    #[inline]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Big-endian wire bytes.
    #[inline]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.raw.to_be_bytes()
    }

    /// Read an address from the first two bytes of `buf`.
    #[inline]
    pub(crate) fn read(buf: &[u8]) -> Result<Self> {
        match buf {
            [hi, lo, ..] => Ok(Self::from(u16::from_be_bytes([*hi, *lo]))),
            _ => Err(KnxError::buffer_too_small()),
        }
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl core::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.').map(str::parse::<u8>);
        let mut next = || {
            parts
                .next()
                .and_then(core::result::Result::ok)
                .ok_or_else(KnxError::invalid_individual_address)
        };
        let (area, line, device) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(KnxError::invalid_individual_address());
        }
        Self::new(area, line, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components() {
        let addr = IndividualAddress::new(1, 2, 3).unwrap();
        assert_eq!((addr.area(), addr.line(), addr.device()), (1, 2, 3));
        assert_eq!(addr.raw(), 0x1203);
        assert_eq!(addr.to_bytes(), [0x12, 0x03]);
    }

    #[test]
    fn test_out_of_range() {
        assert!(IndividualAddress::new(16, 0, 0).is_err());
        assert!(IndividualAddress::new(0, 16, 0).is_err());
    }

    #[test]
    fn test_read() {
        let addr = IndividualAddress::read(&[0x11, 0xFA, 0xFF]).unwrap();
        assert_eq!(addr.to_string(), "1.1.250");
        assert!(IndividualAddress::read(&[0x11]).is_err());
    }

    #[test]
    fn test_from_str() {
        let addr: IndividualAddress = "15.15.255".parse().unwrap();
        assert_eq!(addr.raw(), 0xFFFF);

        assert!("1.2".parse::<IndividualAddress>().is_err());
        assert!("1.2.3.4".parse::<IndividualAddress>().is_err());
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
        assert!("a.b.c".parse::<IndividualAddress>().is_err());
        assert!("".parse::<IndividualAddress>().is_err());
    }
}
