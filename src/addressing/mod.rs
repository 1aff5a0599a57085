//! KNX addressing.
//!
//! Only individual addresses appear in the KNXnet/IP structures this crate
//! decodes; group addresses live inside the opaque cEMI payload.

pub mod individual;

pub use individual::IndividualAddress;
