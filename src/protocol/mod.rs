//! KNXnet/IP protocol implementation.
//!
//! This module contains the wire structures and the sans-IO session logic.
//! Nothing here performs I/O, so it builds without `std`.
//!
//! - [`frame`]: header, HPAI, the [`Body`](frame::Body) enum and the
//!   `decode`/`encode` entry points
//! - [`services`]: one type per supported service
//! - [`dib`]: description information blocks
//! - [`session`]: connection phases, sequence counters, duplicate filter

pub mod constants;
pub mod dib;
pub mod frame;
pub mod services;
pub mod session;

pub use constants::{ServiceFamilyId, ServiceType, Status};
pub use frame::{decode, encode, encode_into, Body, ChannelAffinity, Direction, FrameBuf, Header, Hpai};
pub use session::{CloseCause, Inbound, Phase, Session};
