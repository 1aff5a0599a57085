#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![doc = include_str!("../README.md")]

//! ## Crate layout
//!
//! - [`protocol`]: frame codec and the sans-IO [`Session`](protocol::Session),
//!   available without `std`
//! - [`addressing`]: KNX individual addresses
//! - [`error`]: the [`KnxError`] type
//! - `client`, [`net`], [`listener`], [`discovery`], [`config`]: the tokio
//!   client (feature `std`, on by default)

// Must come first so every module sees `knx_log!`
#[macro_use]
mod logging;

pub mod addressing;
pub mod error;
pub mod protocol;

#[cfg(feature = "std")]
pub mod client;
#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod discovery;
#[cfg(feature = "std")]
pub mod listener;
#[cfg(feature = "std")]
pub mod net;

// Re-export commonly used types
#[doc(inline)]
pub use addressing::IndividualAddress;
#[doc(inline)]
pub use error::{KnxError, LengthBound, Result};
#[doc(inline)]
pub use protocol::{decode, encode, Body, CloseCause, Phase, Status};
#[doc(inline)]
pub use protocol::services::Cemi;

#[cfg(feature = "std")]
#[doc(inline)]
pub use client::{ClientBuilder, KnxClient};
#[cfg(feature = "std")]
#[doc(inline)]
pub use config::{Backoff, ClientConfig, RetryPolicy};
#[cfg(feature = "std")]
#[doc(inline)]
pub use listener::Listener;
