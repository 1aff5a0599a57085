//! Unified logging macro for the crate.
//!
//! `knx_log!` selects the logging backend at compile time:
//!
//! - `std` (default): the `log` facade, so applications choose any logger
//! - `no_std` with the `defmt` feature: `defmt`
//! - `no_std` without `defmt`: still the `log` facade
//!
//! # Usage
//!
//! ```rust,ignore
//! knx_log!(info, "Tunnel established on channel {}", channel_id);
//! knx_log!(debug, "Retry {}/{}", attempt, attempts);
//! knx_log!(warn, "Discarding malformed frame");
//! ```

/// Unified logging macro - selects `log::` or `defmt::` based on features.
///
/// Crate-internal; `lib.rs` declares this module first so every module sees it.
#[cfg(not(all(feature = "defmt", not(feature = "std"))))]
macro_rules! knx_log {
    (info, $($arg:tt)*) => { ::log::info!($($arg)*) };
    (debug, $($arg:tt)*) => { ::log::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { ::log::warn!($($arg)*) };
    (error, $($arg:tt)*) => { ::log::error!($($arg)*) };
    (trace, $($arg:tt)*) => { ::log::trace!($($arg)*) };
}

#[cfg(all(feature = "defmt", not(feature = "std")))]
macro_rules! knx_log {
    (info, $($arg:tt)*) => { ::defmt::info!($($arg)*) };
    (debug, $($arg:tt)*) => { ::defmt::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { ::defmt::warn!($($arg)*) };
    (error, $($arg:tt)*) => { ::defmt::error!($($arg)*) };
    (trace, $($arg:tt)*) => { ::defmt::trace!($($arg)*) };
}
