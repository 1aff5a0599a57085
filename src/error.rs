//! Error types for KNXnet/IP operations.
//!
//! Errors are grouped by category (protocol, connection, tunneling, transport,
//! addressing, usage). Each category is a struct wrapping a private kind and,
//! when the `std` feature is enabled, a backtrace. Callers inspect errors
//! through predicate methods instead of matching on kinds directly.
//!
//! The predicates answer the questions a caller actually has to decide on:
//!
//! - [`KnxError::is_timeout`]: nothing answered, retrying may help
//! - [`KnxError::rejection`]: the gateway answered with a non-success status
//! - [`KnxError::is_fatal`]: the session is gone, build a new client

use core::fmt;

#[cfg(feature = "std")]
use std::backtrace::Backtrace;

use crate::protocol::constants::Status;
use crate::protocol::session::CloseCause;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Length bounds
// =============================================================================

/// Expected length of a wire structure, reported by length-mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LengthBound {
    /// Exactly this many bytes
    Exact(usize),
    /// Inclusive range
    Range {
        /// Smallest accepted length
        min: usize,
        /// Largest accepted length
        max: usize,
    },
    /// At least this many bytes
    AtLeast(usize),
}

impl LengthBound {
    /// Check whether `len` satisfies the bound.
    pub const fn contains(self, len: usize) -> bool {
        match self {
            Self::Exact(n) => len == n,
            Self::Range { min, max } => len >= min && len <= max,
            Self::AtLeast(n) => len >= n,
        }
    }

    /// Fail with a length mismatch unless `actual` satisfies the bound.
    #[inline]
    pub(crate) fn check(self, actual: usize) -> Result<()> {
        if self.contains(actual) {
            Ok(())
        } else {
            Err(KnxError::length_mismatch(self, actual))
        }
    }
}

impl fmt::Display for LengthBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "exactly {n}"),
            Self::Range { min, max } => write!(f, "{min}..={max}"),
            Self::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Protocol error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ProtocolErrorKind {
    InvalidHeader,
    UnsupportedVersion(u8),
    UnsupportedServiceType(u16),
    LengthMismatch { expected: LengthBound, actual: usize },
    InvalidStructure,
    MissingDib(u8),
    CapacityExceeded,
    BufferTooSmall,
}

/// Connection error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ConnectionErrorKind {
    DescriptionNotReceived,
    TunnelingNotSupported,
    ChannelNotEstablished(Option<Status>),
    Rejected(Status),
    Closed(CloseCause),
}

/// Tunneling error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TunnelingErrorKind {
    AckTimeout { sequence: u8 },
    Rejected(Status),
    InboundDropped { sequence: u8 },
}

/// Transport error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TransportErrorKind {
    Bind,
    Send,
    Receive,
    Closed,
}

/// Addressing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum AddressingErrorKind {
    InvalidIndividualAddress,
    OutOfRange,
}

/// Caller misuse variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum UsageErrorKind {
    NoChannelAffinity,
    RequestInFlight,
    InvalidConfig(&'static str),
}

// =============================================================================
// Main Error Type
// =============================================================================

/// KNXnet/IP error type.
///
/// This is the error type returned by every fallible operation in the crate.
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub enum KnxError {
    /// Frame decoding and encoding errors (header, lengths, structures)
    Protocol(ProtocolError),
    /// Session lifecycle errors (describe, connect, closed session)
    Connection(ConnectionError),
    /// Tunneling exchange errors (ack timeout, rejected request)
    Tunneling(TunnelingError),
    /// Socket-level errors
    Transport(TransportError),
    /// Invalid address format or range
    Addressing(AddressingError),
    /// Caller misuse, rejected before anything reaches the network
    Usage(UsageError),
    /// A control request exhausted its retries without any response
    Timeout,
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// Protocol error.
///
/// Decoding errors are raised for every malformed datagram, so they do not
/// capture a backtrace.
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
}

impl ProtocolError {
    /// Check if this is a length mismatch
    pub fn is_length_mismatch(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::LengthMismatch { .. })
    }

    /// Check if this is an unsupported version error
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::UnsupportedVersion(_))
    }

    /// Check if the service type was not recognized
    pub fn is_unsupported_service_type(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::UnsupportedServiceType(_))
    }

    /// Check if a structure carried an invalid length or type byte
    pub fn is_invalid_structure(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::InvalidStructure)
    }

    /// Check if a mandatory DIB was missing from a description
    pub fn is_missing_dib(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::MissingDib(_))
    }
}

/// Connection error with optional backtrace
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl ConnectionError {
    pub(crate) fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// The gateway never answered the description request
    pub fn is_description_not_received(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::DescriptionNotReceived)
    }

    /// The gateway does not advertise the tunneling service family
    pub fn is_tunneling_not_supported(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::TunnelingNotSupported)
    }

    /// No tunnel channel could be established
    pub fn is_channel_not_established(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::ChannelNotEstablished(_))
    }

    /// The session is closed
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Closed(_))
    }

    /// Backtrace captured where the error was raised
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Tunneling error with optional backtrace
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub struct TunnelingError {
    kind: TunnelingErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl TunnelingError {
    pub(crate) fn new(kind: TunnelingErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// No matching acknowledgment arrived before retries ran out
    pub fn is_ack_timeout(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::AckTimeout { .. })
    }

    /// An inbound frame was acked but the application queue was full
    pub fn is_inbound_dropped(&self) -> bool {
        matches!(self.kind, TunnelingErrorKind::InboundDropped { .. })
    }

    /// Sequence number of the request that timed out or was dropped
    pub fn sequence(&self) -> Option<u8> {
        match self.kind {
            TunnelingErrorKind::AckTimeout { sequence }
            | TunnelingErrorKind::InboundDropped { sequence } => Some(sequence),
            TunnelingErrorKind::Rejected(_) => None,
        }
    }

    /// Backtrace captured where the error was raised
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Transport error with optional backtrace and I/O source
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub struct TransportError {
    kind: TransportErrorKind,
    #[cfg(feature = "std")]
    source: Option<std::io::Error>,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl TransportError {
    pub(crate) fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            source: None,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    #[cfg(feature = "std")]
    pub(crate) fn with_source(kind: TransportErrorKind, source: std::io::Error) -> Self {
        Self {
            kind,
            source: Some(source),
            backtrace: Backtrace::capture(),
        }
    }

    /// Binding the local socket failed
    pub fn is_bind_error(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Bind)
    }

    /// The transport was closed underneath us
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Closed)
    }

    /// Backtrace captured where the error was raised
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Addressing error with optional backtrace
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub struct AddressingError {
    kind: AddressingErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl AddressingError {
    pub(crate) fn new(kind: AddressingErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if address is out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, AddressingErrorKind::OutOfRange)
    }

    /// Backtrace captured where the error was raised
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Caller misuse error
#[derive(Debug)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
pub struct UsageError {
    kind: UsageErrorKind,
}

impl UsageError {
    /// The body has no channel it could be sent on
    pub fn is_no_channel_affinity(&self) -> bool {
        matches!(self.kind, UsageErrorKind::NoChannelAffinity)
    }

    /// A request of the same kind is already awaiting its response
    pub fn is_request_in_flight(&self) -> bool {
        matches!(self.kind, UsageErrorKind::RequestInFlight)
    }

    /// Configuration rejected, with the offending setting
    pub fn invalid_config(&self) -> Option<&'static str> {
        match self.kind {
            UsageErrorKind::InvalidConfig(key) => Some(key),
            _ => None,
        }
    }
}

// =============================================================================
// Convenience Constructors for KnxError
// =============================================================================

impl KnxError {
    // Protocol errors
    #[inline]
    pub(crate) const fn invalid_header() -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::InvalidHeader })
    }

    #[inline]
    pub(crate) const fn unsupported_version(version: u8) -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::UnsupportedVersion(version) })
    }

    #[inline]
    pub(crate) const fn unsupported_service_type(raw: u16) -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::UnsupportedServiceType(raw) })
    }

    #[inline]
    pub(crate) const fn length_mismatch(expected: LengthBound, actual: usize) -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::LengthMismatch { expected, actual } })
    }

    #[inline]
    pub(crate) const fn invalid_structure() -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::InvalidStructure })
    }

    #[inline]
    pub(crate) const fn missing_dib(dib_type: u8) -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::MissingDib(dib_type) })
    }

    #[inline]
    pub(crate) const fn capacity_exceeded() -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::CapacityExceeded })
    }

    #[inline]
    pub(crate) const fn buffer_too_small() -> Self {
        Self::Protocol(ProtocolError { kind: ProtocolErrorKind::BufferTooSmall })
    }

    // Connection errors
    pub(crate) fn description_not_received() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::DescriptionNotReceived))
    }

    pub(crate) fn tunneling_not_supported() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::TunnelingNotSupported))
    }

    pub(crate) fn channel_not_established(last_status: Option<Status>) -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::ChannelNotEstablished(
            last_status,
        )))
    }

    pub(crate) fn rejected(status: Status) -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Rejected(status)))
    }

    pub(crate) fn closed(cause: CloseCause) -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Closed(cause)))
    }

    // Tunneling errors
    pub(crate) fn ack_timeout(sequence: u8) -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::AckTimeout { sequence }))
    }

    pub(crate) fn tunneling_rejected(status: Status) -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::Rejected(status)))
    }

    pub(crate) fn inbound_dropped(sequence: u8) -> Self {
        Self::Tunneling(TunnelingError::new(TunnelingErrorKind::InboundDropped { sequence }))
    }

    // Transport errors
    #[cfg(feature = "std")]
    pub(crate) fn bind_failed(source: std::io::Error) -> Self {
        Self::Transport(TransportError::with_source(TransportErrorKind::Bind, source))
    }

    #[cfg(feature = "std")]
    pub(crate) fn send_failed(source: std::io::Error) -> Self {
        Self::Transport(TransportError::with_source(TransportErrorKind::Send, source))
    }

    #[cfg(feature = "std")]
    pub(crate) fn receive_failed(source: std::io::Error) -> Self {
        Self::Transport(TransportError::with_source(TransportErrorKind::Receive, source))
    }

    pub(crate) fn transport_closed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Closed))
    }

    // Addressing errors
    pub(crate) fn invalid_individual_address() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidIndividualAddress))
    }

    pub(crate) fn address_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::OutOfRange))
    }

    // Usage errors
    pub(crate) const fn no_channel_affinity() -> Self {
        Self::Usage(UsageError { kind: UsageErrorKind::NoChannelAffinity })
    }

    pub(crate) const fn request_in_flight() -> Self {
        Self::Usage(UsageError { kind: UsageErrorKind::RequestInFlight })
    }

    pub(crate) const fn invalid_config(key: &'static str) -> Self {
        Self::Usage(UsageError { kind: UsageErrorKind::InvalidConfig(key) })
    }
}

// =============================================================================
// Classification
// =============================================================================

impl KnxError {
    /// No response arrived within the retry budget.
    ///
    /// Covers both control requests and tunneling acknowledgments; the session
    /// is still usable.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Tunneling(e) => e.is_ack_timeout(),
            _ => false,
        }
    }

    /// Status code of a protocol-level rejection, if this is one.
    pub fn rejection(&self) -> Option<Status> {
        match self {
            Self::Connection(ConnectionError { kind: ConnectionErrorKind::Rejected(s), .. })
            | Self::Tunneling(TunnelingError { kind: TunnelingErrorKind::Rejected(s), .. }) => {
                Some(*s)
            }
            Self::Connection(ConnectionError {
                kind: ConnectionErrorKind::ChannelNotEstablished(s),
                ..
            }) => *s,
            _ => None,
        }
    }

    /// The session cannot be used anymore.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection(e) => !matches!(e.kind, ConnectionErrorKind::Rejected(_)),
            Self::Transport(_) => true,
            _ => false,
        }
    }

    /// The operation failed because the client is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Connection(e) if e.is_closed())
    }

    /// Why the session closed, for errors raised by a closed client.
    pub fn close_cause(&self) -> Option<CloseCause> {
        match self {
            Self::Connection(ConnectionError { kind: ConnectionErrorKind::Closed(c), .. }) => {
                Some(*c)
            }
            _ => None,
        }
    }

    /// Expected bound and actual length of a length-mismatch error.
    pub fn length_mismatch_details(&self) -> Option<(LengthBound, usize)> {
        match self {
            Self::Protocol(ProtocolError {
                kind: ProtocolErrorKind::LengthMismatch { expected, actual },
            }) => Some((*expected, *actual)),
            _ => None,
        }
    }

    /// Check if this is a length-mismatch decoding error
    pub fn is_length_mismatch(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_length_mismatch())
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version 0x{v:02X}"),
            Self::UnsupportedServiceType(t) => write!(f, "unsupported service type 0x{t:04X}"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "length mismatch: expected {expected}, got {actual}")
            }
            Self::InvalidStructure => write!(f, "invalid structure"),
            Self::MissingDib(t) => write!(f, "missing mandatory DIB 0x{t:02X}"),
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
        }
    }
}

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Protocol(e) => write!(f, "Protocol error: {}", e.kind),
            KnxError::Connection(e) => write!(f, "Connection error: {:?}", e.kind),
            KnxError::Tunneling(e) => write!(f, "Tunneling error: {:?}", e.kind),
            KnxError::Transport(e) => write!(f, "Transport error: {:?}", e.kind),
            KnxError::Addressing(e) => write!(f, "Addressing error: {:?}", e.kind),
            KnxError::Usage(e) => write!(f, "Usage error: {:?}", e.kind),
            KnxError::Timeout => write!(f, "Operation timeout"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for KnxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KnxError::Transport(e) => e
                .source
                .as_ref()
                .map(|io| io as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_bound_contains() {
        assert!(LengthBound::Exact(8).contains(8));
        assert!(!LengthBound::Exact(8).contains(9));
        assert!(LengthBound::Range { min: 11, max: 255 }.contains(11));
        assert!(!LengthBound::Range { min: 11, max: 255 }.contains(256));
        assert!(LengthBound::AtLeast(2).contains(200));
        assert!(!LengthBound::AtLeast(2).contains(1));
    }

    #[test]
    fn test_length_mismatch_details() {
        let err = LengthBound::Exact(10).check(11).unwrap_err();
        assert!(err.is_length_mismatch());
        assert_eq!(err.length_mismatch_details(), Some((LengthBound::Exact(10), 11)));
    }

    #[test]
    fn test_classification() {
        assert!(KnxError::Timeout.is_timeout());
        assert!(KnxError::ack_timeout(5).is_timeout());
        assert!(!KnxError::ack_timeout(5).is_fatal());

        let rejected = KnxError::tunneling_rejected(Status::SequenceNumber);
        assert_eq!(rejected.rejection(), Some(Status::SequenceNumber));
        assert!(!rejected.is_fatal());

        let not_established = KnxError::channel_not_established(Some(Status::NoMoreConnections));
        assert!(not_established.is_fatal());
        assert_eq!(not_established.rejection(), Some(Status::NoMoreConnections));

        let closed = KnxError::closed(CloseCause::ConnectionStateTimeout);
        assert!(closed.is_closed());
        assert!(closed.is_fatal());
        assert_eq!(closed.close_cause(), Some(CloseCause::ConnectionStateTimeout));
    }

    #[test]
    fn test_inbound_dropped() {
        let err = KnxError::inbound_dropped(9);
        assert!(matches!(err, KnxError::Tunneling(ref e) if e.is_inbound_dropped() && e.sequence() == Some(9)));
        assert!(!err.is_timeout());
        assert!(!err.is_fatal());
    }

    #[test]
    #[cfg(feature = "std")]
    fn test_backtrace_accessors() {
        let KnxError::Tunneling(tunneling) = KnxError::ack_timeout(1) else {
            panic!("expected a tunneling error");
        };
        let KnxError::Transport(transport) = KnxError::transport_closed() else {
            panic!("expected a transport error");
        };
        let KnxError::Addressing(addressing) = KnxError::address_out_of_range() else {
            panic!("expected an addressing error");
        };
        // capture is controlled by RUST_BACKTRACE; only the status is stable
        let _ = tunneling.backtrace().status();
        let _ = transport.backtrace().status();
        let _ = addressing.backtrace().status();
    }

    #[test]
    fn test_display() {
        let err = KnxError::length_mismatch(LengthBound::Range { min: 11, max: 255 }, 3);
        assert_eq!(
            format!("{err}"),
            "Protocol error: length mismatch: expected 11..=255, got 3"
        );
    }
}
