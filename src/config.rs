//! Client configuration.
//!
//! [`ClientConfig`] carries everything the client needs to know before it
//! opens a socket. It is handed to the client by value and never changes
//! for the lifetime of a session.
//!
//! Besides the builder-style setters, a configuration can be read from the
//! `KEY=VALUE` line format used for deployment files:
//!
//! ```text
//! KNX_GATEWAY_IP=192.168.1.10
//! KNX_GATEWAY_PORT=3671
//! KNX_NAT=true
//! KNX_HEARTBEAT_SECS=60
//! ```
//!
//! Unknown keys and `#` comments are ignored; a known key with a value that
//! does not parse is an error naming the key.

use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    CONNECTIONSTATE_ATTEMPTS, CONNECTIONSTATE_REQUEST_TIMEOUT_MS, CONNECTION_ALIVE_TIME_SECS,
    CONNECT_REQUEST_TIMEOUT_MS, DESCRIPTION_REQUEST_TIMEOUT_MS, HEARTBEAT_INTERVAL_SECS,
    KNXNETIP_DEFAULT_PORT, TUNNELING_ATTEMPTS, TUNNELING_REQUEST_TIMEOUT_MS,
};

/// How the per-attempt timeout evolves across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backoff {
    /// Same timeout for every attempt
    #[default]
    Fixed,
    /// Timeout doubles after every attempt
    Exponential,
}

/// Attempt count and per-attempt timeout for one request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Number of sends before giving up (at least 1)
    pub attempts: u8,
    /// Timeout of the first attempt
    pub timeout: Duration,
    /// Timeout growth
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed policy
    pub const fn fixed(attempts: u8, timeout: Duration) -> Self {
        Self { attempts, timeout, backoff: Backoff::Fixed }
    }

    /// Timeout for the zero-based `attempt`.
    pub fn timeout_for(&self, attempt: u8) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.timeout,
            Backoff::Exponential => self
                .timeout
                .checked_mul(1u32 << u32::from(attempt.min(16)))
                .unwrap_or(Duration::MAX),
        }
    }

    /// The same policy reduced to one attempt with the timeout of `attempt`.
    pub(crate) fn single(&self, attempt: u8) -> Self {
        Self::fixed(1, self.timeout_for(attempt))
    }
}

/// Client configuration.
///
/// # Examples
///
/// ```
/// use core::net::Ipv4Addr;
/// use std::time::Duration;
/// use knx_tunnel::ClientConfig;
///
/// let config = ClientConfig::new(Ipv4Addr::new(192, 168, 1, 10))
///     .with_nat(true)
///     .with_heartbeat(Duration::from_secs(30), Duration::from_secs(90));
/// assert_eq!(config.gateway.port(), 3671);
/// assert_eq!(config.heartbeat_miss_limit(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Gateway control endpoint
    pub gateway: SocketAddrV4,
    /// Local interface address; `None` binds to all interfaces and
    /// advertises route-back endpoints
    pub local_ip: Option<Ipv4Addr>,
    /// Advertise `0.0.0.0:0` endpoints so the gateway answers to the
    /// datagram source (needed behind NAT)
    pub nat: bool,
    /// Ask for the gateway description before connecting
    pub describe_first: bool,
    /// Description request policy
    pub description: RetryPolicy,
    /// Connect request policy
    pub connect: RetryPolicy,
    /// Connection-state request policy (one heartbeat probe)
    pub connection_state: RetryPolicy,
    /// Disconnect request policy
    pub disconnect: RetryPolicy,
    /// Tunneling request policy (ack wait)
    pub tunneling: RetryPolicy,
    /// Time between heartbeat probes
    pub heartbeat_interval: Duration,
    /// How long the connection may go without a successful probe
    pub alive_timeout: Duration,
    /// Receive timeout of the control channel
    pub control_recv_timeout: Duration,
    /// Receive timeout of the data channel
    pub data_recv_timeout: Duration,
    /// Inbound cEMI frames buffered for the application
    pub inbound_capacity: usize,
}

impl ClientConfig {
    /// Defaults for a gateway at `gateway_ip:3671`.
    pub fn new(gateway_ip: Ipv4Addr) -> Self {
        Self::with_gateway(SocketAddrV4::new(gateway_ip, KNXNETIP_DEFAULT_PORT))
    }

    /// Defaults for an explicit gateway endpoint.
    pub fn with_gateway(gateway: SocketAddrV4) -> Self {
        Self {
            gateway,
            local_ip: None,
            nat: false,
            describe_first: true,
            description: RetryPolicy::fixed(3, Duration::from_millis(DESCRIPTION_REQUEST_TIMEOUT_MS)),
            connect: RetryPolicy::fixed(3, Duration::from_millis(CONNECT_REQUEST_TIMEOUT_MS)),
            connection_state: RetryPolicy::fixed(
                CONNECTIONSTATE_ATTEMPTS,
                Duration::from_millis(CONNECTIONSTATE_REQUEST_TIMEOUT_MS),
            ),
            disconnect: RetryPolicy::fixed(1, Duration::from_millis(CONNECTIONSTATE_REQUEST_TIMEOUT_MS)),
            tunneling: RetryPolicy::fixed(
                TUNNELING_ATTEMPTS,
                Duration::from_millis(TUNNELING_REQUEST_TIMEOUT_MS),
            ),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            alive_timeout: Duration::from_secs(CONNECTION_ALIVE_TIME_SECS),
            control_recv_timeout: Duration::from_secs(1),
            data_recv_timeout: Duration::from_secs(1),
            inbound_capacity: 64,
        }
    }

    /// Set the local interface address
    #[must_use]
    pub fn with_local_ip(mut self, local_ip: Ipv4Addr) -> Self {
        self.local_ip = Some(local_ip);
        self
    }

    /// Enable or disable NAT mode
    #[must_use]
    pub fn with_nat(mut self, nat: bool) -> Self {
        self.nat = nat;
        self
    }

    /// Enable or disable the description phase
    #[must_use]
    pub fn with_describe_first(mut self, describe_first: bool) -> Self {
        self.describe_first = describe_first;
        self
    }

    /// Set heartbeat interval and alive timeout
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, alive_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.alive_timeout = alive_timeout;
        self
    }

    /// Whether the client advertises route-back HPAIs
    pub fn uses_route_back(&self) -> bool {
        self.nat || self.local_ip.is_none()
    }

    /// Consecutive failed probes that end the session:
    /// `alive_timeout / heartbeat_interval`, rounded up, at least 1.
    pub fn heartbeat_miss_limit(&self) -> u8 {
        let interval = self.heartbeat_interval.as_millis().max(1);
        let limit = self.alive_timeout.as_millis().div_ceil(interval).max(1);
        u8::try_from(limit).unwrap_or(u8::MAX)
    }

    /// Reject settings the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        let policies = [
            ("description", &self.description),
            ("connect", &self.connect),
            ("connection_state", &self.connection_state),
            ("disconnect", &self.disconnect),
            ("tunneling", &self.tunneling),
        ];
        for (name, policy) in policies {
            if policy.attempts == 0 {
                return Err(KnxError::invalid_config(name));
            }
            if policy.timeout.is_zero() {
                return Err(KnxError::invalid_config(name));
            }
        }
        if self.heartbeat_interval.is_zero() {
            return Err(KnxError::invalid_config("heartbeat_interval"));
        }
        if self.control_recv_timeout.is_zero() || self.data_recv_timeout.is_zero() {
            return Err(KnxError::invalid_config("recv_timeout"));
        }
        if self.inbound_capacity == 0 {
            return Err(KnxError::invalid_config("inbound_capacity"));
        }
        Ok(())
    }

    /// Parse the `KEY=VALUE` format.
    ///
    /// `KNX_GATEWAY_IP` is required; every other key falls back to its
    /// default.
    pub fn from_kv_str(text: &str) -> Result<Self> {
        let gateway_ip = lookup(text, "KNX_GATEWAY_IP")
            .ok_or(KnxError::invalid_config("KNX_GATEWAY_IP"))
            .and_then(|v| parse_value::<Ipv4Addr>(v, "KNX_GATEWAY_IP"))?;
        let mut config = Self::new(gateway_ip);

        if let Some(v) = lookup(text, "KNX_GATEWAY_PORT") {
            config.gateway.set_port(parse_value(v, "KNX_GATEWAY_PORT")?);
        }
        if let Some(v) = lookup(text, "KNX_LOCAL_IP") {
            config.local_ip = Some(parse_value(v, "KNX_LOCAL_IP")?);
        }
        if let Some(v) = lookup(text, "KNX_NAT") {
            config.nat = parse_bool(v, "KNX_NAT")?;
        }
        if let Some(v) = lookup(text, "KNX_DESCRIBE_FIRST") {
            config.describe_first = parse_bool(v, "KNX_DESCRIBE_FIRST")?;
        }
        if let Some(v) = lookup(text, "KNX_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse_value(v, "KNX_HEARTBEAT_SECS")?);
        }
        if let Some(v) = lookup(text, "KNX_ALIVE_TIMEOUT_SECS") {
            config.alive_timeout = Duration::from_secs(parse_value(v, "KNX_ALIVE_TIMEOUT_SECS")?);
        }
        if let Some(v) = lookup(text, "KNX_CONNECT_TIMEOUT_MS") {
            config.connect.timeout = Duration::from_millis(parse_value(v, "KNX_CONNECT_TIMEOUT_MS")?);
        }
        if let Some(v) = lookup(text, "KNX_CONNECT_ATTEMPTS") {
            config.connect.attempts = parse_value(v, "KNX_CONNECT_ATTEMPTS")?;
        }
        if let Some(v) = lookup(text, "KNX_CONNSTATE_TIMEOUT_MS") {
            config.connection_state.timeout =
                Duration::from_millis(parse_value(v, "KNX_CONNSTATE_TIMEOUT_MS")?);
        }
        if let Some(v) = lookup(text, "KNX_CONNSTATE_ATTEMPTS") {
            config.connection_state.attempts = parse_value(v, "KNX_CONNSTATE_ATTEMPTS")?;
        }
        if let Some(v) = lookup(text, "KNX_TUNNELING_TIMEOUT_MS") {
            config.tunneling.timeout =
                Duration::from_millis(parse_value(v, "KNX_TUNNELING_TIMEOUT_MS")?);
        }
        if let Some(v) = lookup(text, "KNX_TUNNELING_ATTEMPTS") {
            config.tunneling.attempts = parse_value(v, "KNX_TUNNELING_ATTEMPTS")?;
        }
        if let Some(v) = lookup(text, "KNX_BACKOFF") {
            let backoff = match v {
                "fixed" => Backoff::Fixed,
                "exponential" => Backoff::Exponential,
                _ => return Err(KnxError::invalid_config("KNX_BACKOFF")),
            };
            for policy in [
                &mut config.description,
                &mut config.connect,
                &mut config.connection_state,
                &mut config.disconnect,
                &mut config.tunneling,
            ] {
                policy.backoff = backoff;
            }
        }
        if let Some(v) = lookup(text, "KNX_INBOUND_CAPACITY") {
            config.inbound_capacity = parse_value(v, "KNX_INBOUND_CAPACITY")?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Value of `key` in a `KEY=VALUE` text, trimmed. Last occurrence wins.
fn lookup<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
        .last()
}

fn parse_value<T: core::str::FromStr>(value: &str, key: &'static str) -> Result<T> {
    value.parse().ok().ok_or(KnxError::invalid_config(key))
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(KnxError::invalid_config(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new(Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(config.gateway, "192.168.1.10:3671".parse().unwrap());
        assert_eq!(config.connect.timeout, Duration::from_secs(10));
        assert_eq!(config.connection_state.attempts, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.alive_timeout, Duration::from_secs(120));
        assert_eq!(config.tunneling, RetryPolicy::fixed(2, Duration::from_secs(1)));
        assert_eq!(config.heartbeat_miss_limit(), 2);
        assert!(config.uses_route_back());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_miss_limit_rounds_up() {
        let config = ClientConfig::new(Ipv4Addr::LOCALHOST)
            .with_heartbeat(Duration::from_secs(50), Duration::from_secs(120));
        assert_eq!(config.heartbeat_miss_limit(), 3);

        let config = ClientConfig::new(Ipv4Addr::LOCALHOST)
            .with_heartbeat(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(config.heartbeat_miss_limit(), 1);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            attempts: 3,
            timeout: Duration::from_millis(100),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.timeout_for(0), Duration::from_millis(100));
        assert_eq!(policy.timeout_for(2), Duration::from_millis(400));
        assert_eq!(policy.single(1), RetryPolicy::fixed(1, Duration::from_millis(200)));
    }

    #[test]
    fn test_from_kv_str() {
        let text = "
            # gateway in the cabinet
            KNX_GATEWAY_IP=10.0.0.5
            KNX_GATEWAY_PORT=3672
            KNX_LOCAL_IP=10.0.0.20
            KNX_NAT=false
            KNX_HEARTBEAT_SECS=30
            KNX_ALIVE_TIMEOUT_SECS=90
            KNX_CONNECT_ATTEMPTS=5
            KNX_BACKOFF=exponential
            WIFI_NETWORK=ignored
        ";
        let config = ClientConfig::from_kv_str(text).unwrap();
        assert_eq!(config.gateway, "10.0.0.5:3672".parse().unwrap());
        assert_eq!(config.local_ip, Some(Ipv4Addr::new(10, 0, 0, 20)));
        assert!(!config.uses_route_back());
        assert_eq!(config.heartbeat_miss_limit(), 3);
        assert_eq!(config.connect.attempts, 5);
        assert_eq!(config.tunneling.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_from_kv_str_errors() {
        let err = ClientConfig::from_kv_str("KNX_NAT=true").unwrap_err();
        assert!(matches!(err, KnxError::Usage(ref e) if e.invalid_config() == Some("KNX_GATEWAY_IP")));

        let err = ClientConfig::from_kv_str("KNX_GATEWAY_IP=10.0.0.5\nKNX_GATEWAY_PORT=abc")
            .unwrap_err();
        assert!(matches!(err, KnxError::Usage(ref e) if e.invalid_config() == Some("KNX_GATEWAY_PORT")));

        let err = ClientConfig::from_kv_str("KNX_GATEWAY_IP=10.0.0.5\nKNX_CONNECT_ATTEMPTS=0")
            .unwrap_err();
        assert!(matches!(err, KnxError::Usage(ref e) if e.invalid_config() == Some("connect")));
    }
}
