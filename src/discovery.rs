//! KNXnet/IP gateway discovery.
//!
//! Discovery sends a `SEARCH_REQUEST` to the KNXnet/IP multicast group
//! (or to a unicast address) and collects every `SEARCH_RESPONSE` until
//! the timeout elapses.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                            Gateway(s)
//!   |------- SEARCH_REQUEST -------->| (multicast 224.0.23.12:3671)
//!   |<------ SEARCH_RESPONSE --------| (unicast, one per gateway)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use knx_tunnel::discovery::discover;
//!
//! # async fn run() -> knx_tunnel::Result<()> {
//! for gateway in discover(Duration::from_secs(3)).await? {
//!     println!("{} at {}", gateway.device.friendly_name(), gateway.control_endpoint);
//! }
//! # Ok(())
//! # }
//! ```

use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use tokio::time::Instant;

use crate::error::Result;
use crate::net::{Transport, UdpTransport};
use crate::protocol::constants::{ServiceFamilyId, KNXNETIP_MULTICAST_ENDPOINT, MAX_FRAME_SIZE};
use crate::protocol::dib::{DeviceInfo, SupportedFamilies};
use crate::protocol::frame::{self, Body, Hpai};
use crate::protocol::services::SearchRequest;

/// Multicast hop limit for search requests
const SEARCH_TTL: u32 = 16;

/// A gateway that answered a search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    /// Control endpoint to connect to
    pub control_endpoint: SocketAddrV4,
    /// Address the response came from
    pub source: SocketAddrV4,
    /// Device information block
    pub device: DeviceInfo,
    /// Supported service families
    pub families: SupportedFamilies,
}

impl Gateway {
    /// Whether the gateway offers tunneling
    pub fn supports_tunneling(&self) -> bool {
        self.families.supports(ServiceFamilyId::Tunneling)
    }
}

/// Search the local network through the multicast group.
pub async fn discover(timeout: Duration) -> Result<Vec<Gateway>> {
    let transport = UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    transport.set_multicast_ttl(SEARCH_TTL)?;
    discover_with(&transport, KNXNETIP_MULTICAST_ENDPOINT, Hpai::NAT, timeout).await
}

/// Send one search request to `target` and collect responses for `timeout`.
///
/// `reply_to` is the HPAI placed in the request; [`Hpai::NAT`] asks the
/// gateways to answer to the datagram source. Responses are de-duplicated
/// by control endpoint. Datagrams that are not search responses are
/// skipped.
pub async fn discover_with<T: Transport>(
    transport: &T,
    target: SocketAddrV4,
    reply_to: Hpai,
    timeout: Duration,
) -> Result<Vec<Gateway>> {
    let request = frame::encode(&SearchRequest::new(reply_to).into())?;
    transport.send_to(&request, target).await?;
    knx_log!(debug, "Search request sent to {}", target);

    let deadline = Instant::now() + timeout;
    let mut gateways: Vec<Gateway> = Vec::new();
    let mut buf = [0u8; MAX_FRAME_SIZE];

    while let Ok(received) = tokio::time::timeout_at(deadline, transport.recv_from(&mut buf)).await {
        let (len, source) = received?;
        let response = match frame::decode(&buf[..len]) {
            Ok(Body::SearchResponse(response)) => response,
            Ok(other) => {
                knx_log!(debug, "Ignoring {:?} from {}", other.service_type(), source);
                continue;
            }
            Err(e) => {
                knx_log!(warn, "Discarding datagram from {}: {}", source, e);
                continue;
            }
        };

        let hpai = response.control_endpoint();
        let control_endpoint = if hpai.is_nat() { source } else { hpai.endpoint() };
        if gateways.iter().any(|g| g.control_endpoint == control_endpoint) {
            continue;
        }
        let gateway = Gateway {
            control_endpoint,
            source,
            device: response.device().clone(),
            families: response.families().clone(),
        };
        knx_log!(
            info,
            "Found gateway {} at {}",
            gateway.device.friendly_name().as_str(),
            control_endpoint
        );
        gateways.push(gateway);
    }

    Ok(gateways)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock_pair;
    use crate::protocol::dib::tests::{sample_device, sample_families};
    use crate::protocol::services::SearchResponse;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_and_dedups() {
        let (transport, mut peer) = mock_pair(addr("10.0.0.2:50000"), addr("10.0.0.1:3671"));
        let response = SearchResponse::new(
            Hpai::udp(addr("10.0.0.1:3671")),
            sample_device(),
            sample_families(),
        )
        .unwrap();

        peer.send_body(&response.clone().into()).unwrap();
        peer.send_body(&response.into()).unwrap();
        peer.send(&[0x06, 0x10, 0x02, 0x02, 0x00]);

        let gateways = discover_with(&transport, KNXNETIP_MULTICAST_ENDPOINT, Hpai::NAT, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].control_endpoint, addr("10.0.0.1:3671"));
        assert!(gateways[0].supports_tunneling());

        let (sent, target) = peer.recv().await.unwrap();
        assert_eq!(target, KNXNETIP_MULTICAST_ENDPOINT);
        assert_eq!(frame::decode(&sent).unwrap(), Body::from(SearchRequest::new(Hpai::NAT)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nat_response_uses_source() {
        let (transport, peer) = mock_pair(addr("10.0.0.2:50000"), addr("10.0.0.9:3671"));
        let response = SearchResponse::new(Hpai::NAT, sample_device(), sample_families()).unwrap();
        peer.send_body(&response.into()).unwrap();

        let gateways = discover_with(&transport, addr("10.0.0.9:3671"), Hpai::NAT, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(gateways[0].control_endpoint, addr("10.0.0.9:3671"));
        assert_eq!(gateways[0].source, addr("10.0.0.9:3671"));
    }
}
