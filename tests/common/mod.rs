//! Scripted gateway for scenario tests.
//!
//! The client runs over two `MockTransport`s; the test holds the matching
//! `MockPeer`s and plays the gateway side by hand, one frame at a time.

#![allow(dead_code, reason = "each test binary uses a subset of the helpers")]

use core::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use knx_tunnel::addressing::IndividualAddress;
use knx_tunnel::error::KnxError;
use knx_tunnel::listener::Listener;
use knx_tunnel::net::{mock_pair, ChannelRole, MockPeer, MockTransport};
use knx_tunnel::protocol::dib::{Description, DeviceInfo, SupportedFamilies};
use knx_tunnel::protocol::frame::{Body, Hpai};
use knx_tunnel::protocol::services::{
    Cemi, ConnectResponse, Crd, DescriptionResponse, TunnelingAck, TunnelingRequest,
};
use knx_tunnel::protocol::session::Phase;
use knx_tunnel::protocol::{ServiceFamilyId, ServiceType, Status};
use knx_tunnel::{ClientBuilder, ClientConfig, KnxClient};

/// Channel id the scripted gateway hands out
pub const CHANNEL: u8 = 7;

/// L_Data.ind, GroupValueWrite 1/0/1 = ON
pub const CEMI: [u8; 11] = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x08, 0x01, 0x01, 0x00, 0x81];

pub fn gateway_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671)
}

pub fn config() -> ClientConfig {
    ClientConfig::with_gateway(gateway_addr()).with_nat(true)
}

pub fn cemi() -> Cemi {
    Cemi::new(&CEMI).unwrap()
}

pub fn description(families: &[(ServiceFamilyId, u8)]) -> Body {
    let device = DeviceInfo::new(
        0x02,
        0x00,
        IndividualAddress::new(1, 1, 0).unwrap(),
        0x0000,
        [0x00, 0xFA, 0x00, 0x00, 0x00, 0x01],
        Ipv4Addr::new(224, 0, 23, 12),
        [0x00, 0x24, 0x6D, 0x00, 0x00, 0x01],
        b"Scripted gateway",
    );
    let families = SupportedFamilies::new(families).unwrap();
    DescriptionResponse::new(Description::new(device, families)).into()
}

pub fn tunneling_description() -> Body {
    description(&[(ServiceFamilyId::Core, 1), (ServiceFamilyId::Tunneling, 1)])
}

pub fn accepted() -> Body {
    let crd = Crd::tunnel(IndividualAddress::new(1, 1, 250).unwrap());
    ConnectResponse::accepted(CHANNEL, Hpai::NAT, crd).into()
}

pub fn inbound(sequence: u8) -> Body {
    TunnelingRequest::new(CHANNEL, sequence, cemi()).unwrap().into()
}

pub fn ack(sequence: u8) -> Body {
    TunnelingAck::new(CHANNEL, sequence, Status::NoError).into()
}

/// Gateway side of both channels.
pub struct Gateway {
    pub control: MockPeer,
    pub data: MockPeer,
}

impl Gateway {
    pub async fn expect_control(&mut self) -> Body {
        self.control.recv_body().await.expect("control channel closed")
    }

    pub async fn expect_data(&mut self) -> Body {
        self.data.recv_body().await.expect("data channel closed")
    }

    /// Answer the description request and accept the connect request.
    pub async fn accept(&mut self) {
        let body = self.expect_control().await;
        assert!(matches!(body, Body::DescriptionRequest(_)), "got {body:?}");
        self.control.send_body(&tunneling_description()).unwrap();

        let body = self.expect_control().await;
        assert!(matches!(body, Body::ConnectRequest(_)), "got {body:?}");
        self.control.send_body(&accepted()).unwrap();
    }

    /// Every control frame already queued, decoded
    pub fn drain_control(&mut self) -> Vec<Body> {
        let mut bodies = Vec::new();
        while let Some((bytes, _)) = self.control.try_recv() {
            bodies.push(knx_tunnel::decode(&bytes).unwrap());
        }
        bodies
    }
}

pub fn transports() -> (MockTransport, MockTransport, Gateway) {
    let (control, control_peer) = mock_pair("192.168.1.20:50000".parse().unwrap(), gateway_addr());
    let (data, data_peer) = mock_pair("192.168.1.20:50001".parse().unwrap(), gateway_addr());
    let gateway = Gateway {
        control: control_peer,
        data: data_peer,
    };
    (control, data, gateway)
}

/// Connect a client through the scripted gateway.
pub async fn connect(builder: ClientBuilder) -> (KnxClient<MockTransport>, Gateway) {
    let (control, data, mut gateway) = transports();
    let (client, ()) = tokio::join!(builder.connect_with(control, data), gateway.accept());
    (client.unwrap(), gateway)
}

/// Listener that records everything it sees.
#[derive(Default)]
pub struct Recorder {
    pub phases: Mutex<Vec<(Phase, Phase)>>,
    pub sent: Mutex<Vec<(ChannelRole, ServiceType)>>,
    pub received: Mutex<Vec<(ChannelRole, ServiceType)>>,
    pub errors: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phases(&self) -> Vec<(Phase, Phase)> {
        self.phases.lock().unwrap().clone()
    }

    pub fn sent(&self, service: ServiceType) -> usize {
        self.sent.lock().unwrap().iter().filter(|(_, s)| *s == service).count()
    }
}

impl Listener for Recorder {
    fn frame_received(&self, role: ChannelRole, body: &Body) {
        self.received.lock().unwrap().push((role, body.service_type()));
    }

    fn frame_sent(&self, role: ChannelRole, body: &Body) {
        self.sent.lock().unwrap().push((role, body.service_type()));
    }

    fn phase_changed(&self, from: Phase, to: Phase) {
        self.phases.lock().unwrap().push((from, to));
    }

    fn error(&self, error: &KnxError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}
