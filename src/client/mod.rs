//! Async KNXnet/IP tunneling client.
//!
//! [`KnxClient`] drives a [`Session`] over two [`Transport`]s. Opening a
//! client runs the whole connection sequence:
//!
//! ```text
//!  client                                   gateway
//!    │── DESCRIPTION_REQUEST (optional) ──────▶│   DISCOVERING
//!    │◀─────────────── DESCRIPTION_RESPONSE ───│
//!    │── CONNECT_REQUEST ─────────────────────▶│   CONNECTING
//!    │◀─────────── CONNECT_RESPONSE (channel) ─│
//!    │                                         │   CONNECTED
//!    │── CONNECTIONSTATE_REQUEST (heartbeat) ─▶│
//!    │◀────────── CONNECTIONSTATE_RESPONSE ────│
//!    │── TUNNELING_REQUEST (data channel) ────▶│
//!    │◀──────────────────── TUNNELING_ACK ─────│
//!    │── DISCONNECT_REQUEST ──────────────────▶│   DISCONNECTING
//!    │◀──────────────── DISCONNECT_RESPONSE ───│   CLOSED
//! ```
//!
//! Once connected, two background tasks run next to the caller: the
//! dispatch task owns the receive side of both channels and routes every
//! frame, the heartbeat task probes the connection. Both stop when the
//! session closes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use core::net::Ipv4Addr;
//! use knx_tunnel::{ClientConfig, KnxClient};
//!
//! # async fn run() -> knx_tunnel::Result<()> {
//! let client = KnxClient::connect(ClientConfig::new(Ipv4Addr::new(192, 168, 1, 10))).await?;
//!
//! // GroupValueWrite 1/2/3 = ON
//! client
//!     .send_cemi(&[0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x81])
//!     .await?;
//!
//! while let Some(cemi) = client.recv_cemi().await {
//!     println!("{:02X?}", cemi.as_bytes());
//! }
//! # Ok(())
//! # }
//! ```

mod correlator;
mod dispatch;
mod heartbeat;
mod tunneling;

pub use correlator::RequestKind;

use core::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::addressing::IndividualAddress;
use crate::config::{ClientConfig, RetryPolicy};
use crate::error::{KnxError, Result};
use crate::listener::{Listener, ListenerSet};
use crate::net::{ChannelManager, ChannelRole, Transport, UdpTransport};
use crate::protocol::constants::Status;
use crate::protocol::dib::Description;
use crate::protocol::frame::{self, Body, Hpai};
use crate::protocol::services::{Cemi, ConnectRequest, DescriptionRequest};
use crate::protocol::session::{CloseCause, Phase, Session};

use correlator::Correlator;
use tunneling::AckSlot;

// =============================================================================
// Shared state
// =============================================================================

/// State shared by the client handle and its background tasks.
///
/// Locks are plain `std` mutexes and are never held across an `.await`.
pub(crate) struct Shared<T> {
    config: ClientConfig,
    channels: ChannelManager<T>,
    session: Mutex<Session>,
    phase_tx: watch::Sender<Phase>,
    correlator: Correlator,
    acks: AckSlot,
    listeners: ListenerSet,
    inbound_tx: Mutex<Option<mpsc::Sender<Cemi>>>,
    description: Mutex<Option<Description>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> Shared<T> {
    /// Fresh state in `Discovering`, plus the application end of the
    /// inbound queue.
    fn new(
        config: ClientConfig,
        listeners: ListenerSet,
        control: T,
        data: T,
    ) -> Result<(Self, mpsc::Receiver<Cemi>)> {
        let local_control = local_hpai(&config, &control)?;
        let local_data = local_hpai(&config, &data)?;
        let session = Session::new(local_control, local_data, config.gateway);
        let (phase_tx, _) = watch::channel(session.phase());
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let channels = ChannelManager::open(
            control,
            data,
            config.gateway,
            config.control_recv_timeout,
            config.data_recv_timeout,
        );

        let shared = Self {
            config,
            channels,
            session: Mutex::new(session),
            phase_tx,
            correlator: Correlator::new(),
            acks: AckSlot::new(),
            listeners,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            description: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        };
        Ok((shared, inbound_rx))
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owns_channel(&self, channel_id: u8) -> bool {
        self.session().owns_channel(channel_id)
    }

    /// Encode `body` and send it on the channel its service belongs to.
    ///
    /// Multicast-only bodies have no tunnel channel and are refused before
    /// encoding. A transport failure closes the session.
    async fn send(&self, body: &Body) -> Result<()> {
        let role = ChannelRole::for_affinity(body.affinity()).ok_or(KnxError::no_channel_affinity())?;
        let frame = frame::encode(body)?;
        if let Err(e) = self.channels.send(role, &frame).await {
            knx_log!(error, "Send on {:?} channel failed: {}", role, e);
            self.listeners.error(&e);
            self.close(CloseCause::TransportFailure);
            return Err(e);
        }
        knx_log!(debug, "Sent {:?} on {:?} channel", body.service_type(), role);
        self.listeners.frame_sent(role, body);
        Ok(())
    }

    /// Send a control request and wait for its response under `policy`.
    ///
    /// `Ok(None)` means every attempt went unanswered.
    async fn request(&self, kind: RequestKind, body: Body, policy: RetryPolicy) -> Result<Option<Body>> {
        let mut pending = self.correlator.begin(kind, body.clone())?;
        for attempt in 0..policy.attempts {
            pending.stamp()?;
            self.send(&body).await?;
            if let Some(response) = pending.await_response(policy.timeout_for(attempt)).await? {
                return Ok(Some(response));
            }
            knx_log!(
                debug,
                "{:?} request unanswered (attempt {}/{})",
                kind,
                attempt + 1,
                policy.attempts
            );
        }
        if let Some(request) = self.correlator.in_flight(kind) {
            knx_log!(warn, "No response to {:?} after {} attempts", request.service_type(), policy.attempts);
        }
        Ok(None)
    }

    /// Publish a phase change to watchers and listeners. Entering `Closed`
    /// fails every pending wait and ends inbound delivery.
    ///
    /// Watchers get the session's phase as of now, read under the session
    /// lock, so a change applied late cannot move the watch backwards.
    fn apply(&self, change: Option<(Phase, Phase)>) {
        let Some((from, to)) = change else {
            return;
        };
        let cause = {
            let session = self.session();
            self.phase_tx.send_replace(session.phase());
            session.close_cause()
        };
        knx_log!(info, "Phase {} -> {}", from, to);
        self.listeners.phase_changed(from, to);

        if to.is_closed() {
            let cause = cause.unwrap_or(CloseCause::Dropped);
            knx_log!(info, "Session closed: {:?}", cause);
            self.correlator.close(cause);
            self.acks.close(cause);
            self.inbound_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }

    /// Close the session with `cause` unless it is already closed.
    fn close(&self, cause: CloseCause) {
        let change = self.session().close(cause);
        self.apply(change);
    }

    async fn wait_closed(&self) {
        let mut phase = self.phase_tx.subscribe();
        let _ = phase.wait_for(|p| p.is_closed()).await;
    }

    /// DISCOVERING → CONNECTING → CONNECTED.
    async fn establish(&self) -> Result<()> {
        if self.config.describe_first {
            self.describe().await?;
        }

        let change = self.session().advance(Phase::Connecting);
        self.apply(change);

        let (control, data) = {
            let session = self.session();
            (session.local_control(), session.local_data())
        };
        let request = Body::from(ConnectRequest::tunnel(control, data));
        let policy = self.config.connect;
        let mut last_status = None;

        for attempt in 0..policy.attempts {
            let response = self
                .request(RequestKind::Connect, request.clone(), policy.single(attempt))
                .await?;
            let Some(Body::ConnectResponse(response)) = response else {
                knx_log!(debug, "Connect attempt {}/{} unanswered", attempt + 1, policy.attempts);
                continue;
            };
            if !response.status().is_ok() {
                knx_log!(
                    warn,
                    "Connect attempt {}/{} rejected: {:?}",
                    attempt + 1,
                    policy.attempts,
                    response.status()
                );
                last_status = Some(response.status());
                continue;
            }

            let outcome = self.session().establish(&response);
            let change = outcome?;
            let (remote_data, address) = {
                let session = self.session();
                (session.remote_data(), session.tunnel_address())
            };
            if let Some(remote_data) = remote_data {
                self.channels.channel(ChannelRole::Data).retarget(remote_data);
            }
            knx_log!(
                info,
                "Tunnel established: channel {}, address {:?}",
                response.channel_id(),
                address
            );
            self.apply(Some(change));
            return Ok(());
        }

        knx_log!(error, "Channel not established after {} attempts", policy.attempts);
        self.close(CloseCause::ChannelNotEstablished);
        Err(KnxError::channel_not_established(last_status))
    }

    async fn describe(&self) -> Result<()> {
        let local_control = self.session().local_control();
        let request = Body::from(DescriptionRequest::new(local_control));
        let response = self
            .request(RequestKind::Description, request, self.config.description)
            .await?;

        let Some(Body::DescriptionResponse(response)) = response else {
            knx_log!(error, "Gateway did not describe itself");
            self.close(CloseCause::DescriptionNotReceived);
            return Err(KnxError::description_not_received());
        };
        let description = response.into_description();
        let tunneling = description.supports_tunneling();
        *self.description.lock().unwrap_or_else(PoisonError::into_inner) = Some(description);

        if !tunneling {
            knx_log!(error, "Gateway does not offer tunneling");
            self.close(CloseCause::TunnelingNotSupported);
            return Err(KnxError::tunneling_not_supported());
        }
        Ok(())
    }

    /// One connection-state probe. Records the outcome in the session.
    async fn probe(&self) -> Result<Status> {
        let request = self.session().connection_state_request()?;
        let response = self
            .request(RequestKind::ConnectionState, request.into(), self.config.connection_state)
            .await?;
        let status = match response {
            Some(Body::ConnectionStateResponse(response)) => Some(response.status()),
            _ => None,
        };
        let misses = self.session().record_heartbeat(status);
        match status {
            Some(Status::NoError) => Ok(Status::NoError),
            Some(status) => {
                knx_log!(warn, "Connection state {:?} ({} consecutive misses)", status, misses);
                Err(KnxError::rejected(status))
            }
            None => {
                knx_log!(warn, "Connection state unanswered ({} consecutive misses)", misses);
                Err(KnxError::Timeout)
            }
        }
    }

    /// CONNECTED → DISCONNECTING → CLOSED.
    ///
    /// Closing is unconditional: an unanswered disconnect request still
    /// ends the session.
    async fn disconnect(&self, cause: CloseCause) -> Result<()> {
        let step = {
            let mut session = self.session();
            match session.phase() {
                Phase::Closed => return Ok(()),
                Phase::Disconnecting => Teardown::AwaitClosed,
                Phase::Discovering | Phase::Connecting => Teardown::CloseNow,
                Phase::Connected => {
                    let request = session.disconnect_request()?;
                    Teardown::Request(request.into(), session.advance(Phase::Disconnecting))
                }
            }
        };

        let (request, change) = match step {
            Teardown::AwaitClosed => {
                self.wait_closed().await;
                return Ok(());
            }
            Teardown::CloseNow => {
                self.close(cause);
                return Ok(());
            }
            Teardown::Request(request, change) => (request, change),
        };
        self.apply(change);

        let result = self
            .request(RequestKind::Disconnect, request, self.config.disconnect)
            .await;
        self.close(cause);
        match result {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                knx_log!(warn, "Disconnect unanswered, closing anyway");
                Ok(())
            }
            Err(e) if e.is_closed() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

enum Teardown {
    AwaitClosed,
    CloseNow,
    Request(Body, Option<(Phase, Phase)>),
}

// =============================================================================
// Builder
// =============================================================================

/// Client configuration plus listeners, ready to connect.
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
    listeners: ListenerSet,
}

impl ClientBuilder {
    /// Start from `config` with no listeners.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            listeners: ListenerSet::new(),
        }
    }

    /// Register a listener. Fails past [`MAX_LISTENERS`](crate::listener::MAX_LISTENERS).
    pub fn listener(mut self, listener: impl Listener + 'static) -> Result<Self> {
        self.listeners.push(Arc::new(listener))?;
        Ok(self)
    }

    /// Bind two UDP sockets and connect.
    pub async fn connect(self) -> Result<KnxClient<UdpTransport>> {
        let bind = SocketAddrV4::new(self.config.local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED), 0);
        let control = UdpTransport::bind(bind).await?;
        let data = UdpTransport::bind(bind).await?;
        self.connect_with(control, data).await
    }

    /// Connect over caller-supplied transports.
    pub async fn connect_with<T: Transport>(self, control: T, data: T) -> Result<KnxClient<T>> {
        let Self { config, listeners } = self;
        config.validate()?;

        knx_log!(info, "Connecting to {}", config.gateway);
        let (shared, inbound_rx) = Shared::new(config, listeners, control, data)?;
        let shared = Arc::new(shared);

        let dispatch = tokio::spawn(dispatch::run(Arc::clone(&shared)));
        if let Err(e) = shared.establish().await {
            shared.close(CloseCause::ChannelNotEstablished);
            shared.listeners.error(&e);
            dispatch.abort();
            return Err(e);
        }
        let heartbeat = tokio::spawn(heartbeat::run(Arc::clone(&shared)));

        Ok(KnxClient {
            shared,
            dispatch,
            heartbeat,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        })
    }
}

/// HPAI the client advertises for a transport.
fn local_hpai<T: Transport>(config: &ClientConfig, transport: &T) -> Result<Hpai> {
    if config.uses_route_back() {
        return Ok(Hpai::NAT);
    }
    let ip = config.local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
    Ok(Hpai::udp(SocketAddrV4::new(ip, transport.local_addr()?.port())))
}

// =============================================================================
// Client handle
// =============================================================================

/// Connected KNXnet/IP tunneling client.
///
/// Dropping the client stops its background tasks without any network
/// traffic; call [`disconnect`](Self::disconnect) first for an orderly
/// teardown.
pub struct KnxClient<T: Transport = UdpTransport> {
    shared: Arc<Shared<T>>,
    dispatch: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Cemi>>,
}

impl KnxClient<UdpTransport> {
    /// Connect to the gateway in `config` over UDP.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(config).connect().await
    }

    /// Builder for a client with listeners or custom transports.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }
}

impl<T: Transport> KnxClient<T> {
    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        *self.shared.phase_tx.borrow()
    }

    /// Receiver that sees every phase change
    pub fn phase_changes(&self) -> watch::Receiver<Phase> {
        self.shared.phase_tx.subscribe()
    }

    /// Channel id assigned by the gateway
    pub fn channel_id(&self) -> Option<u8> {
        self.shared.session().channel_id()
    }

    /// Sequence number the next tunneling request will carry
    pub fn send_sequence(&self) -> u8 {
        self.shared.session().send_sequence()
    }

    /// Individual address the gateway assigned to the tunnel
    pub fn tunnel_address(&self) -> Option<IndividualAddress> {
        self.shared.session().tunnel_address()
    }

    /// Gateway description, when one was requested
    pub fn description(&self) -> Option<Description> {
        self.shared
            .description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Why the session closed, once it has
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.shared.session().close_cause()
    }

    /// Wait until the session is closed.
    pub async fn wait_closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Send one cEMI frame through the tunnel and wait for its ack.
    ///
    /// Writes are serialized. A timeout fails this call only; the session
    /// stays open.
    pub async fn send_cemi(&self, cemi: &[u8]) -> Result<()> {
        let cemi = Cemi::new(cemi)?;
        self.shared.write(cemi).await
    }

    /// Next cEMI frame received from the bus. `None` once the session is
    /// closed and every buffered frame was taken.
    pub async fn recv_cemi(&self) -> Option<Cemi> {
        self.inbound.lock().await.recv().await
    }

    /// Next buffered cEMI frame, without waiting.
    pub fn try_recv_cemi(&self) -> Option<Cemi> {
        self.inbound.try_lock().ok()?.try_recv().ok()
    }

    /// Probe the connection now.
    ///
    /// Shares its slot with the heartbeat: fails with a usage error while a
    /// heartbeat probe is outstanding.
    pub async fn connection_state(&self) -> Result<Status> {
        self.shared.probe().await
    }

    /// Orderly teardown. Returns once the session is closed.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.disconnect(CloseCause::ClientRequest).await
    }
}

impl<T: Transport> core::fmt::Debug for KnxClient<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KnxClient")
            .field("gateway", &self.shared.config.gateway)
            .field("phase", &self.phase())
            .field("channel_id", &self.channel_id())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Drop for KnxClient<T> {
    fn drop(&mut self) {
        self.dispatch.abort();
        self.heartbeat.abort();
        self.shared.close(CloseCause::Dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    use crate::net::{mock_pair, MockPeer, MockTransport};
    use crate::protocol::services::{ConnectResponse, Crd, DisconnectRequest, RoutingIndication};

    const CHANNEL: u8 = 7;
    const CEMI: [u8; 11] = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x08, 0x01, 0x01, 0x00, 0x81];

    /// Shared state already in `Connected`, with the gateway ends of both
    /// channels.
    fn connected() -> (Shared<MockTransport>, MockPeer, MockPeer) {
        let gateway: SocketAddrV4 = "192.168.1.10:3671".parse().unwrap();
        let (control, control_peer) = mock_pair("192.168.1.20:50000".parse().unwrap(), gateway);
        let (data, data_peer) = mock_pair("192.168.1.20:50001".parse().unwrap(), gateway);
        let config = ClientConfig::with_gateway(gateway).with_nat(true);
        let (shared, _inbound) = Shared::new(config, ListenerSet::new(), control, data).unwrap();

        let change = shared.session().advance(Phase::Connecting);
        shared.apply(change);
        let crd = Crd::tunnel(IndividualAddress::new(1, 1, 250).unwrap());
        let change = shared
            .session()
            .establish(&ConnectResponse::accepted(CHANNEL, Hpai::NAT, crd))
            .unwrap();
        shared.apply(Some(change));
        assert_eq!(*shared.phase_tx.borrow(), Phase::Connected);
        (shared, control_peer, data_peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_overtaking_local_disconnect() {
        let (shared, mut control, _data) = connected();

        // local teardown has moved the session but not yet published it
        let change = shared.session().advance(Phase::Disconnecting);
        assert!(change.is_some());

        shared
            .on_disconnect_request(&DisconnectRequest::new(CHANNEL, Hpai::NAT))
            .await;
        assert_eq!(*shared.phase_tx.borrow(), Phase::Closed);

        // the late publication of Connected -> Disconnecting must not regress
        shared.apply(change);
        assert_eq!(*shared.phase_tx.borrow(), Phase::Closed);
        assert_eq!(shared.session().phase(), Phase::Closed);
        tokio::time::timeout(Duration::from_secs(1), shared.wait_closed())
            .await
            .unwrap();

        shared.close(CloseCause::ClientRequest);
        assert_eq!(shared.session().close_cause(), Some(CloseCause::RemoteRequest));
        assert!(matches!(control.recv_body().await, Some(Body::DisconnectResponse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_racing_remote_close_returns() {
        let (shared, mut control, _data) = connected();
        let shared = Arc::new(shared);

        let local = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.disconnect(CloseCause::ClientRequest).await }
        });
        // the gateway closes the channel instead of answering
        assert!(matches!(control.recv_body().await, Some(Body::DisconnectRequest(_))));
        shared
            .on_disconnect_request(&DisconnectRequest::new(CHANNEL, Hpai::NAT))
            .await;

        local.await.unwrap().unwrap();
        assert_eq!(*shared.phase_tx.borrow(), Phase::Closed);
        assert_eq!(shared.session().close_cause(), Some(CloseCause::RemoteRequest));
    }

    #[tokio::test]
    async fn test_send_routes_by_affinity() {
        let (shared, mut control, mut data) = connected();

        let indication = Body::from(RoutingIndication::new(Cemi::new(&CEMI).unwrap()));
        let err = shared.send(&indication).await.unwrap_err();
        assert!(matches!(err, KnxError::Usage(ref e) if e.is_no_channel_affinity()));
        assert!(!err.is_fatal());
        assert!(control.try_recv().is_none());
        assert!(data.try_recv().is_none());
        assert_eq!(shared.session().phase(), Phase::Connected);

        let request = shared.session().connection_state_request().unwrap();
        shared.send(&request.into()).await.unwrap();
        assert!(matches!(control.recv_body().await, Some(Body::ConnectionStateRequest(_))));
        assert!(data.try_recv().is_none());
    }
}
