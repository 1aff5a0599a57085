//! Dispatch task: the only reader of both channels.
//!
//! Every datagram is decoded once and routed to exactly one place:
//!
//! | Channel | Body                          | Goes to                       |
//! |---------|-------------------------------|-------------------------------|
//! | control | description/connect response  | correlator                    |
//! | control | connection-state/disconnect response for our channel | correlator |
//! | control | disconnect request            | session (remote close)        |
//! | data    | tunneling request             | ack + application queue       |
//! | data    | tunneling ack                 | ack slot                      |
//!
//! Anything else is logged and dropped. Malformed datagrams never stop the
//! loop; only a transport failure or the session closing does.

use core::net::SocketAddrV4;
use std::sync::{Arc, PoisonError};

use tokio::sync::mpsc::error::TrySendError;

use super::tunneling::AckOffer;
use super::Shared;
use crate::error::KnxError;
use crate::net::{ChannelRole, Transport};
use crate::protocol::frame::{self, Body};
use crate::protocol::services::{DisconnectRequest, TunnelingAck, TunnelingRequest};
use crate::protocol::session::{CloseCause, Inbound};

pub(crate) async fn run<T: Transport>(shared: Arc<Shared<T>>) {
    let mut phase = shared.phase_tx.subscribe();
    loop {
        let polled = tokio::select! {
            biased;
            _ = phase.wait_for(|p| p.is_closed()) => break,
            polled = shared.channels.poll() => polled,
        };
        match polled {
            Ok(Some((role, datagram, from))) => shared.route(role, &datagram, from).await,
            Ok(None) => {}
            Err(e) => {
                knx_log!(error, "Receive failed, closing session: {}", e);
                shared.listeners.error(&e);
                shared.close(CloseCause::TransportFailure);
                break;
            }
        }
    }
    knx_log!(debug, "Dispatch task stopped");
}

impl<T: Transport> Shared<T> {
    async fn route(&self, role: ChannelRole, datagram: &[u8], from: SocketAddrV4) {
        let body = match frame::decode(datagram) {
            Ok(body) => body,
            Err(e) => {
                knx_log!(warn, "Discarding datagram from {} on {:?} channel: {}", from, role, e);
                self.listeners.error(&e);
                return;
            }
        };
        knx_log!(debug, "Received {:?} on {:?} channel", body.service_type(), role);
        self.listeners.frame_received(role, &body);

        match (role, body) {
            (ChannelRole::Control, body @ (Body::DescriptionResponse(_) | Body::ConnectResponse(_))) => {
                self.fulfill(body);
            }
            (ChannelRole::Control, Body::ConnectionStateResponse(response))
                if self.owns_channel(response.channel_id()) =>
            {
                self.fulfill(response.into());
            }
            (ChannelRole::Control, Body::DisconnectResponse(response))
                if self.owns_channel(response.channel_id()) =>
            {
                self.fulfill(response.into());
            }
            (ChannelRole::Control, Body::DisconnectRequest(request)) => {
                self.on_disconnect_request(&request).await;
            }
            (ChannelRole::Data, Body::TunnelingRequest(request)) => {
                self.on_tunneling_request(request).await;
            }
            (ChannelRole::Data, Body::TunnelingAck(ack)) => self.on_ack(&ack),
            (_, Body::RoutingIndication(indication)) => {
                knx_log!(debug, "Ignoring routing indication ({} bytes cEMI)", indication.cemi().len());
            }
            (role, body) => {
                knx_log!(warn, "Unexpected {:?} on {:?} channel", body.service_type(), role);
            }
        }
    }

    fn fulfill(&self, response: Body) {
        let service = response.service_type();
        if !self.correlator.fulfill(response) {
            knx_log!(debug, "No request waiting for {:?}", service);
        }
    }

    pub(super) async fn on_disconnect_request(&self, request: &DisconnectRequest) {
        let outcome = self.session().remote_disconnect(request);
        let Some((response, changes)) = outcome else {
            knx_log!(debug, "Disconnect request for foreign channel {}", request.channel_id());
            return;
        };
        knx_log!(warn, "Gateway closed channel {}", request.channel_id());
        // best effort, the session is closed either way
        let _ = self.send(&response.into()).await;
        for change in changes {
            self.apply(Some(change));
        }
    }

    async fn on_tunneling_request(&self, request: TunnelingRequest) {
        let (verdict, ack) = {
            let mut session = self.session();
            (session.classify_inbound(&request), session.ack_for(&request))
        };
        match verdict {
            Inbound::ForeignChannel => {
                knx_log!(debug, "Ignoring tunneling request for channel {}", request.channel_id());
            }
            Inbound::Duplicate => {
                knx_log!(debug, "Duplicate tunneling request {}, acking again", request.sequence());
                let _ = self.send(&ack.into()).await;
            }
            Inbound::Deliver => {
                if self.send(&ack.into()).await.is_err() {
                    return;
                }
                self.deliver(request);
            }
        }
    }

    fn deliver(&self, request: TunnelingRequest) {
        let sequence = request.sequence();
        let sent = {
            let inbound = self.inbound_tx.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = inbound.as_ref() else {
                return;
            };
            tx.try_send(request.into_cemi())
        };
        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                knx_log!(warn, "Inbound queue full, dropping cEMI frame {}", sequence);
                self.listeners.error(&KnxError::inbound_dropped(sequence));
            }
            Err(TrySendError::Closed(_)) => {
                knx_log!(debug, "Inbound queue closed, dropping cEMI frame {}", sequence);
            }
        }
    }

    fn on_ack(&self, ack: &TunnelingAck) {
        let offer = self.acks.offer(ack, &self.session());
        if offer == AckOffer::Stale {
            knx_log!(
                warn,
                "Ignoring stale ack (channel {}, sequence {})",
                ack.channel_id(),
                ack.sequence()
            );
        }
    }
}
