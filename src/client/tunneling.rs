//! Outbound tunneling exchange.
//!
//! One tunneling request is outstanding at a time. The writer arms the
//! [`AckSlot`] with the sequence it is about to send, the dispatch task
//! offers every inbound ack to it, and only an ack for our channel and the
//! armed sequence gets through. Anything else is stale and ignored, so the
//! writer keeps waiting and eventually resends.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::oneshot;

use super::Shared;
use crate::error::{KnxError, Result};
use crate::net::Transport;
use crate::protocol::constants::Status;
use crate::protocol::frame::Body;
use crate::protocol::services::{Cemi, TunnelingAck};
use crate::protocol::session::{CloseCause, Session};

#[derive(Debug)]
struct Armed {
    sequence: u8,
    tx: oneshot::Sender<Status>,
}

/// Slot for the ack of the outstanding tunneling request.
#[derive(Debug, Default)]
pub(crate) struct AckSlot {
    armed: Mutex<Option<Armed>>,
    closed: OnceLock<CloseCause>,
}

/// Outcome of offering an inbound ack to the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOffer {
    /// Delivered to the waiting writer
    Matched,
    /// Nothing armed, or wrong channel or sequence
    Stale,
}

impl AckSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn armed(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> KnxError {
        KnxError::closed(self.closed.get().copied().unwrap_or(CloseCause::Dropped))
    }

    /// Wait for the ack of `sequence`, replacing any earlier arming.
    pub(crate) fn arm(&self, sequence: u8) -> Result<oneshot::Receiver<Status>> {
        let mut armed = self.armed();
        if self.closed.get().is_some() {
            return Err(self.closed_error());
        }
        let (tx, rx) = oneshot::channel();
        *armed = Some(Armed { sequence, tx });
        Ok(rx)
    }

    /// Hand `ack` to the writer if it answers the armed request.
    pub(crate) fn offer(&self, ack: &TunnelingAck, session: &Session) -> AckOffer {
        let mut armed = self.armed();
        match armed.take() {
            Some(slot) if session.ack_matches(ack, slot.sequence) => {
                let _ = slot.tx.send(ack.status());
                AckOffer::Matched
            }
            other => {
                *armed = other;
                AckOffer::Stale
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.armed().take();
    }

    /// Fail the waiting writer and every later arming.
    pub(crate) fn close(&self, cause: CloseCause) {
        let _ = self.closed.set(cause);
        self.clear();
    }
}

impl<T: Transport> Shared<T> {
    /// Send `cemi` as a tunneling request and wait for a matching ack.
    ///
    /// The send sequence advances only on a `NO_ERROR` ack. Running out of
    /// attempts fails this write and leaves the session open.
    pub(crate) async fn write(&self, cemi: Cemi) -> Result<()> {
        let _write = self.write_lock.lock().await;

        let request = self.session().tunneling_request(cemi)?;
        let sequence = request.sequence();
        let body = Body::from(request);
        let policy = self.config.tunneling;

        for attempt in 0..policy.attempts {
            let ack = self.acks.arm(sequence)?;
            self.send(&body).await?;

            match tokio::time::timeout(policy.timeout_for(attempt), ack).await {
                Ok(Ok(Status::NoError)) => {
                    self.session().acknowledge_sent(sequence);
                    return Ok(());
                }
                Ok(Ok(status)) => {
                    knx_log!(warn, "Tunneling request {} rejected: {:?}", sequence, status);
                    return Err(KnxError::tunneling_rejected(status));
                }
                Ok(Err(_)) => return Err(self.acks.closed_error()),
                Err(_) => knx_log!(
                    debug,
                    "No ack for sequence {} (attempt {}/{})",
                    sequence,
                    attempt + 1,
                    policy.attempts
                ),
            }
        }

        self.acks.clear();
        knx_log!(warn, "Tunneling request {} unacknowledged", sequence);
        let err = KnxError::ack_timeout(sequence);
        self.listeners.error(&err);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::IndividualAddress;
    use crate::protocol::frame::Hpai;
    use crate::protocol::services::{ConnectResponse, Crd};
    use crate::protocol::session::Phase;

    fn connected(channel: u8) -> Session {
        let mut session = Session::new(Hpai::NAT, Hpai::NAT, "10.0.0.1:3671".parse().unwrap());
        session.advance(Phase::Connecting).unwrap();
        let crd = Crd::tunnel(IndividualAddress::new(1, 1, 250).unwrap());
        session.establish(&ConnectResponse::accepted(channel, Hpai::NAT, crd)).unwrap();
        session
    }

    #[tokio::test]
    async fn test_matching_ack_delivered() {
        let session = connected(7);
        let slot = AckSlot::new();
        let rx = slot.arm(5).unwrap();

        let ack = TunnelingAck::new(7, 5, Status::NoError);
        assert_eq!(slot.offer(&ack, &session), AckOffer::Matched);
        assert_eq!(rx.await.unwrap(), Status::NoError);
        // consumed
        assert_eq!(slot.offer(&ack, &session), AckOffer::Stale);
    }

    #[tokio::test]
    async fn test_stale_ack_keeps_slot_armed() {
        let session = connected(7);
        let slot = AckSlot::new();
        let mut rx = slot.arm(5).unwrap();

        assert_eq!(slot.offer(&TunnelingAck::new(7, 4, Status::NoError), &session), AckOffer::Stale);
        assert_eq!(slot.offer(&TunnelingAck::new(8, 5, Status::NoError), &session), AckOffer::Stale);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            slot.offer(&TunnelingAck::new(7, 5, Status::SequenceNumber), &session),
            AckOffer::Matched
        );
        assert_eq!(rx.await.unwrap(), Status::SequenceNumber);
    }

    #[tokio::test]
    async fn test_close_fails_waiter() {
        let slot = AckSlot::new();
        let rx = slot.arm(0).unwrap();
        slot.close(CloseCause::RemoteRequest);
        assert!(rx.await.is_err());
        let err = slot.arm(1).unwrap_err();
        assert_eq!(err.close_cause(), Some(CloseCause::RemoteRequest));
    }
}
