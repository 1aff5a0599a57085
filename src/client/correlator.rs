//! Request/response correlation for control-channel requests.
//!
//! The correlator keeps one slot per [`RequestKind`]. A request task takes
//! the slot with [`Correlator::begin`], stamps it before each send and then
//! waits on it; the dispatch task hands matching responses over with
//! [`Correlator::fulfill`]. A second request of the same kind while the slot
//! is taken is rejected with a usage error.
//!
//! ```text
//!  request task                      dispatch task
//!  ────────────                      ─────────────
//!  begin(kind)  ── slot taken
//!  stamp()      ── fresh oneshot
//!  send ───────────────▶ gateway ───▶ fulfill(response)
//!  await_response ◀──────────────────────┘
//!  drop         ── slot free
//! ```

use core::time::Duration;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{KnxError, Result};
use crate::protocol::frame::Body;
use crate::protocol::session::CloseCause;

/// Control request kinds, one correlator slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `DESCRIPTION_REQUEST`
    Description,
    /// `CONNECT_REQUEST`
    Connect,
    /// `CONNECTIONSTATE_REQUEST`
    ConnectionState,
    /// `DISCONNECT_REQUEST` sent by the client
    Disconnect,
}

impl RequestKind {
    const COUNT: usize = 4;

    const fn index(self) -> usize {
        match self {
            Self::Description => 0,
            Self::Connect => 1,
            Self::ConnectionState => 2,
            Self::Disconnect => 3,
        }
    }

    /// Slot a response body belongs to, `None` for anything that is not a
    /// control response.
    pub const fn for_response(body: &Body) -> Option<Self> {
        match body {
            Body::DescriptionResponse(_) => Some(Self::Description),
            Body::ConnectResponse(_) => Some(Self::Connect),
            Body::ConnectionStateResponse(_) => Some(Self::ConnectionState),
            Body::DisconnectResponse(_) => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: bool,
    request: Option<Body>,
    sent_at: Option<Instant>,
    tx: Option<oneshot::Sender<Body>>,
}

/// Pending-request slots, one per [`RequestKind`].
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    slots: [Mutex<Slot>; RequestKind::COUNT],
    closed: OnceLock<CloseCause>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: RequestKind) -> MutexGuard<'_, Slot> {
        self.slots[kind.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> KnxError {
        KnxError::closed(self.closed.get().copied().unwrap_or(CloseCause::Dropped))
    }

    /// Take the slot for `kind`, recording `request` for diagnostics.
    pub(crate) fn begin(&self, kind: RequestKind, request: Body) -> Result<PendingRequest<'_>> {
        if self.closed.get().is_some() {
            return Err(self.closed_error());
        }
        let mut slot = self.slot(kind);
        if slot.in_flight {
            return Err(KnxError::request_in_flight());
        }
        *slot = Slot {
            in_flight: true,
            request: Some(request),
            sent_at: None,
            tx: None,
        };
        Ok(PendingRequest {
            correlator: self,
            kind,
            rx: None,
        })
    }

    /// Hand a response to the waiting request of its kind.
    ///
    /// Returns `false` when nothing is waiting for it.
    pub(crate) fn fulfill(&self, response: Body) -> bool {
        let Some(kind) = RequestKind::for_response(&response) else {
            return false;
        };
        let tx = self.slot(kind).tx.take();
        tx.is_some_and(|tx| tx.send(response).is_ok())
    }

    /// Fail every current and future wait with a closed error.
    pub(crate) fn close(&self, cause: CloseCause) {
        let _ = self.closed.set(cause);
        for slot in &self.slots {
            slot.lock().unwrap_or_else(PoisonError::into_inner).tx = None;
        }
    }

    /// Request stored in the slot of `kind`, if one is in flight
    pub(crate) fn in_flight(&self, kind: RequestKind) -> Option<Body> {
        self.slot(kind).request.clone()
    }
}

/// A taken correlator slot. Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct PendingRequest<'a> {
    correlator: &'a Correlator,
    kind: RequestKind,
    rx: Option<oneshot::Receiver<Body>>,
}

impl PendingRequest<'_> {
    /// Prepare the slot for one attempt. Must run before the send so a fast
    /// response finds somewhere to go.
    pub(crate) fn stamp(&mut self) -> Result<()> {
        let mut slot = self.correlator.slot(self.kind);
        if self.correlator.closed.get().is_some() {
            return Err(self.correlator.closed_error());
        }
        let (tx, rx) = oneshot::channel();
        slot.tx = Some(tx);
        slot.sent_at = Some(Instant::now());
        self.rx = Some(rx);
        Ok(())
    }

    /// Wait for the response to the last stamped attempt.
    ///
    /// `Ok(None)` when `timeout` elapsed since the stamp, an error when the
    /// correlator was closed meanwhile.
    pub(crate) async fn await_response(&mut self, timeout: Duration) -> Result<Option<Body>> {
        let sent_at = self.correlator.slot(self.kind).sent_at;
        let (Some(rx), Some(sent_at)) = (self.rx.as_mut(), sent_at) else {
            return Ok(None);
        };
        match tokio::time::timeout_at(sent_at + timeout, rx).await {
            Ok(Ok(response)) => {
                knx_log!(debug, "{:?} answered after {:?}", self.kind, sent_at.elapsed());
                Ok(Some(response))
            }
            Ok(Err(_)) => Err(self.correlator.closed_error()),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        *self.correlator.slot(self.kind) = Slot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::Status;
    use crate::protocol::frame::Hpai;
    use crate::protocol::services::{ConnectionStateRequest, ConnectionStateResponse, DisconnectResponse};

    fn probe() -> Body {
        ConnectionStateRequest::new(7, Hpai::NAT).into()
    }

    fn alive() -> Body {
        ConnectionStateResponse::new(7, Status::NoError).into()
    }

    #[tokio::test]
    async fn test_fulfill_wakes_waiter() {
        let correlator = Correlator::new();
        let mut pending = correlator.begin(RequestKind::ConnectionState, probe()).unwrap();
        pending.stamp().unwrap();
        assert_eq!(correlator.in_flight(RequestKind::ConnectionState), Some(probe()));

        assert!(correlator.fulfill(alive()));
        let response = pending.await_response(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, Some(alive()));
    }

    #[tokio::test]
    async fn test_response_without_waiter_is_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.fulfill(alive()));

        // taken but not stamped yet
        let _pending = correlator.begin(RequestKind::ConnectionState, probe()).unwrap();
        assert!(!correlator.fulfill(alive()));
        // wrong kind
        assert!(!correlator.fulfill(DisconnectResponse::new(7, Status::NoError).into()));
    }

    #[tokio::test]
    async fn test_same_kind_overlap_rejected() {
        let correlator = Correlator::new();
        let pending = correlator.begin(RequestKind::Connect, probe()).unwrap();
        let err = correlator.begin(RequestKind::Connect, probe()).unwrap_err();
        assert!(matches!(err, KnxError::Usage(ref e) if e.is_request_in_flight()));

        // other kinds are independent
        assert!(correlator.begin(RequestKind::Disconnect, probe()).is_ok());

        drop(pending);
        assert!(correlator.begin(RequestKind::Connect, probe()).is_ok());
        assert_eq!(correlator.in_flight(RequestKind::Connect), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_measured_from_stamp() {
        let correlator = Correlator::new();
        let mut pending = correlator.begin(RequestKind::ConnectionState, probe()).unwrap();
        pending.stamp().unwrap();

        let start = Instant::now();
        let response = pending.await_response(Duration::from_secs(10)).await.unwrap();
        assert!(response.is_none());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let correlator = Correlator::new();
        let mut pending = correlator.begin(RequestKind::Disconnect, probe()).unwrap();
        pending.stamp().unwrap();

        correlator.close(CloseCause::RemoteRequest);
        let err = pending.await_response(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.close_cause(), Some(CloseCause::RemoteRequest));

        let err = correlator.begin(RequestKind::Connect, probe()).unwrap_err();
        assert!(err.is_closed());
    }
}
