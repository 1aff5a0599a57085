//! Observer hooks.
//!
//! A [`Listener`] sees every decoded inbound body, every outbound body,
//! every phase change and every error the client runs into. Calls are
//! synchronous and made from whichever task hit the event, so listeners
//! should return quickly. A panicking listener is logged and ignored.
//!
//! ```rust
//! use knx_tunnel::listener::Listener;
//! use knx_tunnel::protocol::session::Phase;
//!
//! struct PhaseLogger;
//!
//! impl Listener for PhaseLogger {
//!     fn phase_changed(&self, from: Phase, to: Phase) {
//!         println!("{from} -> {to}");
//!     }
//! }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{KnxError, Result};
use crate::net::ChannelRole;
use crate::protocol::frame::Body;
use crate::protocol::session::Phase;

/// Maximum number of listeners per client
pub const MAX_LISTENERS: usize = 8;

/// Client event observer. Every method defaults to a no-op.
pub trait Listener: Send + Sync {
    /// A datagram decoded into `body` on `role`
    fn frame_received(&self, role: ChannelRole, body: &Body) {
        let _ = (role, body);
    }

    /// `body` was sent on `role`
    fn frame_sent(&self, role: ChannelRole, body: &Body) {
        let _ = (role, body);
    }

    /// The session moved from `from` to `to`
    fn phase_changed(&self, from: Phase, to: Phase) {
        let _ = (from, to);
    }

    /// Something went wrong; the client handles it, this is for diagnostics
    fn error(&self, error: &KnxError) {
        let _ = error;
    }
}

impl<L: Listener + ?Sized> Listener for Arc<L> {
    fn frame_received(&self, role: ChannelRole, body: &Body) {
        (**self).frame_received(role, body);
    }

    fn frame_sent(&self, role: ChannelRole, body: &Body) {
        (**self).frame_sent(role, body);
    }

    fn phase_changed(&self, from: Phase, to: Phase) {
        (**self).phase_changed(from, to);
    }

    fn error(&self, error: &KnxError) {
        (**self).error(error);
    }
}

/// Bounded list of listeners with panic isolation.
#[derive(Default)]
pub struct ListenerSet {
    listeners: heapless::Vec<Arc<dyn Listener>, MAX_LISTENERS>,
}

impl core::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.listeners.len())
            .finish()
    }
}

impl ListenerSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Fails once [`MAX_LISTENERS`] are registered.
    pub fn push(&mut self, listener: Arc<dyn Listener>) -> Result<()> {
        self.listeners
            .push(listener)
            .ok()
            .ok_or(KnxError::capacity_exceeded())
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// `true` when no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&self, event: &str, call: impl Fn(&dyn Listener)) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                knx_log!(warn, "Listener panicked in {}, ignored", event);
            }
        }
    }

    pub(crate) fn frame_received(&self, role: ChannelRole, body: &Body) {
        self.each("frame_received", |l| l.frame_received(role, body));
    }

    pub(crate) fn frame_sent(&self, role: ChannelRole, body: &Body) {
        self.each("frame_sent", |l| l.frame_sent(role, body));
    }

    pub(crate) fn phase_changed(&self, from: Phase, to: Phase) {
        self.each("phase_changed", |l| l.phase_changed(from, to));
    }

    pub(crate) fn error(&self, error: &KnxError) {
        self.each("error", |l| l.error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        phases: AtomicUsize,
    }

    impl Listener for Counter {
        fn phase_changed(&self, _from: Phase, _to: Phase) {
            self.phases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl Listener for Panicker {
        fn phase_changed(&self, _from: Phase, _to: Phase) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let counter = Arc::new(Counter::default());
        let mut set = ListenerSet::new();
        set.push(Arc::new(Panicker)).unwrap();
        set.push(Arc::clone(&counter) as Arc<dyn Listener>).unwrap();

        set.phase_changed(Phase::Connecting, Phase::Connected);
        set.phase_changed(Phase::Connected, Phase::Disconnecting);
        assert_eq!(counter.phases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_capacity() {
        let mut set = ListenerSet::new();
        for _ in 0..MAX_LISTENERS {
            set.push(Arc::new(Counter::default())).unwrap();
        }
        assert_eq!(set.len(), MAX_LISTENERS);
        assert!(set.push(Arc::new(Counter::default())).is_err());
    }
}
