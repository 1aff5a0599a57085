//! Heartbeat task.
//!
//! While the session is connected, probes the gateway every
//! `heartbeat_interval` with a connection-state request. A probe that
//! stays unanswered through its retries, or is answered with an error
//! status, is a miss; `alive_timeout / heartbeat_interval` consecutive
//! misses end the session with [`CloseCause::ConnectionStateTimeout`].

use std::sync::Arc;

use super::Shared;
use crate::error::KnxError;
use crate::net::Transport;
use crate::protocol::session::{CloseCause, Phase};

pub(crate) async fn run<T: Transport>(shared: Arc<Shared<T>>) {
    let mut phase = shared.phase_tx.subscribe();
    let interval = shared.config.heartbeat_interval;
    let limit = shared.config.heartbeat_miss_limit();

    loop {
        tokio::select! {
            biased;
            _ = phase.wait_for(|p| *p != Phase::Connected) => break,
            () = tokio::time::sleep(interval) => {}
        }

        match shared.probe().await {
            Ok(_) => knx_log!(debug, "Heartbeat ok"),
            Err(KnxError::Usage(e)) if e.is_request_in_flight() => {
                knx_log!(debug, "Probe already outstanding, skipping heartbeat");
            }
            Err(e) if e.is_fatal() => break,
            Err(_) => {
                let misses = shared.session().heartbeat_misses();
                if misses < limit {
                    continue;
                }
                knx_log!(error, "Gateway unresponsive after {} probes, disconnecting", misses);
                shared
                    .listeners
                    .error(&KnxError::closed(CloseCause::ConnectionStateTimeout));
                if let Err(e) = shared.disconnect(CloseCause::ConnectionStateTimeout).await {
                    knx_log!(warn, "Disconnect after heartbeat failure: {}", e);
                }
                break;
            }
        }
    }
    knx_log!(debug, "Heartbeat task stopped");
}
