use std::{io, net::SocketAddr};

use tracing::{debug, info, warn};

use crate::{error::SessionError, handler::CloseReason, session::SessionId};

/// Something worth reporting that happened inside the relay.
#[derive(Debug)]
pub enum RelayEvent<'a> {
    SessionOpened {
        session: SessionId,
        peer: Option<SocketAddr>,
    },
    SessionClosed {
        session: SessionId,
        reason: &'a CloseReason,
    },
    AcceptFailed {
        error: &'a io::Error,
    },
    DeliveryFailed {
        target: SessionId,
        error: &'a SessionError,
    },
    ShutdownStarted {
        open_sessions: usize,
    },
}

/// Sink for relay events. Connection failures are contained in their
/// handlers and only ever reach the outside world through this trait.
pub trait RelayObserver: Send + Sync + 'static {
    fn record(&self, event: RelayEvent<'_>);
}

/// Default observer: structured `tracing` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RelayObserver for TracingObserver {
    fn record(&self, event: RelayEvent<'_>) {
        match event {
            RelayEvent::SessionOpened { session, peer } => {
                info!(%session, ?peer, "session opened");
            }
            RelayEvent::SessionClosed { session, reason } => match reason {
                CloseReason::ReadFailed(error) => {
                    warn!(%session, ?error, "session closed after read failure");
                }
                other => info!(%session, reason = %other, "session closed"),
            },
            RelayEvent::AcceptFailed { error } => {
                warn!(?error, "failed to accept connection");
            }
            RelayEvent::DeliveryFailed { target, error } => {
                debug!(%target, ?error, "dropping peer after failed delivery");
            }
            RelayEvent::ShutdownStarted { open_sessions } => {
                info!(open_sessions, "relay shutting down");
            }
        }
    }
}
