use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::{
    config::Delivery,
    observe::{RelayEvent, RelayObserver},
    session::{Session, SessionId},
};

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// The set of sessions currently eligible to receive broadcasts.
///
/// The lock only guards the map; it is never held while writing to a peer.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    observer: Arc<dyn RelayObserver>,
}

impl SessionRegistry {
    pub fn new(observer: Arc<dyn RelayObserver>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            observer,
        }
    }

    /// Returns `false` if the session was already registered.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id()) {
            return false;
        }
        sessions.insert(session.id(), session);
        true
    }

    /// Removes the session if present; calling it again is a no-op.
    pub async fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().await.remove(&id)
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Empties the registry, handing back everything that was in it.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect()
    }

    /// Sends `line` to every registered session, best effort per target.
    ///
    /// Works from a snapshot, so sessions may come and go while the writes
    /// are in flight. A target that fails is unregistered and closed; the
    /// remaining targets are still attempted.
    pub async fn broadcast(
        &self,
        line: &str,
        origin: SessionId,
        delivery: Delivery,
    ) -> BroadcastReport {
        let targets: Vec<_> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|session| delivery == Delivery::IncludeSender || session.id() != origin)
            .collect();

        let outcomes = join_all(targets.iter().map(|target| async move {
            match target.send(line).await {
                Ok(()) => true,
                Err(error) => {
                    self.observer.record(RelayEvent::DeliveryFailed {
                        target: target.id(),
                        error: &error,
                    });
                    self.unregister(target.id()).await;
                    target.close().await;
                    false
                }
            }
        }))
        .await;

        let delivered = outcomes.iter().filter(|delivered| **delivered).count();
        BroadcastReport {
            delivered,
            failed: outcomes.len() - delivered,
        }
    }
}
