use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, warn};

use crate::{
    config::RelayConfig,
    error::RelayError,
    handler::ConnectionHandler,
    observe::{RelayEvent, RelayObserver, TracingObserver},
    registry::SessionRegistry,
    session::{Session, SessionIds},
};

/// Accepts connections and gives each one its own handler task.
///
/// Every relay owns its registry and id allocator, so several relays can
/// run side by side in one process.
pub struct Relay {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    observer: Arc<dyn RelayObserver>,
    ids: SessionIds,
}

impl Relay {
    /// Binds `config.listen`. This is the only fatal error the relay has.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        Self::bind_with_observer(config, Arc::new(TracingObserver)).await
    }

    pub async fn bind_with_observer(
        config: RelayConfig,
        observer: Arc<dyn RelayObserver>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen.as_str())
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        Ok(Self::with_observer(listener, config, observer))
    }

    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self::with_observer(listener, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        listener: TcpListener,
        config: RelayConfig,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&observer)));
        Self {
            listener,
            shared: Arc::new(Shared {
                config: Arc::new(config),
                registry,
                observer,
                ids: SessionIds::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::LocalAddr)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Runs the accept loop until `shutdown` resolves, then closes every
    /// open session.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, shared } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&shared).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &shared).await;
                }
            }
        }
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(shared: &Shared) {
    let sessions = shared.registry.drain().await;
    shared.observer.record(RelayEvent::ShutdownStarted {
        open_sessions: sessions.len(),
    });
    for session in sessions {
        session.close().await;
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    shared: &Arc<Shared>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, shared).await,
        Err(error) => shared.observer.record(RelayEvent::AcceptFailed { error: &error }),
    }
}

/// Registers the session before the handler task exists, so a shutdown that
/// runs next in the accept loop always sees it.
async fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, shared: &Arc<Shared>) {
    let (session, reader) = Session::from_tcp(
        shared.ids.next_id(),
        stream,
        shared.config.max_line_bytes,
    );
    let handler = ConnectionHandler::new(
        Arc::new(session),
        reader,
        Arc::clone(&shared.registry),
        Arc::clone(&shared.config),
        Arc::clone(&shared.observer),
    );
    handler.register().await;
    tokio::spawn(async move {
        let reason = handler.run().await;
        debug!(%peer, %reason, "connection handler finished");
    });
}
