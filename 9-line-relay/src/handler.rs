use std::{fmt, sync::Arc, time::Duration};

use tokio::{io::AsyncBufRead, select, sync::watch, time::timeout};

use crate::{
    config::RelayConfig,
    error::SessionError,
    observe::{RelayEvent, RelayObserver},
    registry::SessionRegistry,
    session::{LineReader, Session},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a handler left its read loop.
#[derive(Debug)]
pub enum CloseReason {
    EndOfStream,
    ExitRequested,
    ReadFailed(SessionError),
    /// Someone else closed the session: a failed delivery or relay shutdown.
    ClosedLocally,
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => f.write_str("peer closed the connection"),
            CloseReason::ExitRequested => f.write_str("peer asked to leave"),
            CloseReason::ReadFailed(error) => write!(f, "read failed: {error}"),
            CloseReason::ClosedLocally => f.write_str("closed by the relay"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

enum Inbound {
    Line(String),
    Finished(CloseReason),
}

/// Drives one connection: register, relay every inbound line, then tear
/// down. Teardown always unregisters before closing, so a broadcast never
/// picks up a session whose stream is already shut.
pub struct ConnectionHandler<R> {
    session: Arc<Session>,
    reader: LineReader<R>,
    registry: Arc<SessionRegistry>,
    config: Arc<RelayConfig>,
    observer: Arc<dyn RelayObserver>,
    state: watch::Sender<HandlerState>,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        session: Arc<Session>,
        reader: LineReader<R>,
        registry: Arc<SessionRegistry>,
        config: Arc<RelayConfig>,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        let (state, _) = watch::channel(HandlerState::Connecting);
        Self {
            session,
            reader,
            registry,
            config,
            observer,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    /// Puts the session in the registry and moves to `Active`. The acceptor
    /// calls this before spawning the handler so a relay shutdown can never
    /// miss a session; `run` does it itself if nobody has yet.
    pub async fn register(&self) {
        if *self.state.borrow() != HandlerState::Connecting {
            return;
        }

        self.registry.register(Arc::clone(&self.session)).await;
        self.state.send_replace(HandlerState::Active);
        self.observer.record(RelayEvent::SessionOpened {
            session: self.session.id(),
            peer: self.session.peer(),
        });
    }

    pub async fn run(mut self) -> CloseReason {
        let id = self.session.id();
        self.register().await;

        let reason = self.relay_lines().await;

        self.state.send_replace(HandlerState::Closing);
        self.registry.unregister(id).await;
        self.session.close().await;
        self.state.send_replace(HandlerState::Closed);

        self.observer.record(RelayEvent::SessionClosed {
            session: id,
            reason: &reason,
        });
        reason
    }

    async fn relay_lines(&mut self) -> CloseReason {
        let session = Arc::clone(&self.session);
        let idle_timeout = self.config.idle_timeout;

        loop {
            let inbound = select! {
                biased;
                _ = session.closed() => Inbound::Finished(CloseReason::ClosedLocally),
                inbound = next_line(&mut self.reader, idle_timeout) => inbound,
            };

            let line = match inbound {
                Inbound::Line(line) => line,
                Inbound::Finished(reason) => return reason,
            };

            if self.config.is_exit_request(&line) {
                return CloseReason::ExitRequested;
            }

            self.registry
                .broadcast(&line, session.id(), self.config.delivery)
                .await;
        }
    }
}

async fn next_line<R>(reader: &mut LineReader<R>, idle_timeout: Option<Duration>) -> Inbound
where
    R: AsyncBufRead + Unpin,
{
    let received = match idle_timeout {
        Some(limit) => match timeout(limit, reader.receive_line()).await {
            Ok(received) => received,
            Err(_) => return Inbound::Finished(CloseReason::IdleTimeout),
        },
        None => reader.receive_line().await,
    };

    match received {
        Ok(Some(line)) => Inbound::Line(line),
        Ok(None) => Inbound::Finished(CloseReason::EndOfStream),
        Err(error) => Inbound::Finished(CloseReason::ReadFailed(error)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, duplex, split,
    };

    use super::*;
    use crate::{config::Delivery, session::SessionIds};

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RelayObserver for RecordingObserver {
        fn record(&self, event: RelayEvent<'_>) {
            let label = match event {
                RelayEvent::SessionOpened { session, .. } => format!("opened {session}"),
                RelayEvent::SessionClosed { session, reason } => {
                    format!("closed {session}: {reason}")
                }
                other => format!("{other:?}"),
            };
            self.events.lock().expect("events lock").push(label);
        }
    }

    struct Harness {
        ids: SessionIds,
        registry: Arc<SessionRegistry>,
        observer: Arc<RecordingObserver>,
        config: Arc<RelayConfig>,
    }

    impl Harness {
        fn new(config: RelayConfig) -> Self {
            let observer = Arc::new(RecordingObserver::default());
            Self {
                ids: SessionIds::new(),
                registry: Arc::new(SessionRegistry::new(observer.clone())),
                observer,
                config: Arc::new(config),
            }
        }

        /// Returns the handler plus the peer end of its connection.
        fn connect(&self) -> (ConnectionHandler<BufReader<ReadHalf<DuplexStream>>>, DuplexStream) {
            let (local, remote) = duplex(1024);
            let (reader, writer) = split(local);
            let session = Arc::new(Session::new(self.ids.next_id(), None, writer));
            let handler = ConnectionHandler::new(
                session,
                LineReader::with_max_line_bytes(
                    BufReader::new(reader),
                    self.config.max_line_bytes,
                ),
                Arc::clone(&self.registry),
                Arc::clone(&self.config),
                self.observer.clone(),
            );
            (handler, remote)
        }
    }

    fn config() -> RelayConfig {
        RelayConfig::new("127.0.0.1:0", Delivery::ExcludeSender)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<HandlerState>, wanted: HandlerState) {
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|state| *state == wanted))
            .await
            .expect("state change in time")
            .expect("handler dropped its state channel");
    }

    #[tokio::test]
    async fn relays_lines_then_closes_on_end_of_stream() {
        let harness = Harness::new(config());
        let (alice, mut alice_peer) = harness.connect();
        let (bob, bob_peer) = harness.connect();
        let alice_id = alice.session.id();
        let mut alice_state = alice.state();
        let mut bob_state = bob.state();
        assert_eq!(*alice_state.borrow(), HandlerState::Connecting);

        let alice_task = tokio::spawn(alice.run());
        let bob_task = tokio::spawn(bob.run());
        wait_for_state(&mut alice_state, HandlerState::Active).await;
        wait_for_state(&mut bob_state, HandlerState::Active).await;

        alice_peer.write_all(b"hello\n").await.expect("alice writes");
        let mut bob_peer = BufReader::new(bob_peer);
        let mut line = String::new();
        bob_peer.read_line(&mut line).await.expect("bob reads");
        assert_eq!(line, "hello\n");

        drop(alice_peer);
        let reason = alice_task.await.expect("alice handler");
        assert!(matches!(reason, CloseReason::EndOfStream));
        assert_eq!(*alice_state.borrow(), HandlerState::Closed);
        assert!(!harness.registry.contains(alice_id).await);

        drop(bob_peer);
        assert!(matches!(
            bob_task.await.expect("bob handler"),
            CloseReason::EndOfStream
        ));
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn register_before_run_is_visible_and_not_repeated() {
        let harness = Harness::new(config());
        let (alice, alice_peer) = harness.connect();
        let alice_id = alice.session.id();
        let state = alice.state();

        alice.register().await;
        assert_eq!(*state.borrow(), HandlerState::Active);
        assert!(harness.registry.contains(alice_id).await);

        // A drain between registration and the first poll of `run` still
        // reaches the session, and `run` does not put it back.
        for session in harness.registry.drain().await {
            session.close().await;
        }
        let reason = tokio::time::timeout(Duration::from_secs(1), alice.run())
            .await
            .expect("handler exits promptly");
        assert!(matches!(reason, CloseReason::ClosedLocally));
        assert!(harness.registry.is_empty().await);
        drop(alice_peer);

        let events = harness.observer.events.lock().expect("events lock").clone();
        assert_eq!(
            events,
            vec![
                format!("opened {alice_id}"),
                format!("closed {alice_id}: closed by the relay"),
            ]
        );
    }

    #[tokio::test]
    async fn overlong_line_is_a_read_failure() {
        let harness = Harness::new(config().with_max_line_bytes(16));
        let (alice, mut alice_peer) = harness.connect();
        let mut state = alice.state();

        let task = tokio::spawn(alice.run());
        wait_for_state(&mut state, HandlerState::Active).await;
        alice_peer
            .write_all(b"this line is far too long\n")
            .await
            .expect("alice writes");

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler exits promptly")
            .expect("handler task");
        assert!(matches!(
            reason,
            CloseReason::ReadFailed(SessionError::LineTooLong { limit: 16 })
        ));
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn exit_sentinel_closes_without_relaying() {
        let harness = Harness::new(config());
        let (alice, mut alice_peer) = harness.connect();
        let (bob, bob_peer) = harness.connect();
        let bob_session = Arc::clone(&bob.session);
        let mut alice_state = alice.state();
        let mut bob_state = bob.state();

        let alice_task = tokio::spawn(alice.run());
        let _bob_task = tokio::spawn(bob.run());
        wait_for_state(&mut alice_state, HandlerState::Active).await;
        wait_for_state(&mut bob_state, HandlerState::Active).await;

        alice_peer.write_all(b"Exit\r\n").await.expect("alice writes");
        let reason = alice_task.await.expect("alice handler");
        assert!(matches!(reason, CloseReason::ExitRequested));

        // The next thing Bob sees is this line, not the sentinel.
        harness
            .registry
            .broadcast("after", harness.ids.next_id(), Delivery::ExcludeSender)
            .await;
        let mut bob_peer = BufReader::new(bob_peer);
        let mut line = String::new();
        bob_peer.read_line(&mut line).await.expect("bob reads");
        assert_eq!(line, "after\n");
        assert!(bob_session.is_alive());
        assert_eq!(harness.registry.len().await, 1);
    }

    #[tokio::test]
    async fn local_close_ends_the_read_loop() {
        let harness = Harness::new(config());
        let (alice, _alice_peer) = harness.connect();
        let session = Arc::clone(&alice.session);
        let mut state = alice.state();

        let task = tokio::spawn(alice.run());
        wait_for_state(&mut state, HandlerState::Active).await;

        session.close().await;
        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler exits promptly")
            .expect("handler task");
        assert!(matches!(reason, CloseReason::ClosedLocally));
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let harness =
            Harness::new(config().with_idle_timeout(Some(Duration::from_millis(50))));
        let (alice, alice_peer) = harness.connect();
        let session = Arc::clone(&alice.session);

        let reason = tokio::time::timeout(Duration::from_secs(1), alice.run())
            .await
            .expect("idle timeout fires");
        assert!(matches!(reason, CloseReason::IdleTimeout));
        assert!(!session.is_alive());
        assert!(harness.registry.is_empty().await);

        let mut alice_peer = BufReader::new(alice_peer);
        let mut rest = String::new();
        let bytes = alice_peer.read_line(&mut rest).await.expect("peer reads eof");
        assert_eq!(bytes, 0);
    }

    #[tokio::test]
    async fn closed_session_gets_no_further_broadcasts() {
        let harness = Harness::new(config());
        let (alice, alice_peer) = harness.connect();
        let alice_id = alice.session.id();
        let mut state = alice.state();

        let task = tokio::spawn(alice.run());
        wait_for_state(&mut state, HandlerState::Active).await;
        drop(alice_peer);
        task.await.expect("handler task");

        let report = harness
            .registry
            .broadcast("nobody", harness.ids.next_id(), Delivery::IncludeSender)
            .await;
        assert_eq!(report.delivered + report.failed, 0);

        let events = harness.observer.events.lock().expect("events lock").clone();
        assert_eq!(
            events,
            vec![
                format!("opened {alice_id}"),
                format!("closed {alice_id}: peer closed the connection"),
            ]
        );
    }
}
