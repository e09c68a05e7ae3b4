use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    sync::{Mutex, watch},
};
use tracing::debug;

use crate::{config::DEFAULT_MAX_LINE_BYTES, error::SessionError};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out session ids for one relay instance.
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// The write side of one accepted connection plus its liveness flag.
///
/// The read side is a separate [`LineReader`] owned by the connection's
/// handler; the registry only ever needs to write.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new<W>(id: SessionId, peer: Option<SocketAddr>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            peer,
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        }
    }

    /// Splits an accepted socket into a session and the reader its handler drives.
    pub fn from_tcp(
        id: SessionId,
        stream: TcpStream,
        max_line_bytes: usize,
    ) -> (Self, LineReader<BufReader<OwnedReadHalf>>) {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        (
            Self::new(id, peer, writer),
            LineReader::with_max_line_bytes(BufReader::new(reader), max_line_bytes),
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Writes `line` followed by `\n` and flushes.
    ///
    /// Concurrent callers are serialized, so lines from different senders
    /// never interleave on the wire. A `close` issued while the write is
    /// blocked aborts it with [`SessionError::Closed`].
    pub async fn send(&self, line: &str) -> Result<(), SessionError> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(SessionError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SessionError::Closed);
        };

        select! {
            result = write_line(writer, line) => result.map_err(SessionError::Write),
            _ = wait_closed(closed) => Err(SessionError::Closed),
        }
    }

    /// Marks the session dead, wakes anyone waiting in [`Session::closed`],
    /// then shuts down and drops the output half. Safe to call repeatedly
    /// and from several tasks at once.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                debug!(session = %self.id, ?error, "output already gone while closing");
            }
        }
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        wait_closed(self.closed.subscribe()).await;
    }
}

async fn write_line(writer: &mut BoxedWriter, line: &str) -> std::io::Result<()> {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(b'\n');
    writer.write_all(&framed).await?;
    writer.flush().await
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Newline framing over the input half of a connection.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_line_bytes: usize,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_max_line_bytes(inner, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Reads the next line without its terminator (`\n` or `\r\n`).
    ///
    /// `Ok(None)` means the peer closed its side cleanly. A final line with
    /// no terminator before end of stream is still returned. Cancel safe:
    /// bytes of a partially read line are kept for the next call.
    ///
    /// Fails with [`SessionError::LineTooLong`] once `max_line_bytes` arrive
    /// without a newline; nothing past the limit is buffered.
    pub async fn receive_line(&mut self) -> Result<Option<String>, SessionError> {
        let remaining = self.max_line_bytes.saturating_sub(self.buf.len()) as u64;
        let bytes = (&mut self.inner)
            .take(remaining)
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(SessionError::Read)?;
        if bytes == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let terminated = self.buf.last() == Some(&b'\n');
        if !terminated && self.buf.len() >= self.max_line_bytes {
            self.buf.clear();
            return Err(SessionError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }

        if terminated {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        String::from_utf8(std::mem::take(&mut self.buf))
            .map(Some)
            .map_err(|_| SessionError::InvalidUtf8)
    }
}
