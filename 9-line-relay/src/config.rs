use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "localhost:1234";
pub const DEFAULT_EXIT_SENTINEL: &str = "exit";
/// Longest accepted line, terminator included.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Whether a line is delivered back to the connection that sent it.
///
/// Has no `Default`; every relay picks one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    ExcludeSender,
    IncludeSender,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `host:port` handed to the listener; host names are resolved at bind time.
    pub listen: String,
    pub delivery: Delivery,
    /// Line that asks the relay to drop the sending connection. Compared
    /// case-insensitively and never relayed. `None` disables the feature.
    pub exit_sentinel: Option<String>,
    /// Close connections that stay silent this long. `None` keeps idle
    /// connections open until a side closes.
    pub idle_timeout: Option<Duration>,
    /// A peer that sends more than this many bytes without a newline is
    /// disconnected with a read error.
    pub max_line_bytes: usize,
}

impl RelayConfig {
    pub fn new(listen: impl Into<String>, delivery: Delivery) -> Self {
        Self {
            listen: listen.into(),
            delivery,
            exit_sentinel: Some(DEFAULT_EXIT_SENTINEL.to_string()),
            idle_timeout: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_exit_sentinel(mut self, sentinel: Option<String>) -> Self {
        self.exit_sentinel = sentinel.filter(|word| !word.is_empty());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit.max(1);
        self
    }

    pub fn is_exit_request(&self, line: &str) -> bool {
        matches_sentinel(self.exit_sentinel.as_deref(), line)
    }
}

/// Case-insensitive sentinel comparison shared by the relay and the client.
pub fn matches_sentinel(sentinel: Option<&str>, line: &str) -> bool {
    sentinel.is_some_and(|sentinel| !sentinel.is_empty() && line.eq_ignore_ascii_case(sentinel))
}
