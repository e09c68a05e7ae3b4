use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_EXIT_SENTINEL, DEFAULT_LISTEN, DEFAULT_MAX_LINE_BYTES, Delivery, RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, rebroadcasting every received line to the other peers.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// host:port to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "LINE_RELAY_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Also deliver each line back to the connection that sent it.
    #[arg(long, env = "LINE_RELAY_ECHO")]
    pub echo: bool,

    /// Line that disconnects the sender instead of being relayed (case-insensitive).
    #[arg(long, env = "LINE_RELAY_EXIT_SENTINEL", default_value = DEFAULT_EXIT_SENTINEL)]
    pub exit_sentinel: String,

    /// Relay every line, including the exit sentinel.
    #[arg(long, conflicts_with = "exit_sentinel")]
    pub no_exit_sentinel: bool,

    /// Close connections that send nothing for this many seconds.
    #[arg(long, env = "LINE_RELAY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Disconnect peers that send a line longer than this, terminator included.
    #[arg(long, env = "LINE_RELAY_MAX_LINE_BYTES", default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,
}

impl ServeArgs {
    pub fn to_config(&self) -> RelayConfig {
        let delivery = if self.echo {
            Delivery::IncludeSender
        } else {
            Delivery::ExcludeSender
        };
        let sentinel = (!self.no_exit_sentinel).then(|| self.exit_sentinel.clone());

        RelayConfig::new(self.listen.clone(), delivery)
            .with_exit_sentinel(sentinel)
            .with_idle_timeout(self.idle_timeout_secs.map(Duration::from_secs))
            .with_max_line_bytes(self.max_line_bytes)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Address of the relay to connect to.
    #[arg(long, env = "LINE_RELAY_SERVER", default_value = DEFAULT_LISTEN)]
    pub server: String,

    /// Line that ends the session; match the relay's `--exit-sentinel`.
    #[arg(long, env = "LINE_RELAY_EXIT_SENTINEL", default_value = DEFAULT_EXIT_SENTINEL)]
    pub exit_sentinel: String,

    /// The relay runs without a sentinel; only end of input or Ctrl-C leaves.
    #[arg(long, conflicts_with = "exit_sentinel")]
    pub no_exit_sentinel: bool,
}

impl ConnectArgs {
    pub fn exit_sentinel(&self) -> Option<&str> {
        (!self.no_exit_sentinel).then_some(self.exit_sentinel.as_str())
    }
}
