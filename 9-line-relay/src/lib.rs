//! Line-delimited TCP broadcast relay.
//!
//! Every line one peer sends is written to every other connected peer. The
//! pieces, leaf first:
//!
//! - [`session`] wraps one connection: a lockable write half with a
//!   liveness flag, plus the [`session::LineReader`] that frames input.
//! - [`registry`] is the set of live sessions and the best-effort fan-out.
//! - [`handler`] runs one connection's read loop and its teardown.
//! - [`relay`] binds the listener and spawns a handler per connection.
//! - [`config`] and [`cli`] cover settings; [`observe`] is where events and
//!   contained errors are reported; [`client`] is a small terminal client.
//!
//! Wire format: UTF-8 text, one message per `\n`-terminated line, no
//! handshake. A line equal to the exit sentinel (default `exit`, any case)
//! disconnects its sender and is not relayed.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod observe;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::{Delivery, RelayConfig};
pub use error::{RelayError, SessionError};
pub use relay::Relay;
