//! This library provides the networking side of `gridlink` connectors.
//!
//! Values bound with `gridlink-core` variable maps are moved between two
//! processes by a [`Connection`]. One side is the client, which starts
//! every exchange, and the other is the server, which answers.
//!
//!
//! # Message exchange
//!
//! Every message is described by a [`Program`], a list of instructions
//! like "start a message", "tag `method` with `precommit`", "put every
//! value of the write cache here" or "finish and send". The same program
//! is encoded by the sending side and decoded by the receiving side, so a
//! single call site describes both halves of the exchange:
//!
//! - [`Connection::client_initiated`] runs a message sent by the client,
//! - [`Connection::server_response`] runs the server's answer.
//!
//! The wire format is up to the codec. The plain `tag=value` codec is used
//! by default:
//!
//! ```text
//! {method="precommit", data={bus.v="120.5"}, id=4}
//! ```
//!
//! [`Connection::update`] wraps a whole phase exchange and is what
//! simulations call at every step.
//!
//!
//! # Transports
//!
//! - `udp`: single datagram per message, prefixed with a 32 byte textual
//!   header compatible with existing peers,
//! - `tcp`: stream of messages framed with the same header,
//! - `channel`: in-process pair, handy for coupling two connections inside
//!   a single program.
//!
//!
//! # Serving many peers
//!
//! [`Listener`] accepts tcp connections and udp datagrams and runs
//! server-mode connections on a pool of worker threads.
//!
//! [`Connection`]: connection/struct.Connection.html
//! [`Connection::client_initiated`]: connection/struct.Connection.html#method.client_initiated
//! [`Connection::server_response`]: connection/struct.Connection.html#method.server_response
//! [`Connection::update`]: connection/struct.Connection.html#method.update
//! [`Program`]: program/struct.Program.html
//! [`Listener`]: listener/struct.Listener.html

#![allow(unused)]

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod program;
pub mod transport;

pub use codec::{BodyParser, ExchangeTranslator, FieldMode, Fields, PlainExport, PlainImport};
pub use connection::{Connection, Mode};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use listener::{Listener, ListenerConfig, SessionHandler};
pub use program::{CacheSelector, Instruction, Program};
pub use transport::{ErrorPolicy, Transport, TransportKind};
