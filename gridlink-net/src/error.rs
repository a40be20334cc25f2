use crate::transport::TransportKind;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("would block")]
    WouldBlock,
    #[error("timed out")]
    TimedOut,
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("transport not initialized")]
    NotInitialized,
    #[error("no peer address to send to")]
    NoPeerAddress,

    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("exchange failed: {0}")]
    Exchange(String),
    #[error("message of {len} bytes exceeds maximum of {max} bytes")]
    MessageOverflow { len: usize, max: usize },
    #[error("tag not found in message: {0}")]
    TagNotFound(String),
    #[error("tag {tag} has value {found}, expected {expected}")]
    TagMismatch {
        tag: String,
        expected: String,
        found: String,
    },
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("parsing error: {0}")]
    ParsingError(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(TransportKind),

    #[error("failed parsing int: {0}")]
    IntParseError(#[from] std::num::ParseIntError),
    #[error("failed parsing float: {0}")]
    FloatParseError(#[from] std::num::ParseFloatError),
    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    CoreError(#[from] gridlink_core::error::Error),

    #[error("other: {0}")]
    Other(String),
}
