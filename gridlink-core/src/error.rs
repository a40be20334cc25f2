//! Error types.

use std::num::{ParseFloatError, ParseIntError};

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("parsing error: {0}")]
    ParsingError(String),
    #[error("failed parsing int: {0}")]
    ParseIntError(#[from] ParseIntError),
    #[error("failed parsing float: {0}")]
    ParseFloatError(#[from] ParseFloatError),

    #[error("unable to resolve local name: {0}")]
    ResolutionError(String),
    #[error("bound property is no longer available: {0}")]
    PropertyExpired(String),
    #[error("invalid value for {kind} property: {value}")]
    InvalidValue { kind: String, value: String },
    #[error("invalid value type: {0}")]
    InvalidValueKind(String),

    #[error("duplicate cache item creation for {local} <-> {remote}")]
    DuplicateCacheItem { local: String, remote: String },
    #[error("cache index can't grow past modulo {0}")]
    CacheIndexExhausted(u64),
    #[error("cache {name} is full ({size} items)")]
    CacheFull { name: String, size: usize },
    #[error("value of {len} bytes doesn't fit in cache item of {capacity} bytes")]
    ValueTooLarge { len: usize, capacity: usize },
    #[error("translator error: {0}")]
    TranslatorError(String),

    #[error("other error: {0}")]
    Other(String),
}
