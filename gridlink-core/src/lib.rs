//! This library implements the data side of a co-simulation connector.
//!
//! A connector moves named local values to and from an external process.
//! Which values are moved, and in which direction, is described by a
//! [`VarMap`]: a list of bindings between local property names and remote
//! tags, parsed from short specification strings like `meter.voltage ->
//! bus.v`. Bound values pass through a [`Cache`], an ordered view over a
//! hashed [`CacheIndex`] holding one [`CacheItem`] per bound property and
//! remote tag.
//!
//! The host object model is reached through the [`Property`] and
//! [`Resolver`] traits. A small in-memory implementation, [`ObjectStore`],
//! is provided for tools and tests.
//!
//! This library doesn't do any networking. For transports and the message
//! exchange protocol see `gridlink-net`.
//!
//! # Using the library
//!
//! ```toml
//! gridlink-core = "0.1.0"
//! ```
//!
//! ## Example
//!
//! ```
//! use gridlink_core::property::PropertySpec;
//! use gridlink_core::{CommunicationType, ObjectStore, ValueKind, VarMap};
//!
//! let mut store = ObjectStore::new();
//! store
//!     .add_object(
//!         "meter",
//!         vec![PropertySpec::new("voltage", ValueKind::Float).with_value("120.0")],
//!     )
//!     .unwrap();
//!
//! let mut map = VarMap::new();
//! map.add("meter.voltage -> bus.v", CommunicationType::Unknown).unwrap();
//! assert_eq!(map.resolve(&store), 1);
//! ```
//!
//! [`VarMap`]: varmap/struct.VarMap.html
//! [`Cache`]: cache/struct.Cache.html
//! [`CacheIndex`]: cache/struct.CacheIndex.html
//! [`CacheItem`]: cache/struct.CacheItem.html
//! [`Property`]: property/trait.Property.html
//! [`Resolver`]: property/trait.Resolver.html
//! [`ObjectStore`]: property/struct.ObjectStore.html

#![allow(unused)]

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use cache::{Cache, CacheId, CacheIndex, CacheItem, CacheKey, ItemHandle, ItemRead};
pub use error::{Error, Result};
pub use property::{ObjectStore, Property, Resolver, Translator};
pub use var::{Complex, Value, ValueKind};
pub use varmap::{CommunicationType, Direction, LinkTarget, Phase, VarMap, VarMapEntry};

pub mod cache;
pub mod error;
pub mod property;
pub mod var;
pub mod varmap;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Floating point number type used throughout the library.
pub type Float = f64;
/// Integer number type used throughout the library.
pub type Int = i64;
