//! Waypoint Common - Shared types and the storage backend contract
//!
//! This crate provides the pieces every Waypoint storage engine agrees on:
//! the error taxonomy, configuration structures, the value codec, the
//! `Backend`/`Store` traits that the registry layer multiplexes, and the
//! open-store table both engines keep.

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod open_stores;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{Backend, Store, StoreExt, validate_store_name};
pub use codec::ValueDecoder;
pub use config::{CompactionConfig, Config, MemlogConfig, RedbConfig};
pub use error::{Error, Result};
pub use open_stores::{OpenStores, Reservation};
