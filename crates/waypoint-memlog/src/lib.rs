//! Waypoint memlog - WAL-backed in-memory store
//!
//! Each store lives in its own directory and keeps all entries in memory:
//! - **Log**: append-only JSON lines, one record per mutation
//! - **Checkpoints**: full dumps named after the last transaction ID
//! - **Meta**: format version, checked on open
//!
//! # Directory layout
//!
//! ```text
//! <root>/<store>/
//!   meta.json      {"version":"1"}
//!   log.json       {"op":"set","id":7,"key":"a","value":{..},"crc":..}
//!   <txid>.json    [{"key":"a","value":{..}}, ..]
//!   active         path of the last written checkpoint (informational)
//! ```
//!
//! # Recovery
//! 1. Load the checkpoint with the highest transaction ID
//! 2. Replay log records with IDs above it, stopping at the first gap or
//!    checksum mismatch
//! 3. A gap, an unreadable log or an unterminated last record marks the
//!    log invalid; the next write checkpoints instead of appending

mod checkpoint;
mod registry;
mod store;
pub mod txid;
mod wal;

pub use registry::MemlogRegistry;
pub use store::{CheckpointPredicate, MemlogStore, StoreState, size_predicate};
