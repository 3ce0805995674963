//! Waypoint redb - B-tree store engine
//!
//! One redb file per store with two tables:
//! - **data**: key -> JSON-encoded value
//! - **metadata**: key -> (last access, last change) in nanoseconds
//!
//! On top of the backend contract the engine offers TTL garbage collection
//! (a full scan in one transaction, or cursor-resumed batches) and
//! copy-compaction, either on open or when the rebound thresholds say the
//! file is mostly dead space.

mod compact;
mod error;
mod gc;
mod registry;
mod store;
pub mod tables;

pub use compact::{CompactionStats, ReboundState, sweep_compaction_leftovers};
pub use error::{RedbResult, RedbStoreError};
pub use gc::{GcStats, is_expired};
pub use registry::RedbRegistry;
pub use store::{AccessTimes, RedbStore, StoreStats, now_ns};
