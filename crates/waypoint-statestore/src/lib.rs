//! Waypoint statestore - shared store handles
//!
//! Many independent consumers may ask for the same store name. The
//! [`Registry`] opens one physical store per name and hands every consumer
//! its own [`StoreHandle`]. The physical store is closed exactly once, when
//! the last handle over it is closed.
//!
//! ```text
//! consumer A ─ StoreHandle ┐
//!                          ├─ SharedStore (refs = 2) ─ Backend::Store
//! consumer B ─ StoreHandle ┘
//! ```

mod registry;
mod store;

pub use registry::Registry;
pub use store::StoreHandle;
