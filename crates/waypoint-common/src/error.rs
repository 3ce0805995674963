//! Error types for Waypoint
//!
//! Every engine reports failures through this one taxonomy so that callers
//! holding a `dyn Store` can react to them without knowing the engine.

use thiserror::Error;

/// Common result type for Waypoint operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Waypoint
#[derive(Debug, Error)]
pub enum Error {
    /// The named store could not be opened. Other stores are unaffected.
    #[error("failed to access store '{name}': {reason}")]
    AccessFailed { name: String, reason: String },

    /// `get` on a key that is not present.
    #[error("key unknown: {0}")]
    KeyUnknown(String),

    /// Operation attempted on a closed store, handle or registry.
    #[error("store closed: {0}")]
    StoreClosed(String),

    #[error("compaction of store '{name}' failed: {reason}")]
    CompactionFailed { name: String, reason: String },

    #[error("incompatible store format version: found {found}, expected {expected}")]
    IncompatibleVersion { found: String, expected: String },

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an access failure for the named store
    pub fn access_failed(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::AccessFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a compaction failure for the named store
    pub fn compaction_failed(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::CompactionFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    #[must_use]
    pub const fn is_key_unknown(&self) -> bool {
        matches!(self, Self::KeyUnknown(_))
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::StoreClosed(_))
    }

    #[must_use]
    pub const fn is_access_failed(&self) -> bool {
        matches!(self, Self::AccessFailed { .. })
    }
}
