//! Configuration types for Waypoint
//!
//! Loading these from files is the caller's business; the engines only
//! consume the structures defined here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Root configuration for Waypoint
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WAL engine configuration
    pub memlog: MemlogConfig,
    /// B-tree engine configuration
    pub redb: RedbConfig,
}

impl Config {
    /// Reject settings the engines cannot work with
    pub fn validate(&self) -> Result<()> {
        self.memlog.validate()?;
        self.redb.validate()
    }
}

/// WAL engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemlogConfig {
    /// Directory holding one sub-directory per store
    pub root: PathBuf,
    /// Permission bits for files the engine creates
    pub file_mode: u32,
    /// Log size that triggers a checkpoint on the next write
    pub checkpoint_size_bytes: u64,
    /// Buffer size for log writes
    pub write_buffer_size: usize,
    /// Fsync the log after every appended record
    pub sync_on_write: bool,
    /// Fsync the store directory after a checkpoint rename
    pub sync_directory: bool,
}

impl Default for MemlogConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/memlog"),
            file_mode: 0o600,
            checkpoint_size_bytes: 10 * MIB,
            write_buffer_size: 64 * 1024,
            sync_on_write: false,
            sync_directory: true,
        }
    }
}

impl MemlogConfig {
    /// Create config rooted at the given directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(Error::configuration("memlog.write_buffer_size must be > 0"));
        }
        Ok(())
    }
}

/// B-tree engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedbConfig {
    /// Directory holding one database file per store
    pub root: PathBuf,
    /// Permission bits enforced on store files
    pub file_mode: u32,
    /// Inactivity after which entries are garbage collected (0 = never)
    pub ttl_secs: u64,
    /// Interval between GC runs (0 = use the TTL)
    pub gc_interval_secs: u64,
    /// A GC scan slower than this logs a warning (milliseconds)
    pub gc_warn_after_ms: u64,
    /// Compaction configuration
    pub compaction: CompactionConfig,
}

impl Default for RedbConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/redb"),
            file_mode: 0o600,
            ttl_secs: 0,
            gc_interval_secs: 0,
            gc_warn_after_ms: 5000,
            compaction: CompactionConfig::default(),
        }
    }
}

impl RedbConfig {
    /// Create config rooted at the given directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Entry time-to-live, `None` when GC is disabled
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    /// How often the registry runs GC, `None` when GC is disabled
    pub fn gc_interval(&self) -> Option<Duration> {
        let ttl = self.ttl()?;
        if self.gc_interval_secs > 0 {
            Some(Duration::from_secs(self.gc_interval_secs))
        } else {
            Some(ttl)
        }
    }

    pub const fn gc_warn_after(&self) -> Duration {
        Duration::from_millis(self.gc_warn_after_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.compaction.validate()
    }
}

/// Compaction configuration for the B-tree engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Compact every store when it is opened
    pub on_start: bool,
    /// Enable online rebound compaction
    pub rebound_enabled: bool,
    /// File size (MiB) above which a store is considered for compaction
    pub rebound_needed_threshold_mib: u64,
    /// Live data size (MiB) below which compaction is considered worthwhile
    pub rebound_trigger_threshold_mib: u64,
    /// Maximum entries touched per write transaction during batched cleanup
    pub max_transaction_size: usize,
    /// Interval between rebound checks (seconds)
    pub check_interval_secs: u64,
    /// Where compaction writes its temporary copy (defaults to the store root)
    pub temp_dir: Option<PathBuf>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            on_start: false,
            rebound_enabled: false,
            rebound_needed_threshold_mib: 100,
            rebound_trigger_threshold_mib: 10,
            max_transaction_size: 10_000,
            check_interval_secs: 5,
            temp_dir: None,
        }
    }
}

impl CompactionConfig {
    pub const fn rebound_needed_bytes(&self) -> u64 {
        self.rebound_needed_threshold_mib * MIB
    }

    pub const fn rebound_trigger_bytes(&self) -> u64 {
        self.rebound_trigger_threshold_mib * MIB
    }

    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_transaction_size == 0 {
            return Err(Error::configuration(
                "redb.compaction.max_transaction_size must be > 0",
            ));
        }
        if self.rebound_enabled {
            if self.rebound_trigger_threshold_mib >= self.rebound_needed_threshold_mib {
                return Err(Error::configuration(
                    "redb.compaction.rebound_trigger_threshold_mib must be below rebound_needed_threshold_mib",
                ));
            }
            if self.check_interval_secs == 0 {
                return Err(Error::configuration(
                    "redb.compaction.check_interval_secs must be > 0",
                ));
            }
        }
        Ok(())
    }
}
