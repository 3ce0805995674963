//! Store backed by one redb file.
//!
//! Every `get` and `set` updates the entry's access times in the same write
//! transaction as the data access, so `metadata` always agrees with `data`
//! as of the last commit.

use crate::compact::ReboundState;
use crate::error::RedbResult;
use crate::tables::{DATA, METADATA};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use waypoint_common::backend::Visitor;
use waypoint_common::{Error, RedbConfig, Result, Store, ValueDecoder};

/// Access timestamps of one entry, nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessTimes {
    pub last_access: u64,
    pub last_change: u64,
}

/// Space usage of a store file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Bytes allocated on disk
    pub file_size: u64,
    /// Bytes used by stored entries and B-tree metadata
    pub live_bytes: u64,
    pub entries: u64,
}

/// redb-backed store
pub struct RedbStore {
    name: String,
    path: PathBuf,
    pub(crate) config: Arc<RedbConfig>,
    /// `None` once closed. Compaction takes the write side to swap the file.
    pub(crate) db: RwLock<Option<Database>>,
    pub(crate) rebound: Mutex<ReboundState>,
}

impl fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open (or create) the store file at `path`.
    pub fn open(name: &str, path: impl AsRef<Path>, config: Arc<RedbConfig>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = open_database(&path, config.file_mode)?;
        debug!("Opened redb store '{}' at {:?}", name, path);
        Ok(Self {
            name: name.to_string(),
            path,
            config,
            db: RwLock::new(Some(db)),
            rebound: Mutex::new(ReboundState::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.db.read().is_none()
    }

    /// Run `f` against the open database
    pub(crate) fn with_db<T>(&self, f: impl FnOnce(&Database) -> RedbResult<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard
            .as_ref()
            .ok_or_else(|| Error::StoreClosed(self.name.clone()))?;
        Ok(f(db)?)
    }

    /// Access times recorded for `key`
    pub fn access_times(&self, key: &str) -> Result<Option<AccessTimes>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(METADATA)?;
            Ok(table.get(key)?.map(|guard| {
                let (last_access, last_change) = guard.value();
                AccessTimes {
                    last_access,
                    last_change,
                }
            }))
        })
    }

    /// Current space usage
    pub fn stats(&self) -> Result<StoreStats> {
        let (live_bytes, entries) = self.with_db(|db| {
            let txn = db.begin_write()?;
            let stats = txn.stats()?;
            let entries = txn.open_table(DATA)?.len()?;
            txn.abort()?;
            Ok((stats.stored_bytes() + stats.metadata_bytes(), entries))
        })?;
        let file_size = fs::metadata(&self.path)?.len();
        Ok(StoreStats {
            file_size,
            live_bytes,
            entries,
        })
    }

    /// Read-only access to the underlying database for introspection.
    /// Callers must not write through it.
    pub fn with_raw_database<T>(&self, f: impl FnOnce(&Database) -> T) -> Result<T> {
        self.with_db(|db| Ok(f(db)))
    }
}

impl Store for RedbStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn has(&self, key: &str) -> Result<bool> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(DATA)?;
            Ok(table.get(key)?.is_some())
        })
    }

    fn get_value(&self, key: &str) -> Result<Value> {
        let now = now_ns();
        self.with_db(|db| {
            let txn = db.begin_write()?;
            let value = {
                let data = txn.open_table(DATA)?;
                let value: Value = match data.get(key)? {
                    Some(raw) => serde_json::from_str(raw.value())?,
                    None => return Err(Error::KeyUnknown(key.to_string()).into()),
                };

                let mut metadata = txn.open_table(METADATA)?;
                let last_change = metadata.get(key)?.map_or(now, |times| times.value().1);
                metadata.insert(key, (now, last_change))?;
                value
            };
            txn.commit()?;
            Ok(value)
        })
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        let now = now_ns();
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut data = txn.open_table(DATA)?;
                data.insert(key, encoded.as_str())?;
                let mut metadata = txn.open_table(METADATA)?;
                metadata.insert(key, (now, now))?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut data = txn.open_table(DATA)?;
                data.remove(key)?;
                let mut metadata = txn.open_table(METADATA)?;
                metadata.remove(key)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    fn each(&self, visit: &mut Visitor<'_>) -> Result<()> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(DATA)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                if !visit(key.value(), ValueDecoder::Json(value.value()))? {
                    break;
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.take().is_none() {
            return Err(Error::StoreClosed(self.name.clone()));
        }
        debug!("Closed redb store '{}'", self.name);
        Ok(())
    }
}

/// Open the database file, fix its permissions and create both tables so
/// later read transactions don't fail.
pub(crate) fn open_database(path: &Path, file_mode: u32) -> RedbResult<Database> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let db = Database::create(path)?;
    enforce_file_mode(path, file_mode)?;

    let txn = db.begin_write()?;
    {
        let _t = txn.open_table(DATA)?;
        let _t = txn.open_table(METADATA)?;
    }
    txn.commit()?;
    Ok(db)
}

#[cfg(unix)]
fn enforce_file_mode(path: &Path, file_mode: u32) -> RedbResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let current = fs::metadata(path)?.permissions().mode() & 0o777;
    if current != file_mode {
        info!(
            "Correcting permissions of {:?} from {:o} to {:o}",
            path, current, file_mode
        );
        fs::set_permissions(path, fs::Permissions::from_mode(file_mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn enforce_file_mode(_path: &Path, _file_mode: u32) -> RedbResult<()> {
    Ok(())
}

/// Wall clock in nanoseconds since the Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
