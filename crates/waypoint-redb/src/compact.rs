//! Copy-compaction
//!
//! The live database is copied into a fresh file, which then replaces the
//! store file. Regular operations are locked out for the whole swap.
//!
//! Temporary files are named `<store>.db.compact-<uuid>` so leftovers of a
//! crashed process can be recognised and swept on startup.

use crate::error::RedbResult;
use crate::store::{RedbStore, open_database};
use crate::tables::{DATA, METADATA};
use redb::{Database, ReadableTable};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use waypoint_common::{Error, Result, Store};

const COMPACT_MARKER: &str = ".db.compact-";

/// File sizes around one compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub size_before: u64,
    pub size_after: u64,
}

/// Two-threshold rebound trigger of one store.
///
/// Arms once the file grows past the needed threshold, fires once live data
/// has dropped below the trigger threshold, then stays disarmed until the
/// file grows past both the needed threshold and its size after the last
/// compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReboundState {
    armed: bool,
    floor: u64,
}

impl ReboundState {
    /// Feed one size observation. Returns true when compaction is due.
    pub fn observe(&mut self, file_size: u64, live_bytes: u64, needed: u64, trigger: u64) -> bool {
        if file_size > needed.max(self.floor) {
            self.armed = true;
        }
        self.armed && live_bytes < trigger
    }

    /// Record a compaction that left the file at `size`
    pub const fn compacted(&mut self, size: u64) {
        self.armed = false;
        self.floor = size;
    }

    pub const fn is_armed(&self) -> bool {
        self.armed
    }
}

impl RedbStore {
    /// Rewrite the store into a fresh file and swap it into place.
    ///
    /// On failure the original file is kept and the store stays usable. A
    /// copy that is not smaller than the original is discarded.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut guard = self.db.write();
        let db = guard
            .as_ref()
            .ok_or_else(|| Error::StoreClosed(self.name().to_string()))?;

        let size_before = fs::metadata(self.path())?.len();
        let temp_path = self.compaction_temp_path()?;
        debug!("Compacting store '{}' into {:?}", self.name(), temp_path);

        if let Err(e) = copy_compact(db, &temp_path, self.config.file_mode) {
            remove_quietly(&temp_path);
            return Err(Error::compaction_failed(self.name(), e));
        }

        let copy_size = match fs::metadata(&temp_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                remove_quietly(&temp_path);
                return Err(Error::compaction_failed(self.name(), e));
            }
        };
        if copy_size >= size_before {
            remove_quietly(&temp_path);
            info!(
                "Compaction of store '{}' would not shrink it ({} -> {} bytes), keeping the original",
                self.name(),
                size_before,
                copy_size
            );
            self.rebound.lock().compacted(size_before);
            return Ok(CompactionStats {
                size_before,
                size_after: size_before,
            });
        }

        // The file handle must be released before the file is replaced
        *guard = None;

        if let Err(e) = swap_into_place(&temp_path, self.path()) {
            remove_quietly(&temp_path);
            match open_database(self.path(), self.config.file_mode) {
                Ok(db) => *guard = Some(db),
                Err(reopen) => error!(
                    "Failed to reopen store '{}' after failed compaction: {}",
                    self.name(),
                    reopen
                ),
            }
            return Err(Error::compaction_failed(self.name(), e));
        }

        let db = open_database(self.path(), self.config.file_mode)
            .map_err(|e| Error::compaction_failed(self.name(), e))?;
        *guard = Some(db);

        let size_after = fs::metadata(self.path())?.len();
        self.rebound.lock().compacted(size_after);
        info!(
            "Compacted store '{}': {} -> {} bytes",
            self.name(),
            size_before,
            size_after
        );
        Ok(CompactionStats {
            size_before,
            size_after,
        })
    }

    /// Whether the next rebound check would compact
    pub fn needs_rebound_compaction(&self) -> Result<bool> {
        let stats = self.stats()?;
        let compaction = &self.config.compaction;
        let mut rebound = *self.rebound.lock();
        Ok(rebound.observe(
            stats.file_size,
            stats.live_bytes,
            compaction.rebound_needed_bytes(),
            compaction.rebound_trigger_bytes(),
        ))
    }

    /// Compact if the rebound trigger fires
    pub fn rebound_compact(&self) -> Result<Option<CompactionStats>> {
        let stats = self.stats()?;
        let compaction = &self.config.compaction;
        let due = self.rebound.lock().observe(
            stats.file_size,
            stats.live_bytes,
            compaction.rebound_needed_bytes(),
            compaction.rebound_trigger_bytes(),
        );
        if !due {
            return Ok(None);
        }

        match self.compact() {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                // Retry only once the file has grown further
                self.rebound.lock().compacted(stats.file_size);
                Err(e)
            }
        }
    }

    fn compaction_temp_path(&self) -> Result<PathBuf> {
        let dir = match &self.config.compaction.temp_dir {
            Some(dir) => dir.clone(),
            None => self
                .path()
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        };
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{}{}{}", self.name(), COMPACT_MARKER, Uuid::new_v4())))
    }
}

/// Copy both tables of `src` into a new database at `dest` in one write
/// transaction, then compact the copy until redb reports nothing left to
/// move.
fn copy_compact(src: &Database, dest: &Path, file_mode: u32) -> RedbResult<()> {
    let mut target = open_database(dest, file_mode)?;
    {
        let read_txn = src.begin_read()?;
        let write_txn = target.begin_write()?;
        {
            let src_data = read_txn.open_table(DATA)?;
            let mut data = write_txn.open_table(DATA)?;
            for entry in src_data.iter()? {
                let (key, value) = entry?;
                data.insert(key.value(), value.value())?;
            }

            let src_metadata = read_txn.open_table(METADATA)?;
            let mut metadata = write_txn.open_table(METADATA)?;
            for entry in src_metadata.iter()? {
                let (key, times) = entry?;
                metadata.insert(key.value(), times.value())?;
            }
        }
        write_txn.commit()?;
    }

    while target.compact()? {}
    Ok(())
}

/// Move the compacted file over the store file, copying when the two live
/// on different devices.
fn swap_into_place(temp: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(temp, dest) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!("Rename across devices, copying {:?} to {:?}", temp, dest);
            copy_across_devices(temp, dest)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Copy `temp` next to `dest`, fsync it, rename it over `dest` and only then
/// delete `temp`.
pub(crate) fn copy_across_devices(temp: &Path, dest: &Path) -> io::Result<()> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name.strip_suffix(".db").unwrap_or(&file_name);
    let sibling = dest.with_file_name(format!("{stem}{COMPACT_MARKER}{}", Uuid::new_v4()));

    if let Err(e) = copy_synced(temp, &sibling).and_then(|()| fs::rename(&sibling, dest)) {
        remove_quietly(&sibling);
        return Err(e);
    }

    if let Err(e) = fs::remove_file(temp) {
        warn!("Failed to remove compaction temp file {:?}: {}", temp, e);
    }
    Ok(())
}

fn copy_synced(from: &Path, to: &Path) -> io::Result<()> {
    let mut src = File::open(from)?;
    let mut out = OpenOptions::new().write(true).create_new(true).open(to)?;
    io::copy(&mut src, &mut out)?;
    out.sync_all()
}

/// Delete compaction temp files left behind by an interrupted process
pub fn sweep_compaction_leftovers(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Failed to scan {:?} for compaction leftovers: {}", dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_name().to_string_lossy().contains(COMPACT_MARKER) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("Removed compaction leftover {:?}", entry.path());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove compaction leftover {:?}: {}", entry.path(), e),
        }
    }
    removed
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to remove {:?}: {}", path, e);
    }
}
