//! Checkpoint (data) files, the meta file and the active marker
//!
//! A checkpoint is a full dump of a store as of one transaction ID, written
//! to `<txid>.json.tmp`, fsynced and renamed into place. Only the file with
//! the highest ID is authoritative; older ones are leftovers to delete.

use crate::txid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use waypoint_common::{Error, Result};

pub(crate) const META_FILE: &str = "meta.json";
pub(crate) const LOG_FILE: &str = "log.json";
pub(crate) const ACTIVE_FILE: &str = "active";
pub(crate) const FORMAT_VERSION: &str = "1";

const DATA_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    version: String,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    key: &'a str,
    value: &'a Value,
}

#[derive(Deserialize)]
struct Entry {
    key: String,
    value: Value,
}

/// Make sure the store directory carries a compatible meta file.
///
/// A missing meta file is written. An unreadable or incompatible one is a
/// hard failure: the directory holds data we do not understand.
pub(crate) fn ensure_meta(dir: &Path, options: &OpenOptions) -> Result<()> {
    let path = dir.join(META_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let meta = Meta {
                version: FORMAT_VERSION.to_string(),
            };
            write_synced(&path, options, &serde_json::to_vec(&meta)?)?;
            debug!("Wrote meta file {:?}", path);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let meta: Meta = serde_json::from_slice(&data)
        .map_err(|e| Error::storage(format!("invalid meta file {}: {}", path.display(), e)))?;
    if meta.version != FORMAT_VERSION {
        return Err(Error::IncompatibleVersion {
            found: meta.version,
            expected: FORMAT_VERSION.to_string(),
        });
    }
    Ok(())
}

/// All checkpoint files in `dir`, oldest first
pub(crate) fn list_data_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let id = name
                .to_str()?
                .strip_suffix(DATA_SUFFIX)?
                .parse::<u64>()
                .ok()?;
            Some((id, entry.path()))
        })
        .collect();

    files.sort_by(|a, b| txid::compare(a.0, b.0));
    Ok(files)
}

/// Load one checkpoint file
pub(crate) fn read_data_file(path: &Path) -> Result<HashMap<String, Value>> {
    let file = File::open(path)?;
    let entries: Vec<Entry> = serde_json::from_reader(BufReader::new(file))?;
    Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
}

/// Write a checkpoint of `table` as of `id` and return its path
pub(crate) fn write_data_file(
    dir: &Path,
    id: u64,
    table: &HashMap<String, Value>,
    options: &OpenOptions,
    sync_directory: bool,
) -> Result<PathBuf> {
    let path = dir.join(format!("{id}{DATA_SUFFIX}"));
    let temp_path = dir.join(format!("{id}{DATA_SUFFIX}{TMP_SUFFIX}"));

    {
        let file = options
            .clone()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);

        let entries: Vec<EntryRef<'_>> = table
            .iter()
            .map(|(key, value)| EntryRef { key, value })
            .collect();
        serde_json::to_writer(&mut writer, &entries)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, &path)?;

    if sync_directory && let Err(e) = sync_dir(dir) {
        warn!("Failed to sync directory {:?}: {}", dir, e);
    }

    Ok(path)
}

/// Record the last written checkpoint. Never read back for correctness.
pub(crate) fn write_active_marker(dir: &Path, checkpoint: &Path, options: &OpenOptions) {
    let marker = dir.join(ACTIVE_FILE);
    let contents = checkpoint.to_string_lossy();
    if let Err(e) = write_synced(&marker, options, contents.as_bytes()) {
        warn!("Failed to update active marker {:?}: {}", marker, e);
    }
}

/// Delete checkpoint files older than `keep`. Failures are logged only.
pub(crate) fn remove_superseded(dir: &Path, keep: u64) {
    let files = match list_data_files(dir) {
        Ok(files) => files,
        Err(e) => {
            warn!("Failed to list checkpoints in {:?}: {}", dir, e);
            return;
        }
    };

    for (id, path) in files {
        if id == keep || !txid::is_less_or_equal(id, keep) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed superseded checkpoint {:?}", path),
            Err(e) => warn!("Failed to remove superseded checkpoint {:?}: {}", path, e),
        }
    }
}

/// Remove half-written checkpoint files left by an interrupted process
pub(crate) fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(TMP_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove temp file {:?}: {}", entry.path(), e),
            }
        }
    }
    Ok(removed)
}

fn write_synced(path: &Path, options: &OpenOptions, data: &[u8]) -> Result<()> {
    let mut file = options
        .clone()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
