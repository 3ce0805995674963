//! Store write-ahead log
//!
//! One JSON object per line, each carrying the transaction ID it was
//! written under and a CRC32C of the record without its `crc` field:
//!
//! ```text
//! {"op":"set","id":7,"key":"a","value":{"offset":42},"crc":2493718371}
//! {"op":"remove","id":8,"key":"a","crc":1086263204}
//! ```
//!
//! A torn or garbled line, a checksum mismatch, or an ID that does not
//! follow its predecessor ends replay. Everything before it is kept.

use crate::txid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use waypoint_common::{Error, Result};

const CRC_FIELD: &str = ",\"crc\":";

/// Log record as read back from disk
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub(crate) enum LogRecord {
    Set { id: u64, key: String, value: Value },
    Remove { id: u64, key: String },
}

impl LogRecord {
    pub(crate) const fn id(&self) -> u64 {
        match self {
            Self::Set { id, .. } | Self::Remove { id, .. } => *id,
        }
    }
}

/// Log record as written, borrowing from the caller
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub(crate) enum LogRecordRef<'a> {
    Set {
        id: u64,
        key: &'a str,
        value: &'a Value,
    },
    Remove {
        id: u64,
        key: &'a str,
    },
}

/// Append handle on the active log file
pub(crate) struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    sync_on_write: bool,
}

impl LogWriter {
    /// Open the log for appending, creating it if needed
    pub(crate) fn open_append(
        path: &Path,
        options: &OpenOptions,
        buffer_size: usize,
        sync_on_write: bool,
    ) -> Result<Self> {
        let file = options.clone().append(true).create(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(buffer_size, file),
            size,
            sync_on_write,
        })
    }

    /// Start a fresh, empty log
    pub(crate) fn create(
        path: &Path,
        options: &OpenOptions,
        buffer_size: usize,
        sync_on_write: bool,
    ) -> Result<Self> {
        let file = options
            .clone()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(buffer_size, file),
            size: 0,
            sync_on_write,
        })
    }

    /// Append one record. The record is flushed to the OS before returning.
    pub(crate) fn append(&mut self, record: &LogRecordRef<'_>) -> Result<()> {
        let line = encode_line(record)?;

        self.writer.write_all(&line)?;
        self.writer.flush()?;
        if self.sync_on_write {
            self.writer.get_ref().sync_data()?;
        }

        self.size += line.len() as u64;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Current log size in bytes
    pub(crate) const fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Serialize `record` as one checksummed, newline-terminated line
pub(crate) fn encode_line(record: &LogRecordRef<'_>) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(record)?;
    let crc = crc32c::crc32c(&line);
    if line.pop() != Some(b'}') {
        return Err(Error::storage("log record is not a JSON object"));
    }
    line.extend_from_slice(format!("{CRC_FIELD}{crc}}}\n").as_bytes());
    Ok(line)
}

/// Verify the checksum of one line (without its terminator) and parse it
fn decode_line(line: &str) -> std::result::Result<LogRecord, String> {
    let pos = line.rfind(CRC_FIELD).ok_or("missing checksum")?;
    let stored: u32 = line[pos + CRC_FIELD.len()..]
        .strip_suffix('}')
        .and_then(|digits| digits.parse().ok())
        .ok_or("malformed checksum")?;

    let body = format!("{}}}", &line[..pos]);
    let computed = crc32c::crc32c(body.as_bytes());
    if computed != stored {
        return Err(format!(
            "checksum mismatch (stored {stored}, computed {computed})"
        ));
    }
    serde_json::from_str(&body).map_err(|e| e.to_string())
}

/// Result of replaying a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplayOutcome {
    /// ID of the last record applied, or the base ID if none were
    pub last_txid: u64,
    /// Number of records applied
    pub applied: usize,
    /// Replay stopped early on a torn record, bad checksum or ID gap
    pub corrupt: bool,
    /// The last record is intact but lost its line terminator. Appending
    /// to such a log would fuse the next record onto it.
    pub unterminated: bool,
    /// The log file did not exist
    pub missing: bool,
}

/// Replay `path` on top of state as of `base_txid`.
///
/// Records at or below `base_txid` are already contained in the checkpoint
/// and skipped. After that every record must carry exactly the next ID.
pub(crate) fn replay(
    path: &Path,
    base_txid: u64,
    mut apply: impl FnMut(LogRecord),
) -> Result<ReplayOutcome> {
    let mut outcome = ReplayOutcome {
        last_txid: base_txid,
        applied: 0,
        corrupt: false,
        unterminated: false,
        missing: false,
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            outcome.missing = true;
            return Ok(outcome);
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut line_no = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Log {:?} unreadable after line {}: {}", path, line_no, e);
                outcome.corrupt = true;
                break;
            }
        }
        line_no += 1;

        let terminated = buf.last() == Some(&b'\n');
        if terminated {
            buf.pop();
        }
        let Ok(line) = std::str::from_utf8(&buf) else {
            warn!("Log {:?} corrupt at line {}: invalid UTF-8", path, line_no);
            outcome.corrupt = true;
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let record = match decode_line(line) {
            Ok(record) => record,
            Err(reason) => {
                warn!("Log {:?} corrupt at line {}: {}", path, line_no, reason);
                outcome.corrupt = true;
                break;
            }
        };
        outcome.unterminated = !terminated;

        let id = record.id();
        if outcome.applied == 0 && txid::is_less_or_equal(id, base_txid) {
            continue;
        }
        if id != txid::next(outcome.last_txid) {
            warn!(
                "Log {:?} has a gap at line {}: expected txid {}, found {}",
                path,
                line_no,
                txid::next(outcome.last_txid),
                id
            );
            outcome.corrupt = true;
            break;
        }

        apply(record);
        outcome.last_txid = id;
        outcome.applied += 1;
    }

    debug!(
        "Replayed {} log records from {:?} (last txid {})",
        outcome.applied, path, outcome.last_txid
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn writer(path: &Path) -> LogWriter {
        LogWriter::create(path, &OpenOptions::new(), 4096, false).unwrap()
    }

    fn replay_all(path: &Path, base: u64) -> (Vec<LogRecord>, ReplayOutcome) {
        let mut records = Vec::new();
        let outcome = replay(path, base, |r| records.push(r)).unwrap();
        (records, outcome)
    }

    #[test]
    fn test_log_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");

        let mut log = writer(&path);
        let value = json!({"offset": 10});
        log.append(&LogRecordRef::Set { id: 1, key: "a", value: &value })
            .unwrap();
        log.append(&LogRecordRef::Remove { id: 2, key: "a" }).unwrap();
        assert_eq!(log.size(), std::fs::metadata(&path).unwrap().len());

        let (records, outcome) = replay_all(&path, 0);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            LogRecord::Set { id: 1, key: "a".into(), value }
        );
        assert_eq!(outcome.last_txid, 2);
        assert!(!outcome.corrupt);
    }

    #[test]
    fn test_log_line_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        log.append(&LogRecordRef::Remove { id: 9, key: "k" }).unwrap();

        let body = "{\"op\":\"remove\",\"id\":9,\"key\":\"k\"}";
        let crc = crc32c::crc32c(body.as_bytes());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            format!("{{\"op\":\"remove\",\"id\":9,\"key\":\"k\",\"crc\":{crc}}}\n")
        );
    }

    #[test]
    fn test_replay_rejects_flipped_digit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        let first = json!({"offset": 10});
        let second = json!({"offset": 1234});
        log.append(&LogRecordRef::Set { id: 1, key: "a", value: &first })
            .unwrap();
        log.append(&LogRecordRef::Set { id: 2, key: "a", value: &second })
            .unwrap();
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("1234", "1834")).unwrap();

        let (records, outcome) = replay_all(&path, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(outcome.last_txid, 1);
        assert!(outcome.corrupt);
    }

    #[test]
    fn test_replay_rejects_record_without_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(&path, "{\"op\":\"remove\",\"id\":1,\"key\":\"k\"}\n").unwrap();

        let (records, outcome) = replay_all(&path, 0);
        assert!(records.is_empty());
        assert!(outcome.corrupt);
    }

    #[test]
    fn test_replay_flags_missing_terminator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        log.append(&LogRecordRef::Remove { id: 1, key: "k" }).unwrap();
        log.append(&LogRecordRef::Remove { id: 2, key: "k" }).unwrap();
        drop(log);

        let (_, outcome) = replay_all(&path, 0);
        assert!(!outcome.unterminated);

        let mut bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.pop(), Some(b'\n'));
        std::fs::write(&path, &bytes).unwrap();

        let (records, outcome) = replay_all(&path, 0);
        assert_eq!(records.len(), 2);
        assert!(outcome.unterminated);
        assert!(!outcome.corrupt);
    }

    #[test]
    fn test_replay_skips_checkpointed_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        for id in 1..=5 {
            log.append(&LogRecordRef::Remove { id, key: "k" }).unwrap();
        }

        let (records, outcome) = replay_all(&path, 3);
        assert_eq!(records.iter().map(LogRecord::id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(outcome.last_txid, 5);
        assert!(!outcome.corrupt);
    }

    #[test]
    fn test_replay_stops_at_gap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        for id in [1, 2, 4, 5] {
            log.append(&LogRecordRef::Remove { id, key: "k" }).unwrap();
        }

        let (records, outcome) = replay_all(&path, 0);
        assert_eq!(records.len(), 2);
        assert_eq!(outcome.last_txid, 2);
        assert!(outcome.corrupt);
    }

    #[test]
    fn test_replay_stops_at_torn_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        log.append(&LogRecordRef::Remove { id: 1, key: "k" }).unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"set\",\"id\":2,\"ke").unwrap();

        let (records, outcome) = replay_all(&path, 0);
        assert_eq!(records.len(), 1);
        assert!(outcome.corrupt);
    }

    #[test]
    fn test_replay_missing_log() {
        let dir = tempdir().unwrap();
        let (records, outcome) = replay_all(&dir.path().join("log.json"), 7);
        assert!(records.is_empty());
        assert!(outcome.missing);
        assert_eq!(outcome.last_txid, 7);
    }

    #[test]
    fn test_replay_across_txid_wraparound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = writer(&path);
        for id in [u64::MAX, 0, 1] {
            log.append(&LogRecordRef::Remove { id, key: "k" }).unwrap();
        }

        let (records, outcome) = replay_all(&path, u64::MAX - 1);
        assert_eq!(records.len(), 3);
        assert_eq!(outcome.last_txid, 1);
        assert!(!outcome.corrupt);
    }

    #[test]
    fn test_reopen_for_append_keeps_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let size = {
            let mut log = writer(&path);
            log.append(&LogRecordRef::Remove { id: 1, key: "k" }).unwrap();
            log.size()
        };
        let mut log = LogWriter::open_append(&path, &OpenOptions::new(), 4096, true).unwrap();
        assert_eq!(log.size(), size);
        log.append(&LogRecordRef::Remove { id: 2, key: "k" }).unwrap();
        assert_eq!(replay_all(&path, 0).1.last_txid, 2);
    }
}
