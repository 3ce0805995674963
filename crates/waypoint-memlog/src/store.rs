//! Memlog store
//!
//! All entries live in a hash table. Every mutation is appended to the log
//! before it becomes visible; once the log grows past the checkpoint
//! predicate, or after it was found unusable, the next mutation writes a
//! full checkpoint and starts a fresh log.

use crate::checkpoint::{self, LOG_FILE};
use crate::txid;
use crate::wal::{self, LogRecord, LogRecordRef, LogWriter};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use waypoint_common::backend::Visitor;
use waypoint_common::{Error, MemlogConfig, Result, Store, ValueDecoder};

/// Decides from the current log size in bytes whether the next mutation
/// should checkpoint.
pub type CheckpointPredicate = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Checkpoint once the log reaches `limit` bytes
#[must_use]
pub fn size_predicate(limit: u64) -> CheckpointPredicate {
    Arc::new(move |size| size >= limit)
}

/// Lifecycle state of a [`MemlogStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Log is valid and receives every mutation
    Live,
    /// Log is missing, corrupt or failed to write; the next mutation
    /// checkpoints instead of appending
    LogInvalid,
    Closed,
}

struct Inner {
    table: HashMap<String, Value>,
    txid: u64,
    log: Option<LogWriter>,
    state: StoreState,
}

/// WAL-backed in-memory store
pub struct MemlogStore {
    name: String,
    dir: PathBuf,
    config: Arc<MemlogConfig>,
    predicate: CheckpointPredicate,
    options: OpenOptions,
    inner: RwLock<Inner>,
}

impl fmt::Debug for MemlogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemlogStore")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("state", &inner.state)
            .field("txid", &inner.txid)
            .finish_non_exhaustive()
    }
}

impl MemlogStore {
    /// Open or create the store living in `dir`.
    ///
    /// Only an unusable meta file fails the open. A damaged log or
    /// checkpoint keeps whatever valid history precedes the damage and
    /// leaves the store in [`StoreState::LogInvalid`].
    pub fn open(
        name: &str,
        dir: impl AsRef<Path>,
        config: Arc<MemlogConfig>,
        predicate: CheckpointPredicate,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let options = file_options(config.file_mode);
        checkpoint::ensure_meta(&dir, &options)?;

        let swept = checkpoint::sweep_temp_files(&dir)?;
        if swept > 0 {
            info!("Removed {} leftover temp files from store '{}'", swept, name);
        }

        let mut corrupt_checkpoint = None;
        let mut loaded = None;
        for (id, path) in checkpoint::list_data_files(&dir)?.into_iter().rev() {
            match checkpoint::read_data_file(&path) {
                Ok(table) => {
                    loaded = Some((id, table));
                    break;
                }
                Err(e) => {
                    warn!("Failed to load checkpoint {:?}: {}", path, e);
                    corrupt_checkpoint.get_or_insert(id);
                }
            }
        }
        let have_checkpoint = loaded.is_some();
        let (base_txid, mut table) = loaded.unwrap_or_default();

        let log_path = dir.join(LOG_FILE);
        let outcome = wal::replay(&log_path, base_txid, |record| match record {
            LogRecord::Set { key, value, .. } => {
                table.insert(key, value);
            }
            LogRecord::Remove { key, .. } => {
                table.remove(&key);
            }
        })?;

        let mut txid = outcome.last_txid;
        let mut state = StoreState::Live;
        if outcome.corrupt {
            state = StoreState::LogInvalid;
        }
        if outcome.unterminated {
            warn!("Log of store '{}' ends in an unterminated record", name);
            state = StoreState::LogInvalid;
        }
        if outcome.missing && have_checkpoint {
            warn!("Store '{}' has a checkpoint but no log", name);
            state = StoreState::LogInvalid;
        }
        if let Some(corrupt_id) = corrupt_checkpoint {
            // The next checkpoint must sort above the damaged file
            if txid::is_less_or_equal(txid, corrupt_id) {
                txid = corrupt_id;
            }
            state = StoreState::LogInvalid;
        }

        let log = if state == StoreState::Live {
            match LogWriter::open_append(
                &log_path,
                &options,
                config.write_buffer_size,
                config.sync_on_write,
            ) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("Failed to open log for store '{}': {}", name, e);
                    state = StoreState::LogInvalid;
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Opened store '{}' with {} entries (txid {}, {:?})",
            name,
            table.len(),
            txid,
            state
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            config,
            predicate,
            options,
            inner: RwLock::new(Inner {
                table,
                txid,
                log,
                state,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> StoreState {
        self.inner.read().state
    }

    /// ID of the last applied mutation
    pub fn txid(&self) -> u64 {
        self.inner.read().txid
    }

    pub fn len(&self) -> usize {
        self.inner.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a checkpoint now and start a fresh log.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.ensure_open(&inner)?;
        if let Err(e) = self.checkpoint_locked(&mut inner) {
            inner.state = StoreState::LogInvalid;
            return Err(e);
        }
        Ok(())
    }

    fn ensure_open(&self, inner: &Inner) -> Result<()> {
        if inner.state == StoreState::Closed {
            return Err(Error::StoreClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Append to the log if it is usable. A failed append invalidates the
    /// log but not the mutation.
    fn append(&self, inner: &mut Inner, record: &LogRecordRef<'_>) {
        if inner.state != StoreState::Live {
            return;
        }
        let result = match inner.log.as_mut() {
            Some(log) => log.append(record),
            None => Err(Error::storage("log not open")),
        };
        if let Err(e) = result {
            warn!("Failed to append to log of store '{}': {}", self.name, e);
            inner.state = StoreState::LogInvalid;
            inner.log = None;
        }
    }

    fn maybe_checkpoint(&self, inner: &mut Inner) {
        let due = match (inner.state, inner.log.as_ref()) {
            (StoreState::LogInvalid, _) => true,
            (StoreState::Live, Some(log)) => (self.predicate)(log.size()),
            _ => false,
        };
        if !due {
            return;
        }
        if let Err(e) = self.checkpoint_locked(inner) {
            error!("Failed to checkpoint store '{}': {}", self.name, e);
            inner.state = StoreState::LogInvalid;
            inner.log = None;
        }
    }

    fn checkpoint_locked(&self, inner: &mut Inner) -> Result<()> {
        let path = checkpoint::write_data_file(
            &self.dir,
            inner.txid,
            &inner.table,
            &self.options,
            self.config.sync_directory,
        )?;
        checkpoint::write_active_marker(&self.dir, &path, &self.options);

        inner.log = None;
        let log = LogWriter::create(
            &self.dir.join(LOG_FILE),
            &self.options,
            self.config.write_buffer_size,
            self.config.sync_on_write,
        )?;
        inner.log = Some(log);
        inner.state = StoreState::Live;

        checkpoint::remove_superseded(&self.dir, inner.txid);
        debug!(
            "Checkpointed store '{}' at txid {} ({} entries)",
            self.name,
            inner.txid,
            inner.table.len()
        );
        Ok(())
    }
}

impl Store for MemlogStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn has(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read();
        self.ensure_open(&inner)?;
        Ok(inner.table.contains_key(key))
    }

    fn get_value(&self, key: &str) -> Result<Value> {
        let inner = self.inner.read();
        self.ensure_open(&inner)?;
        inner
            .table
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyUnknown(key.to_string()))
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.write();
        self.ensure_open(&inner)?;

        let id = txid::next(inner.txid);
        self.append(
            &mut inner,
            &LogRecordRef::Set {
                id,
                key,
                value: &value,
            },
        );
        inner.table.insert(key.to_string(), value);
        inner.txid = id;

        self.maybe_checkpoint(&mut inner);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        self.ensure_open(&inner)?;
        if !inner.table.contains_key(key) {
            return Ok(());
        }

        let id = txid::next(inner.txid);
        self.append(&mut inner, &LogRecordRef::Remove { id, key });
        inner.table.remove(key);
        inner.txid = id;

        self.maybe_checkpoint(&mut inner);
        Ok(())
    }

    fn each(&self, visit: &mut Visitor<'_>) -> Result<()> {
        let inner = self.inner.read();
        self.ensure_open(&inner)?;
        for (key, value) in &inner.table {
            if !visit(key, ValueDecoder::Tree(value))? {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.ensure_open(&inner)?;

        if let Some(mut log) = inner.log.take()
            && let Err(e) = log.sync()
        {
            warn!("Failed to sync log {:?}: {}", log.path(), e);
        }
        inner.table = HashMap::new();
        inner.state = StoreState::Closed;
        debug!("Closed store '{}'", self.name);
        Ok(())
    }
}

#[cfg(unix)]
fn file_options(mode: u32) -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.mode(mode);
    options
}

#[cfg(not(unix))]
fn file_options(_mode: u32) -> OpenOptions {
    OpenOptions::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ACTIVE_FILE, META_FILE};
    use rand::Rng;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;
    use waypoint_common::StoreExt;
    use waypoint_common::testing::collect;

    fn never() -> CheckpointPredicate {
        Arc::new(|_| false)
    }

    fn always() -> CheckpointPredicate {
        Arc::new(|_| true)
    }

    fn open(dir: &Path, predicate: CheckpointPredicate) -> MemlogStore {
        let config = Arc::new(MemlogConfig::with_root(dir));
        MemlogStore::open("test", dir, config, predicate).unwrap()
    }

    fn contents(store: &MemlogStore) -> HashMap<String, Value> {
        collect(store).into_iter().collect()
    }

    fn checkpoint_ids(dir: &Path) -> Vec<u64> {
        checkpoint::list_data_files(dir)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn test_debug_shows_state() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), never());
        store.set_value("a", json!(1)).unwrap();
        let shown = format!("{store:?}");
        assert!(shown.contains("state: Live"), "{shown}");
        assert!(shown.contains("txid: 1"), "{shown}");
    }

    #[test]
    fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), never());

        store.set("a", &json!({"offset": 1})).unwrap();
        store.set("a", &json!({"offset": 2})).unwrap();
        assert_eq!(store.get_value("a").unwrap(), json!({"offset": 2}));
        assert_eq!(store.txid(), 2);

        store.remove("a").unwrap();
        assert!(!store.has("a").unwrap());
        assert!(store.get_value("a").unwrap_err().is_key_unknown());
        assert_eq!(store.state(), StoreState::Live);
    }

    #[test]
    fn test_remove_missing_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), never());
        store.set_value("a", json!(1)).unwrap();
        let log_len = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();

        store.remove("missing").unwrap();
        assert_eq!(store.txid(), 1);
        assert_eq!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len(), log_len);
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), never());
            store.set_value("a", json!({"x": 1})).unwrap();
            store.set_value("b", json!({"x": 2})).unwrap();
            store.remove("a").unwrap();
            store.close().unwrap();
        }

        let store = open(dir.path(), never());
        assert_eq!(store.txid(), 3);
        assert_eq!(store.state(), StoreState::Live);
        assert_eq!(
            contents(&store),
            HashMap::from([("b".to_string(), json!({"x": 2}))])
        );
        assert!(checkpoint_ids(dir.path()).is_empty());
    }

    #[test]
    fn test_checkpoint_is_transparent() {
        let dir = tempdir().unwrap();
        let plain = tempdir().unwrap();
        let checkpointed = open(dir.path(), always());
        let reference = open(plain.path(), never());

        for i in 0..20 {
            for store in [&checkpointed, &reference] {
                store.set_value(&format!("k{}", i % 7), json!({"i": i})).unwrap();
                if i % 3 == 0 {
                    store.remove(&format!("k{}", (i + 1) % 7)).unwrap();
                }
            }
        }

        assert_eq!(contents(&checkpointed), contents(&reference));
        assert_eq!(checkpoint_ids(dir.path()), vec![checkpointed.txid()]);
        assert_eq!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len(), 0);

        let expected = contents(&checkpointed);
        checkpointed.close().unwrap();
        let reopened = open(dir.path(), never());
        assert_eq!(contents(&reopened), expected);
        assert_eq!(reopened.state(), StoreState::Live);
    }

    #[test]
    fn test_size_predicate_triggers_checkpoint() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), size_predicate(256));

        for i in 0..20 {
            store.set_value("cursor", json!({"offset": i})).unwrap();
        }

        let ids = checkpoint_ids(dir.path());
        assert_eq!(ids.len(), 1);
        assert!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len() < 256);
        assert!(dir.path().join(ACTIVE_FILE).exists());
        assert_eq!(store.get_value("cursor").unwrap(), json!({"offset": 19}));
    }

    #[test]
    fn test_explicit_checkpoint() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), never());
        store.set_value("a", json!(1)).unwrap();
        store.set_value("b", json!(2)).unwrap();
        store.checkpoint().unwrap();

        assert_eq!(checkpoint_ids(dir.path()), vec![2]);
        let active = fs::read_to_string(dir.path().join(ACTIVE_FILE)).unwrap();
        assert!(active.ends_with("2.json"));
    }

    #[test]
    fn test_corrupt_log_marks_invalid() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), never());
            store.set_value("a", json!(1)).unwrap();
            store.set_value("b", json!(2)).unwrap();
            store.set_value("c", json!(3)).unwrap();
            store.close().unwrap();
        }
        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        log.write_all(b"{\"op\":\"set\",\"id\":4,\"key\":\"d\",\"val\n")
            .unwrap();
        drop(log);

        let store = open(dir.path(), never());
        assert_eq!(store.state(), StoreState::LogInvalid);
        assert_eq!(store.txid(), 3);
        assert_eq!(
            contents(&store),
            HashMap::from([
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
                ("c".to_string(), json!(3)),
            ])
        );
        assert!(checkpoint_ids(dir.path()).is_empty());

        store.set_value("e", json!(5)).unwrap();
        assert_eq!(checkpoint_ids(dir.path()), vec![4]);
        assert_eq!(store.state(), StoreState::Live);
        assert_eq!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len(), 0);
    }

    #[test]
    fn test_crash_recovery_keeps_valid_prefix() {
        let mut rng = rand::thread_rng();
        let keys = ["a", "b", "c", "d", "e"];

        for _ in 0..20 {
            let dir = tempdir().unwrap();

            // history[n] is the state after n logged mutations
            let mut history = vec![HashMap::new()];
            {
                let store = open(dir.path(), never());
                let mut model: HashMap<String, Value> = HashMap::new();
                for i in 0..40 {
                    let key = keys[rng.gen_range(0..keys.len())];
                    if rng.gen_bool(0.3) {
                        store.remove(key).unwrap();
                        if model.remove(key).is_some() {
                            history.push(model.clone());
                        }
                    } else {
                        let value = json!({"offset": i});
                        store.set_value(key, value.clone()).unwrap();
                        model.insert(key.to_string(), value);
                        history.push(model.clone());
                    }
                }
                store.close().unwrap();
            }

            let log_path = dir.path().join(LOG_FILE);
            let bytes = fs::read(&log_path).unwrap();
            let cut = rng.gen_range(0..=bytes.len());
            fs::write(&log_path, &bytes[..cut]).unwrap();

            // A record survives when its JSON text is complete
            let complete = bytes
                .iter()
                .enumerate()
                .filter(|&(pos, b)| *b == b'\n' && pos <= cut)
                .count();

            let store = open(dir.path(), never());
            assert_eq!(contents(&store), history[complete], "cut at {cut}");
            assert_eq!(store.txid(), complete as u64);

            // Writes after recovery must survive the next reopen too
            store.set_value("after", json!({"cut": cut})).unwrap();
            store.close().unwrap();

            let mut expected = history[complete].clone();
            expected.insert("after".to_string(), json!({"cut": cut}));
            let store = open(dir.path(), never());
            assert_eq!(contents(&store), expected, "write after cut at {cut}");
            assert_eq!(store.txid(), complete as u64 + 1);
        }
    }

    #[test]
    fn test_unterminated_last_record_survives_next_write() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), never());
            store.set_value("a", json!(1)).unwrap();
            store.set_value("b", json!(2)).unwrap();
            store.close().unwrap();
        }
        let log_path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&log_path).unwrap();
        assert_eq!(bytes.pop(), Some(b'\n'));
        fs::write(&log_path, &bytes).unwrap();

        {
            let store = open(dir.path(), never());
            assert_eq!(store.state(), StoreState::LogInvalid);
            assert_eq!(store.get_value("b").unwrap(), json!(2));
            store.set_value("c", json!(3)).unwrap();
            assert_eq!(store.state(), StoreState::Live);
            store.close().unwrap();
        }

        let store = open(dir.path(), never());
        assert_eq!(store.state(), StoreState::Live);
        assert_eq!(store.txid(), 3);
        assert_eq!(
            contents(&store),
            HashMap::from([
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
                ("c".to_string(), json!(3)),
            ])
        );
    }

    #[test]
    fn test_corrupt_checkpoint_falls_back() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), never());
            store.set_value("a", json!(1)).unwrap();
            store.checkpoint().unwrap();
            store.close().unwrap();
        }
        fs::write(dir.path().join("5.json"), "[{\"key\":").unwrap();

        let store = open(dir.path(), never());
        assert_eq!(store.state(), StoreState::LogInvalid);
        assert_eq!(store.txid(), 5);
        assert_eq!(store.get_value("a").unwrap(), json!(1));

        store.set_value("b", json!(2)).unwrap();
        assert_eq!(checkpoint_ids(dir.path()), vec![6]);
        assert_eq!(store.state(), StoreState::Live);
    }

    #[test]
    fn test_missing_log_with_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), never());
            store.set_value("a", json!(1)).unwrap();
            store.checkpoint().unwrap();
            store.close().unwrap();
        }
        fs::remove_file(dir.path().join(LOG_FILE)).unwrap();

        let store = open(dir.path(), never());
        assert_eq!(store.state(), StoreState::LogInvalid);
        assert_eq!(store.get_value("a").unwrap(), json!(1));
    }

    #[test]
    fn test_txid_wraparound() {
        let dir = tempdir().unwrap();
        let start = u64::MAX - 1;
        {
            let store = open(dir.path(), never());
            store.close().unwrap();
        }
        fs::write(dir.path().join(format!("{start}.json")), "[]").unwrap();
        fs::write(dir.path().join(LOG_FILE), "").unwrap();

        {
            let store = open(dir.path(), never());
            assert_eq!(store.txid(), start);
            for i in 0..3 {
                store.set_value(&format!("k{i}"), json!(i)).unwrap();
            }
            assert_eq!(store.txid(), 1);
            store.close().unwrap();
        }

        let store = open(dir.path(), never());
        assert_eq!(store.txid(), 1);
        assert_eq!(store.len(), 3);
        store.checkpoint().unwrap();
        assert_eq!(checkpoint_ids(dir.path()), vec![1]);
    }

    #[test]
    fn test_incompatible_meta_fails_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), "{\"version\":\"0\"}").unwrap();
        let config = Arc::new(MemlogConfig::with_root(dir.path()));
        let result = MemlogStore::open("test", dir.path(), config, never());
        assert!(matches!(result, Err(Error::IncompatibleVersion { .. })));
    }

    #[test]
    fn test_stale_temp_files_swept() {
        let dir = tempdir().unwrap();
        open(dir.path(), never()).close().unwrap();
        fs::write(dir.path().join("3.json.tmp"), "[").unwrap();
        let _store = open(dir.path(), never());
        assert!(!dir.path().join("3.json.tmp").exists());
    }

    #[test]
    fn test_close_twice_fails() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), never());
        store.set_value("a", json!(1)).unwrap();
        store.close().unwrap();
        assert_eq!(store.state(), StoreState::Closed);
        assert!(store.close().unwrap_err().is_closed());
        assert!(store.checkpoint().unwrap_err().is_closed());
    }

    #[cfg(unix)]
    #[test]
    fn test_files_use_configured_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = open(dir.path(), always());
        store.set_value("a", json!(1)).unwrap();

        for name in [META_FILE, LOG_FILE, "1.json"] {
            let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{name}");
        }
    }
}
