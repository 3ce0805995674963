//! Consumer-side store handle

use crate::registry::{RegistryInner, SharedStore};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use waypoint_common::backend::Visitor;
use waypoint_common::{Backend, Error, Result, Store};

struct HandleState {
    closed: bool,
    in_flight: usize,
}

/// One consumer's view of a shared store.
///
/// Closing the handle rejects new operations at once, waits for the ones
/// already running, then releases the handle's reference. Dropping an open
/// handle closes it.
pub struct StoreHandle<B: Backend> {
    registry: Arc<RegistryInner<B>>,
    shared: Arc<SharedStore<B::Store>>,
    state: Mutex<HandleState>,
    idle: Condvar,
}

/// Marks one operation in flight for as long as it lives
struct InFlight<'a, B: Backend> {
    handle: &'a StoreHandle<B>,
}

impl<B: Backend> Drop for InFlight<'_, B> {
    fn drop(&mut self) {
        let mut state = self.handle.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.handle.idle.notify_all();
        }
    }
}

impl<B: Backend> fmt::Debug for StoreHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StoreHandle")
            .field("name", &self.shared.name)
            .field("closed", &state.closed)
            .field("in_flight", &state.in_flight)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> StoreHandle<B> {
    pub(crate) fn new(registry: Arc<RegistryInner<B>>, shared: Arc<SharedStore<B::Store>>) -> Self {
        Self {
            registry,
            shared,
            state: Mutex::new(HandleState {
                closed: false,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn begin(&self) -> Result<InFlight<'_, B>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::StoreClosed(self.shared.name.clone()));
        }
        state.in_flight += 1;
        Ok(InFlight { handle: self })
    }
}

impl<B: Backend> Store for StoreHandle<B> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn has(&self, key: &str) -> Result<bool> {
        let _op = self.begin()?;
        self.shared.store.has(key)
    }

    fn get_value(&self, key: &str) -> Result<Value> {
        let _op = self.begin()?;
        self.shared.store.get_value(key)
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let _op = self.begin()?;
        self.shared.store.set_value(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _op = self.begin()?;
        self.shared.store.remove(key)
    }

    fn each(&self, visit: &mut Visitor<'_>) -> Result<()> {
        let _op = self.begin()?;
        self.shared.store.each(visit)
    }

    /// Idempotent. Only the first call releases the reference.
    fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            while state.in_flight > 0 {
                self.idle.wait(&mut state);
            }
        }
        self.registry.release(&self.shared)
    }
}

impl<B: Backend> Drop for StoreHandle<B> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to close store '{}': {}", self.shared.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Registry;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;
    use waypoint_common::testing::{MemoryBackend, collect};
    use waypoint_common::{Backend, MemlogConfig, Store, StoreExt};
    use waypoint_memlog::MemlogRegistry;

    #[test]
    fn test_debug_shows_name_and_state() {
        let registry = Registry::new(MemoryBackend::new());
        let handle = registry.get("s").unwrap();
        assert!(format!("{handle:?}").contains("closed: false"));
        handle.close().unwrap();
        let shown = format!("{handle:?}");
        assert!(shown.contains("\"s\""), "{shown}");
        assert!(shown.contains("closed: true"), "{shown}");
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let registry = Registry::new(MemoryBackend::new());
        let handle = registry.get("s").unwrap();
        handle.set_value("a", json!(1)).unwrap();
        handle.close().unwrap();

        assert!(handle.is_closed());
        assert!(handle.has("a").unwrap_err().is_closed());
        assert!(handle.get_value("a").unwrap_err().is_closed());
        assert!(handle.set_value("a", json!(2)).unwrap_err().is_closed());
        assert!(handle.remove("a").unwrap_err().is_closed());
        assert!(handle.each(&mut |_, _| Ok(true)).unwrap_err().is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = Registry::new(MemoryBackend::new());
        let a = registry.get("s").unwrap();
        let _b = registry.get("s").unwrap();

        a.close().unwrap();
        a.close().unwrap();
        assert_eq!(registry.open_count(), 1);
        assert_eq!(registry.backend().closes(), 0);
    }

    #[test]
    fn test_close_waits_for_running_each() {
        let registry = Registry::new(MemoryBackend::new());
        let handle = registry.get("s").unwrap();
        handle.set_value("a", json!(1)).unwrap();

        let finished = AtomicBool::new(false);
        let (started_tx, started_rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| {
                handle
                    .each(&mut |_, _| {
                        started_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(100));
                        finished.store(true, Ordering::SeqCst);
                        Ok(true)
                    })
                    .unwrap();
            });

            started_rx.recv().unwrap();
            handle.close().unwrap();
            assert!(finished.load(Ordering::SeqCst));
        });
        assert_eq!(registry.backend().closes(), 1);
    }

    #[test]
    fn test_handles_satisfy_the_store_contract() {
        let registry = Registry::new(MemoryBackend::new());
        let handle = registry.get("typed").unwrap();
        handle.set("cursor", &json!({"offset": 10})).unwrap();
        let value: serde_json::Value = handle.get("cursor").unwrap();
        assert_eq!(value["offset"], 10);
        assert_eq!(collect(&handle).len(), 1);
    }

    #[test]
    fn test_shared_memlog_store() {
        let dir = tempdir().unwrap();
        let backend = MemlogRegistry::new(MemlogConfig::with_root(dir.path())).unwrap();
        let registry = Registry::new(backend);

        let reader = registry.get("registry").unwrap();
        let writer = registry.get("registry").unwrap();
        writer.set_value("a", json!({"x": 1})).unwrap();
        writer.set_value("b", json!({"x": 2})).unwrap();
        writer.remove("a").unwrap();
        writer.close().unwrap();

        assert!(!reader.has("a").unwrap());
        assert_eq!(reader.get_value("b").unwrap(), json!({"x": 2}));
        reader.close().unwrap();
        registry.close().unwrap();

        let backend = MemlogRegistry::new(MemlogConfig::with_root(dir.path())).unwrap();
        let store = backend.access("registry").unwrap();
        let keys: Vec<String> = collect(&*store).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b".to_string()]);
    }
}
