//! Conformance checks for the backend contract
//!
//! Each engine crate runs these against its own backend from its test
//! suite. Every check uses its own store name so they can share a backend.
//! [`MemoryBackend`] is a reference implementation for tests of code that is
//! generic over [`Backend`].

use crate::backend::{Backend, Store, StoreExt, Visitor};
use crate::codec::ValueDecoder;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Run every single-instance check against `backend`.
pub fn check_backend<B: Backend>(backend: &B) {
    check_round_trip(backend);
    check_set_replaces(backend);
    check_get_unknown(backend);
    check_remove_missing(backend);
    check_each_visits_all(backend);
    check_each_stops_early(backend);
    check_each_surfaces_error(backend);
    check_closed_store_rejects(backend);
    check_concurrent_each_and_set(backend);
}

pub fn check_round_trip<B: Backend>(backend: &B) {
    let store = backend.access("conformance-roundtrip").unwrap();
    let values = [
        json!({"offset": 42, "source": "/var/log/messages"}),
        json!([1, 2, 3]),
        json!("plain"),
        json!(null),
        json!({}),
        json!({"nested": {"deep": [true, false, {"x": 1.5}]}}),
    ];
    for (i, value) in values.iter().enumerate() {
        let key = format!("key-{i}");
        store.set_value(&key, value.clone()).unwrap();
        assert_eq!(&store.get_value(&key).unwrap(), value);
        assert!(store.has(&key).unwrap());
    }

    // A stored empty value is distinct from absence.
    assert!(store.has("key-4").unwrap());
    assert!(!store.has("never-written").unwrap());
    store.close().unwrap();
}

pub fn check_set_replaces<B: Backend>(backend: &B) {
    let store = backend.access("conformance-replace").unwrap();
    store.set("k", &json!({"a": 1, "b": 2})).unwrap();
    store.set("k", &json!({"c": 3})).unwrap();
    let value: Value = store.get("k").unwrap();
    assert_eq!(value, json!({"c": 3}));
    store.close().unwrap();
}

pub fn check_get_unknown<B: Backend>(backend: &B) {
    let store = backend.access("conformance-unknown").unwrap();
    let err = store.get_value("missing").unwrap_err();
    assert!(err.is_key_unknown(), "unexpected error: {err}");
    store.close().unwrap();
}

pub fn check_remove_missing<B: Backend>(backend: &B) {
    let store = backend.access("conformance-remove").unwrap();
    store.set_value("present", json!(1)).unwrap();
    store.remove("absent").unwrap();
    assert_eq!(collect(&*store), vec![("present".to_string(), json!(1))]);
    store.remove("present").unwrap();
    assert!(!store.has("present").unwrap());
    store.close().unwrap();
}

pub fn check_each_visits_all<B: Backend>(backend: &B) {
    let store = backend.access("conformance-each").unwrap();
    for i in 0..20 {
        store.set_value(&format!("k{i:02}"), json!({"i": i})).unwrap();
    }
    let mut seen = collect(&*store);
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(seen.len(), 20);
    assert_eq!(seen[7], ("k07".to_string(), json!({"i": 7})));
    store.close().unwrap();
}

pub fn check_each_stops_early<B: Backend>(backend: &B) {
    let store = backend.access("conformance-each-stop").unwrap();
    for i in 0..10 {
        store.set_value(&format!("k{i}"), json!(i)).unwrap();
    }
    let mut visited = 0;
    store
        .each(&mut |_, _| {
            visited += 1;
            Ok(visited < 3)
        })
        .unwrap();
    assert_eq!(visited, 3);
    store.close().unwrap();
}

pub fn check_each_surfaces_error<B: Backend>(backend: &B) {
    let store = backend.access("conformance-each-error").unwrap();
    store.set_value("a", json!(1)).unwrap();
    store.set_value("b", json!(2)).unwrap();
    let mut visited = 0;
    let err = store
        .each(&mut |_, _| {
            visited += 1;
            Err(Error::storage("visitor failed"))
        })
        .unwrap_err();
    assert_eq!(visited, 1);
    assert!(matches!(err, Error::Storage(msg) if msg == "visitor failed"));
    store.close().unwrap();
}

pub fn check_closed_store_rejects<B: Backend>(backend: &B) {
    let store = backend.access("conformance-closed").unwrap();
    store.set_value("a", json!(1)).unwrap();
    store.close().unwrap();
    assert!(store.has("a").unwrap_err().is_closed());
    assert!(store.get_value("a").unwrap_err().is_closed());
    assert!(store.set_value("a", json!(2)).unwrap_err().is_closed());
    assert!(store.remove("a").unwrap_err().is_closed());
    assert!(store.each(&mut |_, _| Ok(true)).unwrap_err().is_closed());
}

pub fn check_concurrent_each_and_set<B: Backend>(backend: &B) {
    let store = backend.access("conformance-concurrent").unwrap();
    for i in 0..50 {
        store.set_value(&format!("base-{i}"), json!({"i": i})).unwrap();
    }
    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            for i in 0..50 {
                store.set_value(&format!("new-{i}"), json!({"i": i})).unwrap();
            }
        });
        for _ in 0..5 {
            let mut count = 0;
            store
                .each(&mut |key, value| {
                    let decoded = value.to_value()?;
                    assert!(decoded.get("i").is_some(), "corrupt entry under {key}");
                    count += 1;
                    Ok(true)
                })
                .unwrap();
            assert!((50..=100).contains(&count));
        }
        writer.join().unwrap();
    });
    assert_eq!(collect(&*store).len(), 100);
    store.close().unwrap();
}

/// Write a small history, reopen through a fresh backend and check it
/// survived. `open` must return a backend over the same root each time.
pub fn check_reopen_persists<B: Backend>(open: impl Fn() -> B) {
    {
        let backend = open();
        let store = backend.access("registry").unwrap();
        store.set_value("a", json!({"x": 1})).unwrap();
        store.set_value("b", json!({"x": 2})).unwrap();
        store.remove("a").unwrap();
        store.close().unwrap();
        backend.close().unwrap();
    }

    let backend = open();
    let store = backend.access("registry").unwrap();
    assert!(!store.has("a").unwrap());
    assert_eq!(store.get_value("b").unwrap(), json!({"x": 2}));
    let keys: Vec<String> = collect(&*store).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["b".to_string()]);
    store.close().unwrap();
    backend.close().unwrap();
}

/// Collect every entry of a store into a vector
pub fn collect<S: Store + ?Sized>(store: &S) -> Vec<(String, Value)> {
    let mut entries = Vec::new();
    store
        .each(&mut |key, value| {
            entries.push((key.to_string(), value.to_value()?));
            Ok(true)
        })
        .unwrap();
    entries
}

/// In-memory backend counting physical store closes.
#[derive(Default)]
pub struct MemoryBackend {
    opened: AtomicUsize,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stores opened through `access`
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of `Store::close` calls that reached an open store
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Backend for MemoryBackend {
    type Store = MemoryStore;

    fn access(&self, name: &str) -> Result<Arc<MemoryStore>> {
        if self.is_closed() {
            return Err(Error::access_failed(name, "backend closed"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryStore {
            name: name.to_string(),
            entries: Mutex::new(Some(BTreeMap::new())),
            closes: Arc::clone(&self.closes),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryStore {
    name: String,
    entries: Mutex<Option<BTreeMap<String, Value>>>,
    closes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn is_closed(&self) -> bool {
        self.entries.lock().is_none()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<T>) -> Result<T> {
        let mut guard = self.entries.lock();
        let entries = guard
            .as_mut()
            .ok_or_else(|| Error::StoreClosed(self.name.clone()))?;
        f(entries)
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn has(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(entries.contains_key(key)))
    }

    fn get_value(&self, key: &str) -> Result<Value> {
        self.with_entries(|entries| {
            entries
                .get(key)
                .cloned()
                .ok_or_else(|| Error::KeyUnknown(key.to_string()))
        })
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
            Ok(())
        })
    }

    fn each(&self, visit: &mut Visitor<'_>) -> Result<()> {
        // Snapshot first so the visitor never runs under our lock.
        let snapshot = self.with_entries(|entries| Ok(entries.clone()))?;
        for (key, value) in &snapshot {
            if !visit(key, ValueDecoder::Tree(value))? {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.entries.lock();
        if guard.take().is_none() {
            return Err(Error::StoreClosed(self.name.clone()));
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
