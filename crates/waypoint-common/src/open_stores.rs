//! Bookkeeping of the stores a backend has handed out
//!
//! A name is reserved under the lock and the store itself is opened outside
//! of it, so a slow open or an on-open compaction of one store never blocks
//! access to another. Closing the table is final: reservations still in
//! flight fail when they try to commit.

use crate::backend::Store;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::warn;

enum Slot<S> {
    /// Reserved by an `access` that has not finished opening yet
    Opening,
    Open(Weak<S>),
}

struct Slots<S> {
    slots: HashMap<String, Slot<S>>,
    closed: bool,
}

/// Name table of the stores opened through one backend
pub struct OpenStores<S> {
    inner: Mutex<Slots<S>>,
}

impl<S: Store> Default for OpenStores<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> OpenStores<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Reserve `name` for opening.
    ///
    /// Fails with [`Error::AccessFailed`] once the table is closed, while
    /// another caller is opening the same name, or while a store under that
    /// name is still live according to `is_live`.
    pub fn reserve(&self, name: &str, is_live: impl Fn(&S) -> bool) -> Result<Reservation<'_, S>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::access_failed(name, "registry is closed"));
        }
        match inner.slots.get(name) {
            Some(Slot::Opening) => {
                return Err(Error::access_failed(name, "store is being opened"));
            }
            Some(Slot::Open(store)) => {
                if store.upgrade().is_some_and(|store| is_live(&store)) {
                    return Err(Error::access_failed(name, "store is already open"));
                }
            }
            None => {}
        }

        inner.slots.retain(|_, slot| match slot {
            Slot::Opening => true,
            Slot::Open(store) => store.strong_count() > 0,
        });
        inner.slots.insert(name.to_string(), Slot::Opening);
        Ok(Reservation {
            table: self,
            name: name.to_string(),
            done: false,
        })
    }

    /// Stores still referenced somewhere and live according to `is_live`
    pub fn live(&self, is_live: impl Fn(&S) -> bool) -> Vec<Arc<S>> {
        self.inner
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Open(store) => store.upgrade(),
                Slot::Opening => None,
            })
            .filter(|store| is_live(store))
            .collect()
    }

    /// Close the table and hand back every store still referenced.
    /// Later reservations and commits fail.
    pub fn drain(&self) -> Vec<Arc<S>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner
            .slots
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Open(store) => store.upgrade(),
                Slot::Opening => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Exclusive claim on a store name while the store is being opened.
/// Dropping it without committing releases the name.
pub struct Reservation<'a, S: Store> {
    table: &'a OpenStores<S>,
    name: String,
    done: bool,
}

impl<S: Store> Reservation<'_, S> {
    /// Register the opened store under the reserved name.
    ///
    /// If the table was closed in the meantime the store is closed again
    /// and the access fails.
    pub fn commit(mut self, store: Arc<S>) -> Result<Arc<S>> {
        self.done = true;
        let mut inner = self.table.inner.lock();
        if inner.closed {
            drop(inner);
            if let Err(e) = store.close() {
                warn!("Failed to close store '{}' opened during shutdown: {}", self.name, e);
            }
            return Err(Error::access_failed(&self.name, "registry is closed"));
        }
        inner
            .slots
            .insert(self.name.clone(), Slot::Open(Arc::downgrade(&store)));
        Ok(store)
    }
}

impl<S: Store> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.table.inner.lock();
        if matches!(inner.slots.get(&self.name), Some(Slot::Opening)) {
            inner.slots.remove(&self.name);
        }
    }
}
