//! Shared store registry

use crate::store::StoreHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};
use waypoint_common::{Backend, Error, Result, Store};

/// One physical store and the number of handles over it
pub(crate) struct SharedStore<S> {
    pub(crate) name: String,
    pub(crate) store: Arc<S>,
    refs: AtomicUsize,
}

pub(crate) struct RegistryInner<B: Backend> {
    backend: B,
    shared: Mutex<HashMap<String, Arc<SharedStore<B::Store>>>>,
    /// Signalled whenever a shared store is unregistered
    released: Condvar,
    closed: AtomicBool,
}

/// Hands out [`StoreHandle`]s that share one physical store per name.
pub struct Registry<B: Backend> {
    inner: Arc<RegistryInner<B>>,
}

impl<B: Backend> Clone for Registry<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Registry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                shared: Mutex::new(HashMap::new()),
                released: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Get a handle on the named store, opening it if no other handle
    /// currently holds it.
    pub fn get(&self, name: &str) -> Result<StoreHandle<B>> {
        let mut shared = self.inner.shared.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::access_failed(name, "registry is closed"));
        }

        if let Some(existing) = shared.get(name) {
            existing.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(StoreHandle::new(
                Arc::clone(&self.inner),
                Arc::clone(existing),
            ));
        }

        let store = self.inner.backend.access(name)?;
        let entry = Arc::new(SharedStore {
            name: name.to_string(),
            store,
            refs: AtomicUsize::new(1),
        });
        shared.insert(name.to_string(), Arc::clone(&entry));
        debug!("Opened shared store '{}'", name);
        Ok(StoreHandle::new(Arc::clone(&self.inner), entry))
    }

    /// Number of physical stores currently open through this registry
    pub fn open_count(&self) -> usize {
        self.inner.shared.lock().len()
    }

    /// Refuse new handles, wait until every outstanding handle has been
    /// closed, then close the backend.
    pub fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        {
            let mut shared = self.inner.shared.lock();
            if !shared.is_empty() {
                info!("Waiting for {} shared stores to be released", shared.len());
            }
            while !shared.is_empty() {
                self.inner.released.wait(&mut shared);
            }
        }
        self.inner.backend.close()
    }
}

impl<B: Backend> RegistryInner<B> {
    /// Drop one reference on `entry`, closing the physical store when it
    /// was the last one.
    pub(crate) fn release(&self, entry: &Arc<SharedStore<B::Store>>) -> Result<()> {
        if entry.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }

        let mut shared = self.shared.lock();
        // A concurrent `get` may have picked the entry up again
        if entry.refs.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        match shared.get(&entry.name) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                shared.remove(&entry.name);
            }
            _ => return Ok(()),
        }

        let result = entry.store.close();
        self.released.notify_all();
        debug!("Closed shared store '{}'", entry.name);
        result
    }
}
