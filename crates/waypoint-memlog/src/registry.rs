//! Memlog backend
//!
//! Opens stores as subdirectories of the configured root. A directory is
//! only ever driven by one live [`MemlogStore`] at a time.

use crate::store::{CheckpointPredicate, MemlogStore, StoreState, size_predicate};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};
use waypoint_common::{Backend, Error, MemlogConfig, OpenStores, Result, Store, validate_store_name};

/// Backend handing out [`MemlogStore`]s
pub struct MemlogRegistry {
    config: Arc<MemlogConfig>,
    predicate: CheckpointPredicate,
    stores: OpenStores<MemlogStore>,
}

impl MemlogRegistry {
    /// Create a registry checkpointing at `checkpoint_size_bytes`
    pub fn new(config: MemlogConfig) -> Result<Self> {
        let predicate = size_predicate(config.checkpoint_size_bytes);
        Self::with_predicate(config, predicate)
    }

    /// Create a registry with a custom checkpoint predicate
    pub fn with_predicate(config: MemlogConfig, predicate: CheckpointPredicate) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        info!("Memlog registry at {:?}", config.root);
        Ok(Self {
            config: Arc::new(config),
            predicate,
            stores: OpenStores::new(),
        })
    }

    pub fn config(&self) -> &MemlogConfig {
        &self.config
    }

    /// Names of the stores present under the root directory
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.config.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| validate_store_name(name).is_ok())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl Backend for MemlogRegistry {
    type Store = MemlogStore;

    fn access(&self, name: &str) -> Result<Arc<MemlogStore>> {
        validate_store_name(name)?;
        let reservation = self.stores.reserve(name, is_live)?;

        let store = MemlogStore::open(
            name,
            self.config.root.join(name),
            Arc::clone(&self.config),
            Arc::clone(&self.predicate),
        )
        .map_err(|e| Error::access_failed(name, e))?;

        reservation.commit(Arc::new(store))
    }

    fn close(&self) -> Result<()> {
        let mut first_error = None;
        for store in self.stores.drain() {
            match store.close() {
                Ok(()) => {}
                Err(e) if e.is_closed() => {}
                Err(e) => {
                    warn!("Failed to close store '{}': {}", store.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn is_live(store: &MemlogStore) -> bool {
    store.state() != StoreState::Closed
}
