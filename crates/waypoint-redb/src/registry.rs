//! redb backend and its maintenance thread
//!
//! The registry owns at most one background thread. It ticks TTL GC and
//! rebound checks over every store that is still open, and is stopped and
//! joined before the registry closes its stores.

use crate::compact::sweep_compaction_leftovers;
use crate::store::{RedbStore, now_ns};
use crossbeam_channel::{Receiver, Sender, never, select, tick};
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use waypoint_common::{Backend, Error, OpenStores, RedbConfig, Result, Store, validate_store_name};

const STORE_EXTENSION: &str = "db";

type StoreMap = Arc<OpenStores<RedbStore>>;

struct Maintenance {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Backend handing out [`RedbStore`]s, one file per store
pub struct RedbRegistry {
    config: Arc<RedbConfig>,
    stores: StoreMap,
    maintenance: Mutex<Option<Maintenance>>,
}

impl RedbRegistry {
    /// Create the registry, sweep leftovers of interrupted compactions and
    /// start background maintenance if GC or rebound compaction is enabled.
    pub fn new(config: RedbConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;

        let mut swept = sweep_compaction_leftovers(&config.root);
        if let Some(temp_dir) = &config.compaction.temp_dir {
            swept += sweep_compaction_leftovers(temp_dir);
        }
        if swept > 0 {
            info!("Removed {} leftover compaction files", swept);
        }

        let config = Arc::new(config);
        let stores: StoreMap = Arc::new(OpenStores::new());
        let maintenance = start_maintenance(&config, &stores)?;

        Ok(Self {
            config,
            stores,
            maintenance: Mutex::new(maintenance),
        })
    }

    pub fn config(&self) -> &RedbConfig {
        &self.config
    }

    /// Names of the store files under the root directory
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.config.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != STORE_EXTENSION {
                    return None;
                }
                path.file_stem()?.to_str().map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Whether the maintenance thread is running
    pub fn maintenance_running(&self) -> bool {
        self.maintenance.lock().is_some()
    }

    fn stop_maintenance(&self) {
        let Some(maintenance) = self.maintenance.lock().take() else {
            return;
        };
        drop(maintenance.stop);
        if maintenance.handle.join().is_err() {
            error!("Redb maintenance thread panicked");
        }
        debug!("Redb maintenance thread stopped");
    }
}

impl Backend for RedbRegistry {
    type Store = RedbStore;

    fn access(&self, name: &str) -> Result<Arc<RedbStore>> {
        validate_store_name(name)?;
        let reservation = self.stores.reserve(name, is_live)?;

        let path = self
            .config
            .root
            .join(format!("{name}.{STORE_EXTENSION}"));
        let store = RedbStore::open(name, path, Arc::clone(&self.config))
            .map_err(|e| Error::access_failed(name, e))?;

        if self.config.compaction.on_start
            && let Err(e) = store.compact()
        {
            error!("Failed to compact store '{}' on open: {}", name, e);
        }

        reservation.commit(Arc::new(store))
    }

    fn close(&self) -> Result<()> {
        let stores = self.stores.drain();
        self.stop_maintenance();

        let mut first_error = None;
        for store in stores {
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

fn is_live(store: &RedbStore) -> bool {
    !store.is_closed()
}

impl Drop for RedbRegistry {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

fn start_maintenance(config: &Arc<RedbConfig>, stores: &StoreMap) -> Result<Option<Maintenance>> {
    let gc = config.ttl().zip(config.gc_interval());
    let rebound = config.compaction.rebound_enabled;
    if gc.is_none() && !rebound {
        return Ok(None);
    }

    let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
    let stores = Arc::clone(stores);
    let check_interval = config.compaction.check_interval();

    let handle = thread::Builder::new()
        .name("waypoint-redb-maintenance".into())
        .spawn(move || maintenance_loop(&stores, &stop_rx, gc, rebound.then_some(check_interval)))?;

    info!(
        "Started redb maintenance (gc: {:?}, rebound: {})",
        gc.map(|(_, interval)| interval),
        rebound
    );
    Ok(Some(Maintenance { stop, handle }))
}

fn maintenance_loop(
    stores: &StoreMap,
    stop: &Receiver<()>,
    gc: Option<(Duration, Duration)>,
    rebound_interval: Option<Duration>,
) {
    let gc_ticker = gc.map_or_else(never, |(_, interval)| tick(interval));
    let rebound_ticker = rebound_interval.map_or_else(never, tick);

    loop {
        select! {
            recv(stop) -> _ => break,
            recv(gc_ticker) -> _ => {
                if let Some((ttl, _)) = gc {
                    run_gc(stores, ttl);
                }
            }
            recv(rebound_ticker) -> _ => run_rebound(stores),
        }
    }
}

fn run_gc(stores: &StoreMap, ttl: Duration) {
    for store in stores.live(is_live) {
        match store.collect_garbage(ttl, now_ns()) {
            Ok(_) => {}
            Err(e) if e.is_closed() => {}
            Err(e) => warn!("GC of store '{}' failed: {}", store.name(), e),
        }
    }
}

fn run_rebound(stores: &StoreMap) {
    for store in stores.live(is_live) {
        match store.rebound_compact() {
            Ok(Some(stats)) => debug!(
                "Rebound compaction of store '{}' reclaimed {} bytes",
                store.name(),
                stats.size_before.saturating_sub(stats.size_after)
            ),
            Ok(None) => {}
            Err(e) if e.is_closed() => {}
            Err(e) => error!("Rebound compaction of store '{}' failed: {}", store.name(), e),
        }
    }
}
