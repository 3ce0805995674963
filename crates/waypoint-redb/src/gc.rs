//! TTL garbage collection
//!
//! An entry expires once `now - last_access > ttl`. Entries that were never
//! accessed (`last_access == 0`) are kept.

use crate::store::RedbStore;
use crate::tables::{DATA, METADATA};
use redb::ReadableTable;
use std::ops::Bound;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use waypoint_common::{Result, Store};

/// Outcome of one GC pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub scanned: u64,
    pub deleted: u64,
}

/// Whether an entry last accessed at `last_access` has outlived `ttl_ns`
#[must_use]
pub const fn is_expired(last_access: u64, now_ns: u64, ttl_ns: u64) -> bool {
    last_access != 0 && now_ns.saturating_sub(last_access) > ttl_ns
}

fn ttl_nanos(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX)
}

impl RedbStore {
    /// Delete every expired entry in one write transaction.
    pub fn collect_garbage(&self, ttl: Duration, now_ns: u64) -> Result<GcStats> {
        let ttl_ns = ttl_nanos(ttl);
        let started = Instant::now();

        let stats = self.with_db(|db| {
            let txn = db.begin_write()?;
            let mut stats = GcStats::default();
            {
                let mut metadata = txn.open_table(METADATA)?;
                let mut data = txn.open_table(DATA)?;

                let mut expired = Vec::new();
                for entry in metadata.iter()? {
                    let (key, times) = entry?;
                    stats.scanned += 1;
                    if is_expired(times.value().0, now_ns, ttl_ns) {
                        expired.push(key.value().to_string());
                    }
                }

                for key in &expired {
                    metadata.remove(key.as_str())?;
                    data.remove(key.as_str())?;
                }
                stats.deleted = expired.len() as u64;
            }
            txn.commit()?;
            Ok(stats)
        })?;

        let elapsed = started.elapsed();
        info!(
            "GC of store '{}' scanned {} entries, deleted {} in {:?}",
            self.name(),
            stats.scanned,
            stats.deleted,
            elapsed
        );
        if elapsed > self.config.gc_warn_after() {
            warn!(
                "GC of store '{}' took {:?}; consider batched cleanup for stores this large",
                self.name(),
                elapsed
            );
        }
        Ok(stats)
    }

    /// Delete expired entries in transactions of at most `max_batch`
    /// scanned keys, resuming after the last key of the previous batch.
    pub fn cleanup_expired(&self, ttl: Duration, now_ns: u64, max_batch: usize) -> Result<GcStats> {
        let ttl_ns = ttl_nanos(ttl);
        let max_batch = max_batch.max(1);
        let mut total = GcStats::default();
        let mut cursor: Option<String> = None;
        let mut batches = 0u64;

        loop {
            let (batch, next_cursor) = self.with_db(|db| {
                let txn = db.begin_write()?;
                let mut batch = GcStats::default();
                let mut last_key = None;
                {
                    let mut metadata = txn.open_table(METADATA)?;
                    let mut data = txn.open_table(DATA)?;

                    let lower = cursor
                        .as_deref()
                        .map_or(Bound::Unbounded, Bound::Excluded);
                    let mut expired = Vec::new();
                    for entry in metadata.range::<&str>((lower, Bound::Unbounded))? {
                        let (key, times) = entry?;
                        batch.scanned += 1;
                        let key = key.value().to_string();
                        if is_expired(times.value().0, now_ns, ttl_ns) {
                            expired.push(key.clone());
                        }
                        last_key = Some(key);
                        if batch.scanned as usize >= max_batch {
                            break;
                        }
                    }

                    for key in &expired {
                        metadata.remove(key.as_str())?;
                        data.remove(key.as_str())?;
                    }
                    batch.deleted = expired.len() as u64;
                }
                txn.commit()?;
                Ok((batch, last_key))
            })?;

            batches += 1;
            total.scanned += batch.scanned;
            total.deleted += batch.deleted;
            if (batch.scanned as usize) < max_batch || next_cursor.is_none() {
                break;
            }
            cursor = next_cursor;
        }

        debug!(
            "Cleanup of store '{}' scanned {} entries, deleted {} in {} batches",
            self.name(),
            total.scanned,
            total.deleted,
            batches
        );
        Ok(total)
    }
}
