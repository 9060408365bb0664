//! In-memory service instance cache.
//!
//! Each key owns an entry holding the current snapshot and the chooser
//! derived from it. Both are swapped whole with `arc-swap`, so readers load
//! a consistent pair without locking. Writers for the same key serialize on
//! a per-entry mutex; different keys never contend.

pub mod backup;
pub mod reconciler;

pub use backup::LocalBackup;
pub use reconciler::{InstanceDiff, PushReconciler, Reconciled};

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::balancer::{instance_chooser, ChooserError, InstanceChooser};
use crate::error::{NamingError, Result};
use crate::model::{InstanceRecord, ServiceKey, ServiceSnapshot};

struct CacheEntry {
    snapshot: ArcSwap<ServiceSnapshot>,
    chooser: ArcSwapOption<InstanceChooser>,
    write_lock: Mutex<()>,
}

impl CacheEntry {
    fn new(snapshot: ServiceSnapshot) -> Self {
        let chooser = build_chooser(&snapshot);
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            chooser: ArcSwapOption::new(chooser),
            write_lock: Mutex::new(()),
        }
    }

    /// Swap in `snapshot`, rebuilding the chooser only when content changed.
    /// Caller holds `write_lock`.
    fn store(&self, snapshot: ServiceSnapshot) {
        let fingerprint_changed = self.snapshot.load().fingerprint != snapshot.fingerprint;
        if fingerprint_changed {
            self.chooser.store(build_chooser(&snapshot));
        }
        self.snapshot.store(Arc::new(snapshot));
    }
}

fn build_chooser(snapshot: &ServiceSnapshot) -> Option<Arc<InstanceChooser>> {
    match instance_chooser(snapshot) {
        Ok(chooser) => Some(Arc::new(chooser)),
        Err(e) => {
            warn!(key = %snapshot.key, error = %e, "Could not build chooser");
            None
        }
    }
}

/// Latest known instance list per service key.
pub struct ServiceInfoCache {
    entries: DashMap<ServiceKey, Arc<CacheEntry>>,
    backup: Option<LocalBackup>,
}

impl ServiceInfoCache {
    pub fn new(backup: Option<LocalBackup>) -> Self {
        Self {
            entries: DashMap::new(),
            backup,
        }
    }

    fn entry(&self, key: &ServiceKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Current snapshot for `key`. May be stale or provisional.
    pub fn get(&self, key: &ServiceKey) -> Option<Arc<ServiceSnapshot>> {
        self.entry(key).map(|e| e.snapshot.load_full())
    }

    /// Chooser for the current snapshot of `key`.
    pub fn chooser(&self, key: &ServiceKey) -> Option<Arc<InstanceChooser>> {
        self.entry(key).and_then(|e| e.chooser.load_full())
    }

    /// Replace the snapshot for `key` unconditionally.
    pub fn update(&self, key: &ServiceKey, snapshot: ServiceSnapshot) -> InstanceDiff {
        self.write(key, snapshot, false)
            .unwrap_or_else(|_| InstanceDiff::unchanged())
    }

    /// Replace the snapshot for `key` unless the cache holds a newer
    /// confirmed revision.
    ///
    /// A provisional snapshot (loaded from backup) is always superseded.
    pub fn compare_and_update(
        &self,
        key: &ServiceKey,
        snapshot: ServiceSnapshot,
    ) -> Result<InstanceDiff> {
        self.write(key, snapshot, true)
    }

    fn write(
        &self,
        key: &ServiceKey,
        snapshot: ServiceSnapshot,
        check_revision: bool,
    ) -> Result<InstanceDiff> {
        let entry = match self.entry(key) {
            Some(entry) => entry,
            None => {
                let mut created = false;
                let entry = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(CacheEntry::new(snapshot.clone()))
                    })
                    .value()
                    .clone();
                if created {
                    debug!(key = %key, revision = snapshot.revision, "Cached first snapshot");
                    return Ok(InstanceDiff::between(None, &snapshot));
                }
                entry
            }
        };

        let _guard = entry.write_lock.lock();
        let current = entry.snapshot.load_full();
        if check_revision && !current.provisional && snapshot.revision < current.revision {
            return Err(NamingError::Stale {
                key: key.to_string(),
                incoming: snapshot.revision,
                current: current.revision,
            });
        }

        let diff = InstanceDiff::between(Some(&current), &snapshot);
        entry.store(snapshot);
        Ok(diff)
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ServiceKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the cached snapshot for `key`.
    pub fn remove(&self, key: &ServiceKey) -> Option<Arc<ServiceSnapshot>> {
        self.entries
            .remove(key)
            .map(|(_, entry)| entry.snapshot.load_full())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    // ========================================================================
    // Local backup
    // ========================================================================

    pub fn backup(&self) -> Option<&LocalBackup> {
        self.backup.as_ref()
    }

    /// Provisional snapshot for `key` from disk, if any.
    pub fn load_from_local_backup(&self, key: &ServiceKey) -> Option<ServiceSnapshot> {
        self.backup.as_ref().and_then(|b| b.read(key))
    }

    /// Write `snapshot` to disk. Failures are logged only.
    pub fn persist_to_local_backup(&self, key: &ServiceKey, snapshot: &ServiceSnapshot) {
        if let Some(backup) = &self.backup {
            if backup.write(snapshot) {
                debug!(key = %key, "Persisted backup");
            }
        }
    }

    /// Seed the cache with every backed-up snapshot for `namespace`. Keys
    /// already present are left alone. Returns the number loaded.
    pub fn load_all_from_backup(&self, namespace: &str) -> usize {
        let Some(backup) = &self.backup else {
            return 0;
        };
        let mut loaded = 0;
        for snapshot in backup.read_namespace(namespace) {
            let key = snapshot.key.clone();
            if self.contains(&key) {
                continue;
            }
            self.entries
                .entry(key)
                .or_insert_with(|| Arc::new(CacheEntry::new(snapshot)));
            loaded += 1;
        }
        if loaded > 0 {
            info!(namespace = %namespace, count = loaded, "Loaded cache from local backup");
        }
        loaded
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Healthy instances of `key`, or all instances when `healthy` is false.
    pub fn select_instances(&self, key: &ServiceKey, healthy: bool) -> Vec<InstanceRecord> {
        match self.get(key) {
            Some(snapshot) if healthy => snapshot.healthy_instances(),
            Some(snapshot) => snapshot.instances.clone(),
            None => Vec::new(),
        }
    }

    /// One healthy instance of `key`, weighted by instance weight.
    pub fn select_one_healthy(&self, key: &ServiceKey) -> Result<InstanceRecord> {
        let chooser = self
            .chooser(key)
            .ok_or(NamingError::Chooser(ChooserError::Empty))?;
        let picked = chooser.random_with_weight()?;
        Ok(picked.clone())
    }
}
