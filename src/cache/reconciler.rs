//! Applies server pushes to the cache.
//!
//! Instances are matched by identity (`ip:port:cluster`). An instance present
//! on both sides with different content counts as modified. The incoming
//! snapshot is always stored, so fingerprint and timestamp stay current, but
//! only a changed snapshot is reported for notification and backup.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::ServiceInfoCache;
use crate::error::{NamingError, Result};
use crate::model::{InstanceRecord, ServiceKey, ServiceSnapshot};

/// Per-instance difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceDiff {
    pub added: Vec<InstanceRecord>,
    pub removed: Vec<InstanceRecord>,
    pub modified: Vec<InstanceRecord>,
    pub is_changed: bool,
}

impl InstanceDiff {
    /// Diff `incoming` against `current`. A key seen for the first time is
    /// always a change.
    pub fn between(current: Option<&ServiceSnapshot>, incoming: &ServiceSnapshot) -> Self {
        let Some(current) = current else {
            return Self {
                added: incoming.instances.clone(),
                removed: Vec::new(),
                modified: Vec::new(),
                is_changed: true,
            };
        };

        let old: BTreeMap<String, &InstanceRecord> = current
            .instances
            .iter()
            .map(|i| (i.identity(), i))
            .collect();
        let new: BTreeMap<String, &InstanceRecord> = incoming
            .instances
            .iter()
            .map(|i| (i.identity(), i))
            .collect();

        let mut diff = Self::default();
        for (identity, instance) in &new {
            match old.get(identity) {
                None => diff.added.push((*instance).clone()),
                Some(previous) if previous != instance => diff.modified.push((*instance).clone()),
                Some(_) => {}
            }
        }
        for (identity, instance) in &old {
            if !new.contains_key(identity) {
                diff.removed.push((*instance).clone());
            }
        }

        diff.is_changed = !diff.added.is_empty()
            || !diff.removed.is_empty()
            || !diff.modified.is_empty()
            || current.fingerprint != incoming.fingerprint;
        diff
    }

    /// Diff for a snapshot that did not change anything.
    pub fn unchanged() -> Self {
        Self::default()
    }
}

/// Outcome of applying one push.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub snapshot: Arc<ServiceSnapshot>,
    pub diff: InstanceDiff,
}

/// Turns pushes into cache updates and tracks which keys need a backup.
pub struct PushReconciler {
    cache: Arc<ServiceInfoCache>,
    dirty: Mutex<BTreeSet<ServiceKey>>,
    empty_protection: bool,
}

impl PushReconciler {
    pub fn new(cache: Arc<ServiceInfoCache>) -> Self {
        Self {
            cache,
            dirty: Mutex::new(BTreeSet::new()),
            empty_protection: false,
        }
    }

    /// Ignore pushes that would empty a non-empty instance list.
    pub fn with_empty_protection(mut self, enabled: bool) -> Self {
        self.empty_protection = enabled;
        self
    }

    pub fn cache(&self) -> &Arc<ServiceInfoCache> {
        &self.cache
    }

    /// Apply a full snapshot for `key`.
    ///
    /// Fails with `InvalidParameter` for a malformed snapshot and `Stale`
    /// when the cache already holds a newer revision. Either way the cache
    /// is left untouched.
    pub fn reconcile(&self, key: &ServiceKey, incoming: ServiceSnapshot) -> Result<Reconciled> {
        if &incoming.key != key {
            return Err(NamingError::invalid(format!(
                "snapshot key {} does not match push key {}",
                incoming.key, key
            )));
        }
        incoming.validate()?;

        if self.empty_protection && incoming.is_empty() {
            if let Some(current) = self.cache.get(key).filter(|c| !c.is_empty()) {
                warn!(
                    key = %key,
                    revision = incoming.revision,
                    "Ignoring empty push, keeping previous instances"
                );
                return Ok(Reconciled {
                    snapshot: current,
                    diff: InstanceDiff::unchanged(),
                });
            }
        }

        let diff = match self.cache.compare_and_update(key, incoming) {
            Ok(diff) => diff,
            Err(e @ NamingError::Stale { .. }) => {
                warn!(key = %key, error = %e, "Discarding stale push");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let snapshot = self
            .cache
            .get(key)
            .ok_or_else(|| NamingError::invalid(format!("{} vanished during update", key)))?;

        if diff.is_changed {
            info!(
                key = %key,
                revision = snapshot.revision,
                added = diff.added.len(),
                removed = diff.removed.len(),
                modified = diff.modified.len(),
                "Service instances changed"
            );
            self.dirty.lock().insert(key.clone());
        } else {
            debug!(key = %key, revision = snapshot.revision, "Push carried no change");
        }

        Ok(Reconciled { snapshot, diff })
    }

    /// Apply an incremental push on top of the cached snapshot.
    ///
    /// `removed` holds instance identities. With nothing cached the delta is
    /// applied to an empty list.
    pub fn reconcile_delta(
        &self,
        key: &ServiceKey,
        revision: u64,
        upserted: Vec<InstanceRecord>,
        removed: &[String],
    ) -> Result<Reconciled> {
        let base: Vec<InstanceRecord> = self
            .cache
            .get(key)
            .map(|s| s.instances.clone())
            .unwrap_or_default();

        let mut merged: BTreeMap<String, InstanceRecord> =
            base.into_iter().map(|i| (i.identity(), i)).collect();
        for identity in removed {
            merged.remove(identity);
        }
        for instance in upserted {
            merged.insert(instance.identity(), instance);
        }

        let snapshot = ServiceSnapshot::new(key.clone(), merged.into_values().collect(), revision);
        self.reconcile(key, snapshot)
    }

    /// Keys changed since the last call.
    pub fn take_dirty(&self) -> Vec<ServiceKey> {
        std::mem::take(&mut *self.dirty.lock()).into_iter().collect()
    }
}
