use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{InstanceRecord, ServiceKey};
use crate::error::{NamingError, Result};

/// Immutable view of a service's instances at one point in time.
///
/// Snapshots are replaced wholesale, never edited. Equality compares key and
/// fingerprint, so a pure reordering of instances is not a change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub key: ServiceKey,
    pub instances: Vec<InstanceRecord>,
    /// SHA-256 over the identity-sorted instance list.
    pub fingerprint: String,
    /// Server refresh stamp; older revisions are discarded.
    pub revision: u64,
    pub last_updated: DateTime<Utc>,
    /// Loaded from local backup and not yet confirmed by the server.
    #[serde(skip)]
    pub provisional: bool,
}

impl ServiceSnapshot {
    pub fn new(key: ServiceKey, instances: Vec<InstanceRecord>, revision: u64) -> Self {
        let fingerprint = Self::fingerprint_of(&instances);
        Self {
            key,
            instances,
            fingerprint,
            revision,
            last_updated: Utc::now(),
            provisional: false,
        }
    }

    /// Snapshot with no instances.
    pub fn empty(key: ServiceKey) -> Self {
        Self::new(key, Vec::new(), 0)
    }

    /// Content fingerprint, independent of instance order.
    pub fn fingerprint_of(instances: &[InstanceRecord]) -> String {
        let mut sorted: Vec<&InstanceRecord> = instances.iter().collect();
        sorted.sort_by_key(|i| i.identity());

        let mut hasher = Sha256::new();
        for instance in sorted {
            // BTreeMap metadata keeps the encoding deterministic.
            match serde_json::to_vec(instance) {
                Ok(bytes) => hasher.update(&bytes),
                Err(_) => hasher.update(instance.identity().as_bytes()),
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Mark as loaded from backup.
    pub fn into_provisional(mut self) -> Self {
        self.provisional = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Healthy and enabled instances, in snapshot order.
    pub fn healthy_instances(&self) -> Vec<InstanceRecord> {
        self.instances
            .iter()
            .filter(|i| i.healthy && i.enabled)
            .cloned()
            .collect()
    }

    /// Every instance must carry a finite, non-negative weight.
    pub fn validate(&self) -> Result<()> {
        for instance in &self.instances {
            instance
                .validate()
                .map_err(|e| NamingError::invalid(format!("{}: {}", self.key, e)))?;
        }
        Ok(())
    }
}

impl PartialEq for ServiceSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.fingerprint == other.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> InstanceRecord {
        InstanceRecord::new("1.1.1.1", 8888)
    }

    fn b() -> InstanceRecord {
        InstanceRecord::new("2.2.2.2", 8888).with_metadata("zone", "east")
    }

    #[test]
    fn test_reordering_is_not_a_change() {
        let key = ServiceKey::simple("s1");
        let first = ServiceSnapshot::new(key.clone(), vec![a(), b()], 1);
        let second = ServiceSnapshot::new(key, vec![b(), a()], 2);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first, second);
    }

    #[test]
    fn test_metadata_change_alters_fingerprint() {
        let key = ServiceKey::simple("s1");
        let first = ServiceSnapshot::new(key.clone(), vec![a()], 1);
        let second = ServiceSnapshot::new(key, vec![a().with_metadata("v", "2")], 1);
        assert_ne!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_validate_reports_bad_weight() {
        let key = ServiceKey::simple("s1");
        let snapshot = ServiceSnapshot::new(key, vec![a().with_weight(f64::NAN)], 1);
        assert!(matches!(
            snapshot.validate(),
            Err(NamingError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_healthy_instances_filters() {
        let key = ServiceKey::simple("s1");
        let snapshot = ServiceSnapshot::new(
            key,
            vec![a(), b().with_healthy(false), a().with_cluster("c").with_enabled(false)],
            1,
        );
        assert_eq!(snapshot.healthy_instances(), vec![a()]);
    }

    #[test]
    fn test_provisional_flag_not_serialized() {
        let key = ServiceKey::simple("s1");
        let snapshot = ServiceSnapshot::new(key, vec![a()], 7).into_provisional();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: ServiceSnapshot = serde_json::from_str(&json).unwrap();
        assert!(!restored.provisional);
        assert_eq!(restored.revision, 7);
        assert_eq!(restored, snapshot);
    }
}
