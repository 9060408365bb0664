use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::DEFAULT_CLUSTER;
use crate::error::{NamingError, Result};

/// A single service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceRecord {
    /// Explicit instance id. Falls back to `identity()` when unset.
    pub instance_id: Option<String>,
    pub ip: String,
    pub port: u16,
    /// Selection weight. Zero keeps the instance listed but never picked.
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    /// Ephemeral instances live only as long as the client connection.
    pub ephemeral: bool,
    pub cluster_name: String,
    pub metadata: BTreeMap<String, String>,
}

impl Default for InstanceRecord {
    fn default() -> Self {
        Self {
            instance_id: None,
            ip: String::new(),
            port: 0,
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            cluster_name: DEFAULT_CLUSTER.to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

impl InstanceRecord {
    /// Create a healthy, enabled, ephemeral instance with weight 1.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Diff identity: `ip:port:cluster`.
    pub fn identity(&self) -> String {
        format!("{}:{}:{}", self.ip, self.port, self.cluster_name)
    }

    /// Explicit id if set, otherwise the diff identity.
    pub fn instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(|| self.identity())
    }

    /// Same ip and port, ignoring everything else.
    pub fn same_address(&self, other: &InstanceRecord) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// Healthy, enabled and carrying a positive weight.
    pub fn is_selectable(&self) -> bool {
        self.healthy && self.enabled && self.weight > 0.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.ip.trim().is_empty() {
            return Err(NamingError::invalid("instance ip must not be blank"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(NamingError::invalid(format!(
                "instance {} has invalid weight {}",
                self.identity(),
                self.weight
            )));
        }
        Ok(())
    }
}
