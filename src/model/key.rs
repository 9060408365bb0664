use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DEFAULT_GROUP, DEFAULT_NAMESPACE, GROUP_SEPARATOR};
use crate::error::{NamingError, Result};

/// Identity of a service as seen by the client.
///
/// Clusters are kept sorted and de-duplicated so that two keys naming the
/// same clusters in a different order compare equal. An empty cluster list
/// means "all clusters".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    namespace: String,
    group: String,
    service_name: String,
    clusters: Vec<String>,
}

impl ServiceKey {
    /// Create a key without cluster restriction.
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            service_name: service_name.into(),
            clusters: Vec::new(),
        }
    }

    /// Key in the default namespace and group.
    pub fn simple(service_name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, DEFAULT_GROUP, service_name)
    }

    /// Restrict the key to the given clusters.
    pub fn with_clusters<I, S>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut clusters: Vec<String> = clusters
            .into_iter()
            .map(Into::into)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        clusters.sort();
        clusters.dedup();
        self.clusters = clusters;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn clusters(&self) -> &[String] {
        &self.clusters
    }

    /// Same service with the cluster restriction dropped.
    pub fn without_clusters(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            group: self.group.clone(),
            service_name: self.service_name.clone(),
            clusters: Vec::new(),
        }
    }

    /// `group@@service`.
    pub fn grouped_name(&self) -> String {
        format!("{}{}{}", self.group, GROUP_SEPARATOR, self.service_name)
    }

    /// `group@@service` or `group@@service@@c1,c2`.
    pub fn cache_key(&self) -> String {
        if self.clusters.is_empty() {
            self.grouped_name()
        } else {
            format!(
                "{}{}{}",
                self.grouped_name(),
                GROUP_SEPARATOR,
                self.clusters.join(",")
            )
        }
    }

    /// Reject blank components and embedded separators.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(NamingError::invalid("namespace must not be blank"));
        }
        if self.group.trim().is_empty() {
            return Err(NamingError::invalid("group must not be blank"));
        }
        if self.service_name.trim().is_empty() {
            return Err(NamingError::invalid("service name must not be blank"));
        }
        if self.group.contains(GROUP_SEPARATOR) || self.service_name.contains(GROUP_SEPARATOR) {
            return Err(NamingError::invalid(format!(
                "group and service name must not contain '{}': {}",
                GROUP_SEPARATOR,
                self.grouped_name()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}##{}", self.namespace, self.cache_key())
    }
}
