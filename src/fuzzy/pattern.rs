use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NamingError, Result};
use crate::model::{ServiceKey, DEFAULT_NAMESPACE, GROUP_SEPARATOR};

/// Matches any group or any name.
pub const ANY_PATTERN: &str = "*";

const NAMESPACE_SEPARATOR: &str = ">>";

/// Group/name pattern scoped to a namespace.
///
/// A key matches when the namespace is equal, the group equals the group
/// pattern (or the group pattern is `*`), and the name equals the name
/// pattern, starts with the text before a trailing `*`, or the name pattern
/// is `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuzzyWatchPattern {
    namespace: String,
    group_pattern: String,
    name_pattern: String,
}

impl FuzzyWatchPattern {
    pub fn new(
        namespace: impl Into<String>,
        group_pattern: impl Into<String>,
        name_pattern: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group_pattern: group_pattern.into(),
            name_pattern: name_pattern.into(),
        }
    }

    /// Pattern in the default namespace.
    pub fn in_default_namespace(
        group_pattern: impl Into<String>,
        name_pattern: impl Into<String>,
    ) -> Self {
        Self::new(DEFAULT_NAMESPACE, group_pattern, name_pattern)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group_pattern(&self) -> &str {
        &self.group_pattern
    }

    pub fn name_pattern(&self) -> &str {
        &self.name_pattern
    }

    /// `namespace>>group@@name`.
    pub fn pattern_key(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.namespace, NAMESPACE_SEPARATOR, self.group_pattern, GROUP_SEPARATOR, self.name_pattern
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(NamingError::invalid("fuzzy watch namespace must not be blank"));
        }
        if self.group_pattern.trim().is_empty() || self.name_pattern.trim().is_empty() {
            return Err(NamingError::invalid(format!(
                "fuzzy watch patterns must not be blank: {}",
                self.pattern_key()
            )));
        }
        Ok(())
    }

    /// Whether `key` falls under this pattern. Clusters are ignored.
    pub fn matches(&self, key: &ServiceKey) -> bool {
        self.namespace == key.namespace()
            && Self::group_matches(&self.group_pattern, key.group())
            && Self::name_matches(&self.name_pattern, key.service_name())
    }

    fn group_matches(pattern: &str, group: &str) -> bool {
        pattern == ANY_PATTERN || pattern == group
    }

    fn name_matches(pattern: &str, name: &str) -> bool {
        if pattern == ANY_PATTERN {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => pattern == name,
        }
    }
}

impl fmt::Display for FuzzyWatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern_key())
    }
}
