//! Naming client configuration.
//!
//! Loaded from YAML files and environment variables with the `config`
//! crate. Every field has a default, so an empty source yields a working
//! client.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{NamingError, Result};
use crate::model::DEFAULT_NAMESPACE;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "naming.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NAMING_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NAMING";
/// Directory under `$HOME` used when no cache directory is configured.
pub const DEFAULT_CACHE_DIR_NAME: &str = ".naming-cache";

/// What a register or subscribe call does while the connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectedPolicy {
    /// Wait up to `connect_wait_timeout_ms` for the connection.
    #[default]
    Block,
    /// Record the intent and return at once.
    Queue,
}

/// Naming client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Namespace for keys built by the client.
    pub namespace: String,
    /// Root directory for local backup files. None = `$HOME/.naming-cache`.
    pub cache_dir: Option<PathBuf>,
    /// Write changed snapshots to local backup.
    pub backup_enabled: bool,
    /// Seed the cache from local backup on startup.
    pub load_cache_at_start: bool,
    /// How often accumulated changes are flushed to backup.
    pub backup_interval_ms: u64,
    /// Keep the previous instance list when a push carries none.
    pub push_empty_protection: bool,
    /// Redo timer period; also the first retry delay for a failed task.
    pub redo_delay_ms: u64,
    /// Maximum redo requests in flight at once.
    pub redo_concurrency: usize,
    /// Per-request timeout applied around transport calls.
    pub request_timeout_ms: u64,
    /// Behaviour of register/subscribe while disconnected.
    pub disconnected_policy: DisconnectedPolicy,
    /// Upper bound on the wait under `DisconnectedPolicy::Block`.
    pub connect_wait_timeout_ms: u64,
    /// Report a wait timeout as an error instead of a pending submission.
    pub timeout_is_error: bool,
    /// Fuzzy sync loop period.
    pub fuzzy_check_interval_ms: u64,
    /// Interval between full fuzzy pattern re-syncs.
    pub fuzzy_full_sync_interval_ms: u64,
    /// First reconnect delay.
    pub reconnect_min_delay_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_delay_ms: u64,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cache_dir: None,
            backup_enabled: true,
            load_cache_at_start: false,
            backup_interval_ms: 1_000,
            push_empty_protection: false,
            redo_delay_ms: 3_000,
            redo_concurrency: 8,
            request_timeout_ms: 3_000,
            disconnected_policy: DisconnectedPolicy::Block,
            connect_wait_timeout_ms: 3_000,
            timeout_is_error: false,
            fuzzy_check_interval_ms: 5_000,
            fuzzy_full_sync_interval_ms: 180_000,
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 5_000,
        }
    }
}

impl NamingConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `naming.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `NAMING_CONFIG` environment variable (if set)
    /// 4. Environment variables with `NAMING` prefix and `__` separator
    pub fn load(path: Option<&str>) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: NamingConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Config for tests: no backup, short timers.
    pub fn for_test() -> Self {
        Self {
            backup_enabled: false,
            backup_interval_ms: 50,
            redo_delay_ms: 50,
            request_timeout_ms: 1_000,
            connect_wait_timeout_ms: 200,
            fuzzy_check_interval_ms: 50,
            reconnect_min_delay_ms: 10,
            reconnect_max_delay_ms: 50,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(NamingError::invalid("namespace must not be blank"));
        }
        if self.redo_concurrency == 0 {
            return Err(NamingError::invalid("redo_concurrency must be at least 1"));
        }
        if self.redo_delay_ms == 0
            || self.backup_interval_ms == 0
            || self.fuzzy_check_interval_ms == 0
        {
            return Err(NamingError::invalid("timer intervals must be positive"));
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return Err(NamingError::invalid(
                "reconnect_min_delay_ms must not exceed reconnect_max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Backup root, falling back to `$HOME/.naming-cache` or `./.naming-cache`.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_CACHE_DIR_NAME),
        }
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    pub fn redo_delay(&self) -> Duration {
        Duration::from_millis(self.redo_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_wait_timeout_ms)
    }

    pub fn fuzzy_check_interval(&self) -> Duration {
        Duration::from_millis(self.fuzzy_check_interval_ms)
    }

    pub fn fuzzy_full_sync_interval(&self) -> Duration {
        Duration::from_millis(self.fuzzy_full_sync_interval_ms)
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}
