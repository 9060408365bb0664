//! Naming client facade.
//!
//! Wires the cache, subscriptions, fuzzy engine, redo table and connection
//! coordinator together and exposes the application-facing operations.
//! Every outbound intent is recorded for redo before anything is sent, so a
//! call that returns `Submission::Pending` is still honoured once the
//! connection comes back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::cache::{LocalBackup, ServiceInfoCache};
use crate::config::NamingConfig;
use crate::connection::{ConnectionCoordinator, CoordinatorParts, Submission};
use crate::error::{NamingError, Result};
use crate::fuzzy::{FuzzyMatchEngine, FuzzyWatchEvent, FuzzyWatchPattern, FuzzyWatcher, WatcherId};
use crate::model::{InstanceRecord, ServiceKey};
use crate::redo::{BatchRetain, RedoKey, RedoPayload, RedoService, RemovalAction};
use crate::subscription::{call_guarded, ServiceListener, SubscriptionRegistry};
use crate::transport::{ConnectionState, KeyChange, NamingTransport};

/// A fuzzy watcher attached by `NamingClient::fuzzy_watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyWatchRegistration {
    pub pattern: FuzzyWatchPattern,
    pub watcher_id: WatcherId,
    pub submission: Submission,
}

pub struct NamingClient {
    config: NamingConfig,
    cache: Arc<ServiceInfoCache>,
    subscriptions: Arc<SubscriptionRegistry>,
    fuzzy: Arc<FuzzyMatchEngine>,
    redo: Arc<RedoService>,
    coordinator: Arc<ConnectionCoordinator>,
    fetch_tx: mpsc::UnboundedSender<ServiceKey>,
}

impl NamingClient {
    /// Build the client and start connecting. Must be called inside a tokio
    /// runtime.
    pub fn new(config: NamingConfig, transport: Arc<dyn NamingTransport>) -> Result<Self> {
        config.validate()?;

        let backup = (config.backup_enabled || config.load_cache_at_start)
            .then(|| LocalBackup::new(config.resolved_cache_dir()));
        let cache = Arc::new(ServiceInfoCache::new(backup));
        let fuzzy = Arc::new(FuzzyMatchEngine::new());

        if config.load_cache_at_start {
            let loaded = cache.load_all_from_backup(&config.namespace);
            for key in cache.keys() {
                fuzzy.on_service_key_observed(&key);
            }
            debug!(namespace = %config.namespace, loaded, "Cache seeded at start");
        }

        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionRegistry::new(cache.clone(), fetch_tx.clone()));
        let redo = Arc::new(RedoService::new(config.redo_concurrency, config.redo_delay()));

        let coordinator = ConnectionCoordinator::new(
            config.clone(),
            transport,
            CoordinatorParts {
                cache: cache.clone(),
                subscriptions: subscriptions.clone(),
                fuzzy: fuzzy.clone(),
                redo: redo.clone(),
            },
        );
        coordinator.start(fetch_rx);

        Ok(Self {
            config,
            cache,
            subscriptions,
            fuzzy,
            redo,
            coordinator,
            fetch_tx,
        })
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Key in the client's namespace.
    pub fn service_key(&self, group: &str, service_name: &str) -> ServiceKey {
        ServiceKey::new(self.config.namespace.clone(), group, service_name)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.coordinator.is_shut_down() {
            return Err(NamingError::Shutdown);
        }
        Ok(())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register one instance for `key`, replacing any earlier registration
    /// for the same key.
    pub async fn register_instance(
        &self,
        key: &ServiceKey,
        instance: InstanceRecord,
    ) -> Result<Submission> {
        self.ensure_running()?;
        key.validate()?;
        instance.validate()?;

        let redo_key = RedoKey::Instance(key.without_clusters());
        self.redo
            .add_or_update(redo_key.clone(), RedoPayload::Instance(instance));
        self.coordinator.submit(&redo_key).await
    }

    /// Register several instances for `key` as one unit.
    pub async fn batch_register_instances(
        &self,
        key: &ServiceKey,
        instances: Vec<InstanceRecord>,
    ) -> Result<Submission> {
        self.ensure_running()?;
        key.validate()?;
        if instances.is_empty() {
            return Err(NamingError::invalid("batch register needs at least one instance"));
        }
        for instance in &instances {
            instance.validate()?;
        }

        let redo_key = RedoKey::Instance(key.without_clusters());
        self.redo
            .add_or_update(redo_key.clone(), RedoPayload::Instances(instances));
        self.coordinator.submit(&redo_key).await
    }

    /// Withdraw `instance`. When it was part of a batch, the rest of the
    /// batch stays registered.
    pub async fn deregister_instance(
        &self,
        key: &ServiceKey,
        instance: &InstanceRecord,
    ) -> Result<Submission> {
        self.ensure_running()?;
        key.validate()?;

        let redo_key = RedoKey::Instance(key.without_clusters());
        match self.redo.retain_batch(&redo_key, |i| !i.same_address(instance)) {
            BatchRetain::Retained { remaining } => {
                debug!(key = %key, remaining, "Instance withdrawn from batch");
                return self.coordinator.submit(&redo_key).await;
            }
            BatchRetain::Unchanged => {
                debug!(
                    key = %key,
                    ip = %instance.ip,
                    port = instance.port,
                    "Address not in batch, deregister ignored"
                );
                return Ok(if self.redo.is_registered(&redo_key) {
                    Submission::Acknowledged
                } else {
                    Submission::Pending
                });
            }
            BatchRetain::Emptied | BatchRetain::NotBatch => {}
        }

        match self.redo.mark_removing(&redo_key) {
            RemovalAction::SendUnregister => self.coordinator.submit(&redo_key).await,
            RemovalAction::Dropped => Ok(Submission::Acknowledged),
            RemovalAction::NotFound => {
                debug!(key = %key, "Deregister for unknown instance ignored");
                Ok(Submission::Acknowledged)
            }
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Attach `listener` to `key`. The first listener on a key subscribes
    /// with the server.
    pub async fn subscribe(
        &self,
        key: &ServiceKey,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<Submission> {
        self.ensure_running()?;
        key.validate()?;

        let outcome = self.subscriptions.subscribe(key.clone(), listener);
        let redo_key = RedoKey::Subscriber(key.clone());
        if !outcome.first_listener && self.redo.contains(&redo_key) {
            return Ok(if self.redo.is_registered(&redo_key) {
                Submission::Acknowledged
            } else {
                Submission::Pending
            });
        }

        self.redo.add_or_update(redo_key.clone(), RedoPayload::Subscriber);
        self.coordinator.submit(&redo_key).await
    }

    /// Detach `listener`. Removing the last listener unsubscribes with the
    /// server.
    pub async fn unsubscribe(
        &self,
        key: &ServiceKey,
        listener: &Arc<dyn ServiceListener>,
    ) -> Result<Submission> {
        self.ensure_running()?;
        if !self.subscriptions.unsubscribe(key, listener) {
            return Ok(Submission::Acknowledged);
        }

        let redo_key = RedoKey::Subscriber(key.clone());
        let submission = match self.redo.mark_removing(&redo_key) {
            RemovalAction::SendUnregister => self.coordinator.submit(&redo_key).await?,
            RemovalAction::Dropped | RemovalAction::NotFound => Submission::Acknowledged,
        };

        if !self.redo.contains(&RedoKey::Instance(key.without_clusters())) {
            self.cache.remove(key);
        }
        Ok(submission)
    }

    pub fn subscribed_services(&self) -> Vec<ServiceKey> {
        self.subscriptions.subscribed_keys()
    }

    // ========================================================================
    // Fuzzy watch
    // ========================================================================

    /// Watch every service in the client's namespace whose group and name
    /// match the patterns. The watcher first receives an `Added` event for
    /// each matching service the client already knows.
    pub async fn fuzzy_watch(
        &self,
        group_pattern: &str,
        name_pattern: &str,
        watcher: Arc<dyn FuzzyWatcher>,
    ) -> Result<FuzzyWatchRegistration> {
        self.ensure_running()?;
        let pattern =
            FuzzyWatchPattern::new(self.config.namespace.clone(), group_pattern, name_pattern);
        pattern.validate()?;

        let added = self.fuzzy.add_pattern(pattern.clone(), watcher.clone());
        for key in &added.initial {
            let event = FuzzyWatchEvent {
                pattern: pattern.clone(),
                key: key.clone(),
                change: KeyChange::Added,
            };
            call_guarded("fuzzy_watcher", || watcher.on_event(&event));
        }

        let redo_key = RedoKey::FuzzyWatch(pattern.clone());
        let submission = if added.new_pattern || !self.redo.contains(&redo_key) {
            self.redo.add_or_update(redo_key.clone(), RedoPayload::FuzzyWatch);
            self.coordinator.submit(&redo_key).await?
        } else if self.redo.is_registered(&redo_key) {
            Submission::Acknowledged
        } else {
            Submission::Pending
        };

        info!(
            pattern = %pattern,
            watcher_id = %added.watcher_id,
            initial = added.initial.len(),
            "Fuzzy watch attached"
        );
        Ok(FuzzyWatchRegistration {
            pattern,
            watcher_id: added.watcher_id,
            submission,
        })
    }

    /// Detach a fuzzy watcher. The last watcher of a pattern cancels it with
    /// the server.
    pub async fn cancel_fuzzy_watch(
        &self,
        pattern: &FuzzyWatchPattern,
        watcher_id: WatcherId,
    ) -> Result<Submission> {
        self.ensure_running()?;
        if !self.fuzzy.remove_pattern(pattern, watcher_id) {
            return Ok(Submission::Acknowledged);
        }

        let redo_key = RedoKey::FuzzyWatch(pattern.clone());
        match self.redo.mark_removing(&redo_key) {
            RemovalAction::SendUnregister => self.coordinator.submit(&redo_key).await,
            RemovalAction::Dropped | RemovalAction::NotFound => Ok(Submission::Acknowledged),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cached instances for `key`. Never blocks on the network; an unknown
    /// key yields an empty list and triggers a background fetch.
    pub fn get_instances(&self, key: &ServiceKey) -> Vec<InstanceRecord> {
        match self.cache.get(key) {
            Some(snapshot) => snapshot.instances.clone(),
            None => {
                let _ = self.fetch_tx.send(key.clone());
                Vec::new()
            }
        }
    }

    /// Cached instances for `key`. With `healthy` set, only instances that
    /// are both healthy and enabled.
    pub fn select_instances(&self, key: &ServiceKey, healthy: bool) -> Vec<InstanceRecord> {
        self.cache.select_instances(key, healthy)
    }

    /// Weighted random pick among healthy instances.
    pub fn select_one_healthy_instance(&self, key: &ServiceKey) -> Result<InstanceRecord> {
        self.cache.select_one_healthy(key)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.coordinator.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.coordinator.watch_state()
    }

    /// Wait until connected. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.coordinator.wait_connected(timeout).await
    }

    /// Stop background work and drop all local state. Further calls fail
    /// with `NamingError::Shutdown`.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.subscriptions.clear();
        self.fuzzy.clear();
        self.cache.clear();
        info!("Naming client shut down");
    }
}
