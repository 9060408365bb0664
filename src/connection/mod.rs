//! Connection coordinator.
//!
//! Owns the link between the transport and the rest of the client. It
//! tracks the live connection epoch, drives reconnects with backoff, hands
//! unfinished redo tasks to the transport, routes pushes through the
//! reconciler to subscribers and fuzzy watchers, and runs the periodic
//! loops (redo tick, on-demand fetch, backup flush, fuzzy sync).
//!
//! Connection events are coalesced: while one event is being applied, newer
//! ones overwrite a single pending slot and only the latest is applied next.
//! Events carrying an epoch older than the latest applied one are ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::reconciler::{PushReconciler, Reconciled};
use crate::cache::ServiceInfoCache;
use crate::config::{DisconnectedPolicy, NamingConfig};
use crate::error::{NamingError, Result};
use crate::fuzzy::{is_over_limit_code, FuzzyMatchEngine, FuzzySyncLoop, FuzzyWatchPattern};
use crate::model::{ServiceKey, ServiceSnapshot};
use crate::redo::{RedoAction, RedoExecutor, RedoKey, RedoPayload, RedoService, RedoState, RedoWork};
use crate::subscription::{ServiceChangeEvent, SubscriptionRegistry};
use crate::transport::{
    ConnectionEvent, ConnectionState, Epoch, InboundHandler, KeyChange, NamingTransport, PushAck,
    PushMessage, Request, Response,
};
use crate::utils::retry::reconnect_backoff;

/// Outcome of a register, subscribe or watch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The server acknowledged the request.
    Acknowledged,
    /// Recorded locally; the redo loop sends it once a connection is up.
    Pending,
}

/// Shared collaborators the coordinator drives.
pub struct CoordinatorParts {
    pub cache: Arc<ServiceInfoCache>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub fuzzy: Arc<FuzzyMatchEngine>,
    pub redo: Arc<RedoService>,
}

pub struct ConnectionCoordinator {
    me: Weak<ConnectionCoordinator>,
    config: NamingConfig,
    transport: Arc<dyn NamingTransport>,
    cache: Arc<ServiceInfoCache>,
    reconciler: PushReconciler,
    subscriptions: Arc<SubscriptionRegistry>,
    fuzzy: Arc<FuzzyMatchEngine>,
    redo: Arc<RedoService>,
    fuzzy_sync: FuzzySyncLoop,
    state_tx: watch::Sender<ConnectionState>,
    switch_lock: Mutex<()>,
    pending_event: Mutex<Option<ConnectionEvent>>,
    latest_epoch: AtomicU64,
    reconnecting: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl ConnectionCoordinator {
    /// Build the coordinator and install it as the transport's inbound
    /// handler. Nothing runs until `start`.
    pub fn new(
        config: NamingConfig,
        transport: Arc<dyn NamingTransport>,
        parts: CoordinatorParts,
    ) -> Arc<Self> {
        let reconciler = PushReconciler::new(parts.cache.clone())
            .with_empty_protection(config.push_empty_protection);
        let fuzzy_sync =
            FuzzySyncLoop::new(config.fuzzy_check_interval(), config.fuzzy_full_sync_interval());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (cancel_tx, _) = watch::channel(false);

        let coordinator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            transport,
            cache: parts.cache,
            reconciler,
            subscriptions: parts.subscriptions,
            fuzzy: parts.fuzzy,
            redo: parts.redo,
            fuzzy_sync,
            state_tx,
            switch_lock: Mutex::new(()),
            pending_event: Mutex::new(None),
            latest_epoch: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            cancel_tx,
            shut_down: AtomicBool::new(false),
        });

        let strong: Arc<dyn InboundHandler> = coordinator.clone();
        coordinator.transport.register_inbound(Arc::downgrade(&strong));
        coordinator
    }

    /// Spawn the background loops and the first connection attempt.
    pub fn start(self: &Arc<Self>, fetch_rx: mpsc::UnboundedReceiver<ServiceKey>) {
        tokio::spawn(self.clone().redo_loop(self.cancel_tx.subscribe()));
        tokio::spawn(self.clone().fetch_loop(fetch_rx, self.cancel_tx.subscribe()));
        if self.config.backup_enabled {
            tokio::spawn(self.clone().backup_loop(self.cancel_tx.subscribe()));
        }

        let me = self.clone();
        let cancel = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            let sync_target = me.clone();
            me.fuzzy_sync
                .run(
                    move |full| {
                        let coordinator = sync_target.clone();
                        async move { coordinator.sync_fuzzy_patterns(full).await }
                    },
                    cancel,
                )
                .await;
        });

        self.ensure_reconnecting();
        info!(namespace = %self.config.namespace, "Connection coordinator started");
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Wait until a connection is live. Returns false on timeout or shutdown.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        if self.state().is_connected() {
            return true;
        }
        let mut rx = self.state_tx.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| state.is_connected())).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Stop every loop. Cached data is dropped with the client.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        if self.config.backup_enabled {
            self.flush_backup().await;
        }
        self.redo.shutdown();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Connection coordinator shut down");
    }

    // ========================================================================
    // Submissions
    // ========================================================================

    /// Send the recorded redo task for `key` now if possible.
    ///
    /// While disconnected the configured policy decides whether to wait for
    /// the connection or return `Pending` at once. Rejections and invalid
    /// requests are surfaced; transient failures leave the task to the
    /// redo loop and report `Pending`.
    pub async fn submit(&self, key: &RedoKey) -> Result<Submission> {
        if self.is_shut_down() {
            return Err(NamingError::Shutdown);
        }

        if self.redo.current_epoch().is_none() {
            match self.config.disconnected_policy {
                DisconnectedPolicy::Queue => {
                    debug!(key = %key, "Disconnected, request queued for redo");
                    return Ok(Submission::Pending);
                }
                DisconnectedPolicy::Block => {
                    let timeout = self.config.connect_wait_timeout();
                    if !self.wait_connected(timeout).await {
                        if self.config.timeout_is_error {
                            return Err(NamingError::Timeout(timeout));
                        }
                        debug!(key = %key, "Connection wait timed out, request queued for redo");
                        return Ok(Submission::Pending);
                    }
                }
            }
        }

        self.try_send(key).await
    }

    async fn try_send(&self, key: &RedoKey) -> Result<Submission> {
        let Some(epoch) = self.redo.current_epoch() else {
            return Ok(Submission::Pending);
        };
        let Some(work) = self.redo.try_begin(key, epoch) else {
            return Ok(match self.redo.state(key) {
                RedoState::Registered | RedoState::Removed => Submission::Acknowledged,
                _ => Submission::Pending,
            });
        };

        let outcome = self.execute(&work).await;
        let state = self.redo.complete(&work, outcome.clone());
        match outcome {
            Ok(()) if matches!(state, RedoState::Registered | RedoState::Removed) => {
                Ok(Submission::Acknowledged)
            }
            Ok(()) => Ok(Submission::Pending),
            Err(e @ NamingError::ServerRejected { .. }) | Err(e @ NamingError::InvalidParameter(_)) => {
                Err(e)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Request failed, left to redo");
                Ok(Submission::Pending)
            }
        }
    }

    /// Send `request` on `epoch`, bounded by the request timeout.
    pub async fn send(&self, epoch: Epoch, request: Request) -> Result<Response> {
        let timeout = self.config.request_timeout();
        let kind = request.kind();
        match tokio::time::timeout(timeout, self.transport.request(epoch, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(kind, epoch, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(NamingError::Timeout(timeout))
            }
        }
    }

    fn request_for(&self, work: &RedoWork) -> Result<Request> {
        let request = match (&work.key, work.action, &work.payload) {
            (RedoKey::Instance(key), RedoAction::Register, RedoPayload::Instance(instance)) => {
                Request::RegisterInstance {
                    key: key.clone(),
                    instance: instance.clone(),
                }
            }
            (RedoKey::Instance(key), RedoAction::Register, RedoPayload::Instances(instances)) => {
                Request::BatchRegisterInstances {
                    key: key.clone(),
                    instances: instances.clone(),
                }
            }
            (RedoKey::Instance(key), RedoAction::Unregister, RedoPayload::Instance(instance)) => {
                Request::DeregisterInstance {
                    key: key.clone(),
                    instance: instance.clone(),
                }
            }
            (RedoKey::Instance(key), RedoAction::Unregister, RedoPayload::Instances(instances)) => {
                Request::BatchDeregisterInstances {
                    key: key.clone(),
                    instances: instances.clone(),
                }
            }
            (RedoKey::Subscriber(key), RedoAction::Register, _) => {
                Request::Subscribe { key: key.clone() }
            }
            (RedoKey::Subscriber(key), RedoAction::Unregister, _) => {
                Request::Unsubscribe { key: key.clone() }
            }
            (RedoKey::FuzzyWatch(pattern), RedoAction::Register, _) => {
                let received = self.fuzzy.matched_keys(pattern);
                Request::FuzzyWatch {
                    pattern: pattern.clone(),
                    initializing: received.is_empty(),
                    received,
                }
            }
            (RedoKey::FuzzyWatch(pattern), RedoAction::Unregister, _) => {
                Request::CancelFuzzyWatch {
                    pattern: pattern.clone(),
                }
            }
            (key, _, payload) => {
                return Err(NamingError::invalid(format!(
                    "payload {:?} does not fit redo key {}",
                    payload, key
                )))
            }
        };
        Ok(request)
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    /// Record `event` and apply pending events unless another caller is
    /// already doing so.
    pub async fn handle_connection_event(&self, event: ConnectionEvent) {
        *self.pending_event.lock() = Some(event);
        self.drain_events();
    }

    /// Apply whatever sits in the pending slot. Newer events overwrite the
    /// slot while one is being applied, so only the latest runs next.
    fn drain_events(&self) {
        loop {
            let Some(guard) = self.switch_lock.try_lock() else {
                return;
            };
            loop {
                let next = self.pending_event.lock().take();
                let Some(event) = next else {
                    break;
                };
                self.apply_event(event);
            }
            drop(guard);

            // An event may have landed between the last take and the unlock.
            if self.pending_event.lock().is_none() {
                return;
            }
        }
    }

    fn apply_event(&self, event: ConnectionEvent) {
        if self.is_shut_down() {
            return;
        }
        let latest = self.latest_epoch.load(Ordering::SeqCst);

        match event {
            ConnectionEvent::Connected(epoch) => {
                if epoch < latest || self.state() == ConnectionState::Connected(epoch) {
                    debug!(epoch, latest, "Ignoring stale connect event");
                    return;
                }
                self.latest_epoch.store(epoch, Ordering::SeqCst);

                // A missed disconnect still means the server forgot us.
                self.redo.on_connection_lost();
                self.redo.on_connection_established(epoch);
                self.adopt_fuzzy_patterns();
                self.fuzzy.reset_consistency();
                self.state_tx.send_replace(ConnectionState::Connected(epoch));
                info!(epoch, "Connected to naming server");

                self.spawn_redo_pass(epoch);
                self.fuzzy_sync.ring();
            }
            ConnectionEvent::Disconnected(epoch) => {
                if epoch < latest {
                    debug!(epoch, latest, "Ignoring stale disconnect event");
                    return;
                }
                if self.state().is_connected() {
                    self.redo.on_connection_lost();
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    warn!(epoch, cached = self.cache.len(), "Connection lost, serving cached instances");
                }
                self.ensure_reconnecting();
            }
        }
    }

    /// Make sure every watched pattern has a redo task.
    fn adopt_fuzzy_patterns(&self) {
        for pattern in self.fuzzy.patterns() {
            if self.fuzzy.is_over_limit(&pattern) {
                continue;
            }
            let key = RedoKey::FuzzyWatch(pattern);
            if !self.redo.contains(&key) {
                self.redo.add_or_update(key, RedoPayload::FuzzyWatch);
            }
        }
    }

    fn spawn_redo_pass(&self, epoch: Epoch) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let sent = me.redo.redo_pending(me.as_ref(), epoch).await;
            if sent > 0 {
                info!(epoch, sent, "Replayed pending requests on new connection");
            }
        });
    }

    fn ensure_reconnecting(&self) {
        if self.is_shut_down() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        let cancel = self.cancel_tx.subscribe();
        tokio::spawn(me.reconnect_loop(cancel));
    }

    async fn reconnect_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let max_delay = self.config.reconnect_max_delay();
        let backoff_builder = reconnect_backoff(self.config.reconnect_min_delay(), max_delay);
        let mut backoff_iter = backoff_builder.build();

        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        loop {
            if *cancel.borrow() {
                break;
            }

            let attempt =
                tokio::time::timeout(self.config.request_timeout(), self.transport.connect()).await;
            let reason = match attempt {
                Ok(Ok(epoch)) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.handle_connection_event(ConnectionEvent::Connected(epoch))
                        .await;
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "connect timed out".to_string(),
            };

            // Start a new round once the backoff is exhausted.
            let delay = match backoff_iter.next() {
                Some(delay) => delay,
                None => {
                    backoff_iter = backoff_builder.build();
                    max_delay
                }
            };
            warn!(
                error = %reason,
                backoff_ms = %delay.as_millis(),
                "Failed to connect, retrying after backoff"
            );
            if !Self::sleep_or_cancel(delay, &mut cancel).await {
                break;
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        debug!("Reconnect loop stopped");
    }

    /// Returns false when cancelled.
    async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = cancel.changed() => changed.is_ok() && !*cancel.borrow(),
        }
    }

    // ========================================================================
    // Pushes
    // ========================================================================

    /// Apply one server push. Batches are applied key by key; a failing key
    /// does not stop the others but makes the reply a Nack.
    pub async fn handle_push(&self, push: PushMessage) -> PushAck {
        if self.is_shut_down() {
            return PushAck::Nack("client shut down".to_string());
        }

        match push {
            PushMessage::Service(snapshot) => {
                let key = snapshot.key.clone();
                match self.apply_snapshot(&key, snapshot) {
                    Ok(()) => PushAck::Ack,
                    Err(e) => PushAck::Nack(e.to_string()),
                }
            }
            PushMessage::ServiceDelta {
                key,
                revision,
                upserted,
                removed,
            } => match self.reconciler.reconcile_delta(&key, revision, upserted, &removed) {
                Ok(reconciled) => {
                    self.after_reconcile(&key, reconciled);
                    PushAck::Ack
                }
                Err(NamingError::Stale { .. }) => PushAck::Ack,
                Err(e) => {
                    warn!(key = %key, error = %e, "Rejected service delta");
                    PushAck::Nack(e.to_string())
                }
            },
            PushMessage::ServiceBatch(snapshots) => {
                let total = snapshots.len();
                let failures: Vec<String> = snapshots
                    .into_iter()
                    .filter_map(|snapshot| {
                        let key = snapshot.key.clone();
                        self.apply_snapshot(&key, snapshot)
                            .err()
                            .map(|e| format!("{}: {}", key, e))
                    })
                    .collect();
                if failures.is_empty() {
                    PushAck::Ack
                } else {
                    warn!(failed = failures.len(), total, "Service batch partially applied");
                    PushAck::Nack(failures.join("; "))
                }
            }
            PushMessage::ServiceKeyChanged { key, change } => {
                let patterns = match change {
                    KeyChange::Added => self.fuzzy.on_service_key_observed(&key),
                    KeyChange::Removed => self.fuzzy.on_service_key_removed(&key),
                };
                for pattern in &patterns {
                    self.fuzzy.notify(pattern, &key, change);
                }
                debug!(key = %key, ?change, patterns = patterns.len(), "Service key changed");
                PushAck::Ack
            }
            PushMessage::FuzzyWatchSync { pattern, keys } => {
                self.apply_pattern_sync(&pattern, &keys);
                PushAck::Ack
            }
        }
    }

    /// Reconcile a full snapshot. A stale snapshot is dropped silently.
    fn apply_snapshot(&self, key: &ServiceKey, snapshot: ServiceSnapshot) -> Result<()> {
        match self.reconciler.reconcile(key, snapshot) {
            Ok(reconciled) => {
                self.after_reconcile(key, reconciled);
                Ok(())
            }
            Err(NamingError::Stale { .. }) => Ok(()),
            Err(e) => {
                warn!(key = %key, error = %e, "Rejected service snapshot");
                Err(e)
            }
        }
    }

    fn after_reconcile(&self, key: &ServiceKey, reconciled: Reconciled) {
        for pattern in self.fuzzy.on_service_key_observed(key) {
            self.fuzzy.notify(&pattern, key, KeyChange::Added);
        }
        if !reconciled.diff.is_changed {
            return;
        }
        let event = ServiceChangeEvent {
            key: key.clone(),
            snapshot: reconciled.snapshot,
            diff: reconciled.diff,
        };
        let delivered = self.subscriptions.notify(key, event);
        debug!(key = %key, delivered, "Service change delivered");
    }

    fn apply_pattern_sync(&self, pattern: &FuzzyWatchPattern, keys: &[ServiceKey]) {
        if !self.fuzzy.is_watched(pattern) {
            debug!(pattern = %pattern, "Sync for unwatched pattern ignored");
            return;
        }
        let sync = self.fuzzy.sync_pattern(pattern, keys);
        for key in &sync.added {
            self.fuzzy.notify(pattern, key, KeyChange::Added);
        }
        for key in &sync.removed {
            self.fuzzy.notify(pattern, key, KeyChange::Removed);
        }
        if !sync.added.is_empty() || !sync.removed.is_empty() {
            info!(
                pattern = %pattern,
                added = sync.added.len(),
                removed = sync.removed.len(),
                "Fuzzy pattern synced"
            );
        }
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    async fn redo_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let interval = self.config.redo_delay();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Some(epoch) = self.redo.current_epoch() {
                        self.redo.redo_pending(self.as_ref(), epoch).await;
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        debug!("Redo loop stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn fetch_loop(
        self: Arc<Self>,
        mut fetch_rx: mpsc::UnboundedReceiver<ServiceKey>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                key = fetch_rx.recv() => match key {
                    Some(key) => self.fetch(key).await,
                    None => break,
                },
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Fetch loop stopped");
    }

    /// Query `key` once. Falls back to the local backup while disconnected.
    pub async fn fetch(&self, key: ServiceKey) {
        let Some(epoch) = self.redo.current_epoch() else {
            self.seed_from_backup(&key);
            return;
        };

        match self.send(epoch, Request::QueryService { key: key.clone() }).await {
            Ok(Response::Service(snapshot)) => {
                if self.redo.current_epoch() != Some(epoch) {
                    debug!(key = %key, epoch, "Dropping query result from old connection");
                    return;
                }
                let _ = self.apply_snapshot(&key, snapshot);
            }
            Ok(other) => warn!(key = %key, ?other, "Unexpected query response"),
            Err(e) => {
                warn!(key = %key, error = %e, "Service query failed");
                self.seed_from_backup(&key);
            }
        }
    }

    /// Install a provisional snapshot from backup if nothing is cached.
    fn seed_from_backup(&self, key: &ServiceKey) {
        if self.cache.contains(key) {
            return;
        }
        let Some(snapshot) = self.cache.load_from_local_backup(key) else {
            return;
        };
        let diff = self.cache.update(key, snapshot);
        if let Some(snapshot) = self.cache.get(key) {
            info!(key = %key, instances = snapshot.instances.len(), "Serving instances from local backup");
            self.subscriptions.notify(
                key,
                ServiceChangeEvent {
                    key: key.clone(),
                    snapshot,
                    diff,
                },
            );
        }
    }

    async fn backup_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let interval = self.config.backup_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.flush_backup().await;
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Persist every snapshot changed since the last flush. Returns the
    /// number written.
    pub async fn flush_backup(&self) -> usize {
        let snapshots: Vec<Arc<ServiceSnapshot>> = self
            .reconciler
            .take_dirty()
            .iter()
            .filter_map(|key| self.cache.get(key))
            .collect();
        if snapshots.is_empty() {
            return 0;
        }

        let cache = self.cache.clone();
        let written = tokio::task::spawn_blocking(move || {
            for snapshot in &snapshots {
                cache.persist_to_local_backup(&snapshot.key, snapshot);
            }
            snapshots.len()
        })
        .await;

        match written {
            Ok(count) => {
                debug!(count, "Flushed snapshots to local backup");
                count
            }
            Err(e) => {
                error!(error = %e, "Backup flush task failed");
                0
            }
        }
    }

    /// Re-send watch requests for patterns the server has not confirmed.
    /// A full pass re-confirms every pattern.
    pub async fn sync_fuzzy_patterns(&self, full: bool) {
        if full {
            self.fuzzy.reset_consistency();
        }
        let unsynced = self.fuzzy.unsynced_patterns();
        if unsynced.is_empty() {
            return;
        }

        let mut queued = 0;
        for (pattern, _) in unsynced {
            if self.fuzzy.is_over_limit(&pattern) {
                continue;
            }
            let key = RedoKey::FuzzyWatch(pattern);
            if let Some(task) = self.redo.get(&key) {
                // Rejected watches wait for the caller to watch again.
                let busy = task.state() == RedoState::Registering;
                if !task.retryable || task.is_removing() || busy {
                    continue;
                }
            }
            self.redo.add_or_update(key, RedoPayload::FuzzyWatch);
            queued += 1;
        }

        if queued > 0 {
            debug!(queued, full, "Fuzzy patterns queued for sync");
            if let Some(epoch) = self.redo.current_epoch() {
                self.redo.redo_pending(self, epoch).await;
            }
        }
    }
}

#[async_trait]
impl RedoExecutor for ConnectionCoordinator {
    async fn execute(&self, work: &RedoWork) -> Result<()> {
        let request = self.request_for(work)?;
        debug!(key = %work.key, kind = request.kind(), epoch = work.epoch, "Sending redo request");

        let response = match self.send(work.epoch, request).await {
            Ok(response) => response,
            Err(NamingError::ServerRejected { code, message }) => {
                if let (RedoKey::FuzzyWatch(pattern), RedoAction::Register) = (&work.key, work.action) {
                    if is_over_limit_code(code) {
                        warn!(pattern = %pattern, code, "Fuzzy watch refused, over limit");
                        self.fuzzy.notify_over_limit(pattern);
                    }
                }
                return Err(NamingError::ServerRejected { code, message });
            }
            Err(e) => return Err(e),
        };

        let live = self.redo.current_epoch() == Some(work.epoch);
        match (&work.key, response) {
            (RedoKey::Subscriber(key), Response::Service(snapshot)) if live => {
                let _ = self.apply_snapshot(key, snapshot);
            }
            (RedoKey::FuzzyWatch(pattern), Response::FuzzyWatch { matched }) if live => {
                self.apply_pattern_sync(pattern, &matched);
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for ConnectionCoordinator {
    async fn on_push(&self, push: PushMessage) -> PushAck {
        self.handle_push(push).await
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        self.handle_connection_event(event).await;
    }
}
