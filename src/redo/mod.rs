//! Reconnect recovery ("redo").
//!
//! Every registration, subscription and fuzzy watch the application asks for
//! is recorded here before any request goes out. A task stays `unfinished`
//! until the server acknowledges its current revision on the current
//! connection. Losing the connection marks everything unfinished again, and
//! the next connection replays whatever is unfinished.
//!
//! There is exactly one task per `RedoKey`. At most one request per task is
//! in flight at a time; `try_begin` is the gate.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{NamingError, Result};
use crate::fuzzy::FuzzyWatchPattern;
use crate::model::{InstanceRecord, ServiceKey};
use crate::transport::Epoch;
use crate::utils::retry::{delay_for_attempt, is_retryable, redo_backoff};

/// Upper bound on the delay between attempts for one task.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

// ============================================================================
// Task model
// ============================================================================

/// What a task is about. The operation type is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RedoKey {
    Instance(ServiceKey),
    Subscriber(ServiceKey),
    FuzzyWatch(FuzzyWatchPattern),
}

impl fmt::Display for RedoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedoKey::Instance(key) => write!(f, "instance:{}", key),
            RedoKey::Subscriber(key) => write!(f, "subscriber:{}", key),
            RedoKey::FuzzyWatch(pattern) => write!(f, "fuzzy:{}", pattern),
        }
    }
}

/// Data needed to replay a task.
#[derive(Debug, Clone, PartialEq)]
pub enum RedoPayload {
    Instance(InstanceRecord),
    /// Batch registration; replaces any single registration for the key.
    Instances(Vec<InstanceRecord>),
    Subscriber,
    FuzzyWatch,
}

/// Observable task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoState {
    /// Wanted on the server, not confirmed on this connection.
    Unregistered,
    /// Register request in flight.
    Registering,
    /// Confirmed by the server for the current revision.
    Registered,
    /// Removal wanted, unregister not yet confirmed.
    Unregistering,
    /// Gone from the table.
    Removed,
}

/// Request the executor must send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoAction {
    Register,
    Unregister,
}

/// One recorded intent.
#[derive(Debug, Clone)]
pub struct RedoTask {
    pub key: RedoKey,
    pub payload: RedoPayload,
    /// True while local intent and server state may differ.
    pub unfinished: bool,
    /// Epoch of the request currently in flight.
    pub in_flight: Option<Epoch>,
    /// The server has acknowledged some revision on the current connection.
    pub acked: bool,
    /// False after a server rejection, until the caller tries again.
    pub retryable: bool,
    /// Bumped on every local change; acks for older revisions do not finish
    /// the task.
    pub revision: u64,
    pub attempts: u32,
    pub next_attempt: Option<Instant>,
    expected_registered: bool,
}

impl RedoTask {
    fn new(key: RedoKey, payload: RedoPayload) -> Self {
        Self {
            key,
            payload,
            unfinished: true,
            in_flight: None,
            acked: false,
            retryable: true,
            revision: 1,
            attempts: 0,
            next_attempt: None,
            expected_registered: true,
        }
    }

    pub fn state(&self) -> RedoState {
        if !self.expected_registered {
            RedoState::Unregistering
        } else if self.in_flight.is_some() {
            RedoState::Registering
        } else if self.unfinished {
            RedoState::Unregistered
        } else {
            RedoState::Registered
        }
    }

    /// Wants to be removed from the server.
    pub fn is_removing(&self) -> bool {
        !self.expected_registered
    }

    fn reset_retry(&mut self) {
        self.retryable = true;
        self.attempts = 0;
        self.next_attempt = None;
    }
}

/// Work handed out by `try_begin`.
#[derive(Debug, Clone, PartialEq)]
pub struct RedoWork {
    pub key: RedoKey,
    pub action: RedoAction,
    pub payload: RedoPayload,
    pub revision: u64,
    pub epoch: Epoch,
}

/// What `mark_removing` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalAction {
    /// Never reached the server; removed locally.
    Dropped,
    /// Needs an unregister request; removed once acknowledged.
    SendUnregister,
    /// No such task.
    NotFound,
}

/// What `retain_batch` did to a batch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRetain {
    /// Some instances were dropped; the rest wait to be re-registered.
    Retained { remaining: usize },
    /// Nothing in the batch matched; the task is untouched.
    Unchanged,
    /// Nothing would remain; the task is untouched and should be removed.
    Emptied,
    /// No batch registration for the key.
    NotBatch,
}

/// Sends the request for a piece of redo work.
#[async_trait]
pub trait RedoExecutor: Send + Sync {
    async fn execute(&self, work: &RedoWork) -> Result<()>;
}

// ============================================================================
// Service
// ============================================================================

/// Concurrent task table plus connection bookkeeping.
pub struct RedoService {
    tasks: DashMap<RedoKey, RedoTask>,
    epoch: AtomicU64,
    connected: AtomicBool,
    concurrency: usize,
    retry_base: Duration,
}

impl RedoService {
    pub fn new(concurrency: usize, retry_base: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            epoch: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            concurrency: concurrency.max(1),
            retry_base,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.is_connected().then(|| self.epoch.load(Ordering::SeqCst))
    }

    /// Record or overwrite the intent for `key`.
    ///
    /// Leaves the task unfinished. A new payload, or a task that was finished
    /// or being removed, gets a new revision, so an ack for an earlier
    /// request cannot finish it.
    pub fn add_or_update(&self, key: RedoKey, payload: RedoPayload) -> u64 {
        let mut task = self
            .tasks
            .entry(key.clone())
            .or_insert_with(|| RedoTask::new(key.clone(), payload.clone()));
        if task.payload != payload || !task.expected_registered || !task.unfinished {
            task.revision += 1;
        }
        task.payload = payload;
        task.expected_registered = true;
        task.unfinished = true;
        task.reset_retry();
        debug!(key = %key, revision = task.revision, "Redo task recorded");
        task.revision
    }

    /// Keep only the batch instances for which `keep` holds.
    ///
    /// Runs under the task's entry lock, so concurrent calls for the same
    /// key each see the result of the previous one.
    pub fn retain_batch<F>(&self, key: &RedoKey, keep: F) -> BatchRetain
    where
        F: Fn(&InstanceRecord) -> bool,
    {
        let Some(mut task) = self.tasks.get_mut(key) else {
            return BatchRetain::NotBatch;
        };
        if !task.expected_registered {
            return BatchRetain::NotBatch;
        }
        let RedoPayload::Instances(batch) = &task.payload else {
            return BatchRetain::NotBatch;
        };

        let retained: Vec<InstanceRecord> = batch.iter().filter(|i| keep(i)).cloned().collect();
        if retained.len() == batch.len() {
            return BatchRetain::Unchanged;
        }
        if retained.is_empty() {
            return BatchRetain::Emptied;
        }

        let remaining = retained.len();
        task.payload = RedoPayload::Instances(retained);
        task.revision += 1;
        task.unfinished = true;
        task.reset_retry();
        debug!(key = %key, remaining, revision = task.revision, "Redo batch narrowed");
        BatchRetain::Retained { remaining }
    }

    /// Flip a task toward removal.
    pub fn mark_removing(&self, key: &RedoKey) -> RemovalAction {
        let dropped = self
            .tasks
            .remove_if(key, |_, t| !t.acked && t.in_flight.is_none());
        if dropped.is_some() {
            debug!(key = %key, "Redo task dropped before reaching server");
            return RemovalAction::Dropped;
        }

        match self.tasks.get_mut(key) {
            Some(mut task) => {
                task.expected_registered = false;
                task.unfinished = true;
                task.revision += 1;
                task.reset_retry();
                debug!(key = %key, "Redo task marked for removal");
                RemovalAction::SendUnregister
            }
            None => RemovalAction::NotFound,
        }
    }

    /// Claim the task for one request on `epoch`.
    ///
    /// Returns None when the task is finished, already in flight, parked
    /// after a rejection, waiting out its backoff, or `epoch` is not the
    /// live connection.
    pub fn try_begin(&self, key: &RedoKey, epoch: Epoch) -> Option<RedoWork> {
        if self.current_epoch() != Some(epoch) {
            return None;
        }

        let mut task = self.tasks.get_mut(key)?;
        if !task.unfinished || task.in_flight.is_some() || !task.retryable {
            return None;
        }
        if let Some(at) = task.next_attempt {
            if Instant::now() < at {
                return None;
            }
        }

        let action = if task.expected_registered {
            RedoAction::Register
        } else {
            RedoAction::Unregister
        };
        task.in_flight = Some(epoch);
        task.attempts += 1;

        Some(RedoWork {
            key: key.clone(),
            action,
            payload: task.payload.clone(),
            revision: task.revision,
            epoch,
        })
    }

    /// Apply the outcome of `work`. Returns the resulting state.
    ///
    /// Outcomes from a superseded connection are discarded.
    pub fn complete(&self, work: &RedoWork, outcome: Result<()>) -> RedoState {
        let live = self.current_epoch() == Some(work.epoch);

        let Some(mut task) = self.tasks.get_mut(&work.key) else {
            return RedoState::Removed;
        };
        if task.in_flight == Some(work.epoch) {
            task.in_flight = None;
        }
        if !live {
            debug!(
                key = %work.key,
                epoch = work.epoch,
                "Discarding redo result from old connection"
            );
            return task.state();
        }

        match outcome {
            Ok(()) => {
                let current_revision = task.revision == work.revision;
                match work.action {
                    RedoAction::Register => {
                        task.acked = true;
                        if current_revision {
                            task.unfinished = false;
                            task.attempts = 0;
                            task.next_attempt = None;
                        }
                    }
                    RedoAction::Unregister => {
                        task.acked = false;
                        if current_revision {
                            drop(task);
                            self.tasks.remove_if(&work.key, |_, t| {
                                t.revision == work.revision && !t.expected_registered
                            });
                            info!(key = %work.key, "Redo task removed after unregister");
                            return RedoState::Removed;
                        }
                    }
                }
            }
            Err(e) if is_retryable(&e) => {
                let delay = delay_for_attempt(
                    redo_backoff(self.retry_base),
                    task.attempts,
                    MAX_RETRY_DELAY,
                );
                task.next_attempt = Some(Instant::now() + delay);
                warn!(
                    key = %work.key,
                    attempts = task.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redo request failed, will retry"
                );
            }
            Err(e @ NamingError::ServerRejected { .. }) => {
                task.retryable = false;
                warn!(
                    key = %work.key,
                    error = %e,
                    "Redo request rejected, parked until next call"
                );
            }
            Err(e) => {
                task.retryable = false;
                warn!(key = %work.key, error = %e, "Redo request failed permanently");
            }
        }
        task.state()
    }

    /// A new connection is live. Pending tasks become eligible immediately.
    pub fn on_connection_established(&self, epoch: Epoch) {
        self.epoch.store(epoch, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        for mut task in self.tasks.iter_mut() {
            if task.in_flight.is_some_and(|e| e != epoch) {
                task.in_flight = None;
            }
            task.next_attempt = None;
            task.attempts = 0;
        }
        info!(epoch, tasks = self.tasks.len(), "Redo connection established");
    }

    /// The connection is gone. Assume the server forgot everything.
    ///
    /// Registered tasks become unfinished. Tasks waiting for an unregister
    /// are dropped, since the server has nothing left to remove.
    pub fn on_connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut dropped = 0;
        self.tasks.retain(|_, task| {
            if !task.expected_registered {
                dropped += 1;
                return false;
            }
            task.in_flight = None;
            task.acked = false;
            task.unfinished = true;
            task.next_attempt = None;
            true
        });
        info!(
            tasks = self.tasks.len(),
            dropped,
            "Redo connection lost, tasks marked unfinished"
        );
    }

    /// Replay every eligible unfinished task on `epoch` with bounded
    /// concurrency. Returns the number of requests sent.
    pub async fn redo_pending(&self, executor: &dyn RedoExecutor, epoch: Epoch) -> usize {
        let keys: Vec<RedoKey> = self
            .tasks
            .iter()
            .filter(|t| t.unfinished && t.in_flight.is_none() && t.retryable)
            .map(|t| t.key().clone())
            .collect();
        if keys.is_empty() {
            return 0;
        }

        let sent = AtomicU64::new(0);
        stream::iter(keys)
            .for_each_concurrent(self.concurrency, |key| {
                let sent = &sent;
                async move {
                    if let Some(work) = self.try_begin(&key, epoch) {
                        sent.fetch_add(1, Ordering::SeqCst);
                        let outcome = executor.execute(&work).await;
                        self.complete(&work, outcome);
                    }
                }
            })
            .await;

        let sent = sent.load(Ordering::SeqCst) as usize;
        if sent > 0 {
            debug!(epoch, sent, "Redo pass finished");
        }
        sent
    }

    pub fn get(&self, key: &RedoKey) -> Option<RedoTask> {
        self.tasks.get(key).map(|t| t.clone())
    }

    pub fn state(&self, key: &RedoKey) -> RedoState {
        self.tasks
            .get(key)
            .map(|t| t.state())
            .unwrap_or(RedoState::Removed)
    }

    /// Confirmed by the server and still wanted.
    pub fn is_registered(&self, key: &RedoKey) -> bool {
        self.state(key) == RedoState::Registered
    }

    pub fn contains(&self, key: &RedoKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Copy of every task, for inspection.
    pub fn snapshot(&self) -> Vec<RedoTask> {
        let mut tasks: Vec<RedoTask> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn unfinished_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.unfinished).count()
    }

    /// Forget every task.
    pub fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tasks.clear();
        info!("Redo service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<RedoWork>>,
        fail_with: Mutex<Option<NamingError>>,
        delay: Option<Duration>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl RedoExecutor for RecordingExecutor {
        async fn execute(&self, work: &RedoWork) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.calls.lock().push(work.clone());
            match self.fail_with.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn instance_key() -> RedoKey {
        RedoKey::Instance(ServiceKey::simple("s1"))
    }

    fn instance_a() -> RedoPayload {
        RedoPayload::Instance(InstanceRecord::new("1.1.1.1", 8888).with_weight(1.0))
    }

    fn service() -> RedoService {
        RedoService::new(4, Duration::from_secs(3))
    }

    #[test]
    fn test_add_or_update_overwrites_single_row() {
        let redo = service();
        redo.add_or_update(instance_key(), instance_a());
        let latest = RedoPayload::Instance(InstanceRecord::new("1.1.1.1", 9999));
        redo.add_or_update(instance_key(), latest.clone());

        assert_eq!(redo.len(), 1);
        let task = redo.get(&instance_key()).unwrap();
        assert_eq!(task.payload, latest);
        assert!(task.unfinished);
        assert_eq!(task.state(), RedoState::Unregistered);
    }

    #[test]
    fn test_try_begin_is_single_flight() {
        let redo = service();
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());

        let work = redo.try_begin(&instance_key(), 1).unwrap();
        assert_eq!(work.action, RedoAction::Register);
        assert!(redo.try_begin(&instance_key(), 1).is_none());
        assert_eq!(redo.state(&instance_key()), RedoState::Registering);

        assert_eq!(redo.complete(&work, Ok(())), RedoState::Registered);
        assert!(redo.try_begin(&instance_key(), 1).is_none());
    }

    #[test]
    fn test_try_begin_requires_live_epoch() {
        let redo = service();
        redo.add_or_update(instance_key(), instance_a());
        assert!(redo.try_begin(&instance_key(), 1).is_none());

        redo.on_connection_established(2);
        assert!(redo.try_begin(&instance_key(), 1).is_none());
        assert!(redo.try_begin(&instance_key(), 2).is_some());
    }

    #[tokio::test]
    async fn test_disconnect_reconnect_replays_exactly_once() {
        let redo = service();
        let executor = RecordingExecutor::default();
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());
        assert_eq!(redo.redo_pending(&executor, 1).await, 1);
        assert!(redo.is_registered(&instance_key()));

        redo.on_connection_lost();
        assert!(redo.get(&instance_key()).unwrap().unfinished);

        redo.on_connection_established(2);
        assert_eq!(redo.redo_pending(&executor, 2).await, 1);
        // Nothing left to do.
        assert_eq!(redo.redo_pending(&executor, 2).await, 0);

        let calls = executor.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].epoch, 2);
        assert_eq!(calls[1].payload, instance_a());
        assert!(!redo.get(&instance_key()).unwrap().unfinished);
    }

    #[test]
    fn test_result_from_superseded_epoch_is_discarded() {
        let redo = service();
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());
        let work = redo.try_begin(&instance_key(), 1).unwrap();

        redo.on_connection_lost();
        redo.on_connection_established(2);
        redo.complete(&work, Ok(()));

        let task = redo.get(&instance_key()).unwrap();
        assert!(task.unfinished);
        assert!(!task.acked);
        assert!(redo.try_begin(&instance_key(), 2).is_some());
    }

    #[test]
    fn test_update_during_flight_keeps_task_unfinished() {
        let redo = service();
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());
        let work = redo.try_begin(&instance_key(), 1).unwrap();

        let newer = RedoPayload::Instance(InstanceRecord::new("1.1.1.1", 8888).with_weight(5.0));
        redo.add_or_update(instance_key(), newer.clone());
        redo.complete(&work, Ok(()));

        let task = redo.get(&instance_key()).unwrap();
        assert!(task.unfinished);
        assert!(task.acked);
        let again = redo.try_begin(&instance_key(), 1).unwrap();
        assert_eq!(again.payload, newer);
    }

    #[test]
    fn test_mark_removing_never_acked_drops_locally() {
        let redo = service();
        redo.add_or_update(instance_key(), instance_a());
        assert_eq!(redo.mark_removing(&instance_key()), RemovalAction::Dropped);
        assert!(redo.is_empty());
        assert_eq!(redo.mark_removing(&instance_key()), RemovalAction::NotFound);
    }

    #[tokio::test]
    async fn test_mark_removing_acked_sends_unregister() {
        let redo = service();
        let executor = RecordingExecutor::default();
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());
        redo.redo_pending(&executor, 1).await;

        assert_eq!(redo.mark_removing(&instance_key()), RemovalAction::SendUnregister);
        assert_eq!(redo.state(&instance_key()), RedoState::Unregistering);
        redo.redo_pending(&executor, 1).await;

        assert_eq!(executor.calls.lock()[1].action, RedoAction::Unregister);
        assert!(!redo.contains(&instance_key()));
    }

    fn batch_of(ips: &[&str]) -> RedoPayload {
        RedoPayload::Instances(ips.iter().map(|ip| InstanceRecord::new(*ip, 8888)).collect())
    }

    #[test]
    fn test_retain_batch_narrows_and_bumps_revision() {
        let redo = service();
        redo.add_or_update(instance_key(), batch_of(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));
        let before = redo.get(&instance_key()).unwrap().revision;

        let outcome = redo.retain_batch(&instance_key(), |i| i.ip != "1.1.1.1");
        assert_eq!(outcome, BatchRetain::Retained { remaining: 2 });
        let task = redo.get(&instance_key()).unwrap();
        assert_eq!(task.payload, batch_of(&["2.2.2.2", "3.3.3.3"]));
        assert_eq!(task.revision, before + 1);
    }

    #[test]
    fn test_retain_batch_unmatched_leaves_task_alone() {
        let redo = service();
        redo.add_or_update(instance_key(), batch_of(&["1.1.1.1", "2.2.2.2"]));
        let before = redo.get(&instance_key()).unwrap();

        let outcome = redo.retain_batch(&instance_key(), |i| i.ip != "9.9.9.9");
        assert_eq!(outcome, BatchRetain::Unchanged);
        let after = redo.get(&instance_key()).unwrap();
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.revision, before.revision);

        assert_eq!(redo.retain_batch(&instance_key(), |_| false), BatchRetain::Emptied);
        assert!(redo.contains(&instance_key()));
        redo.add_or_update(instance_key(), instance_a());
        assert_eq!(redo.retain_batch(&instance_key(), |_| false), BatchRetain::NotBatch);
    }

    #[test]
    fn test_concurrent_retain_batch_loses_no_removal() {
        let redo = Arc::new(service());
        let ips: Vec<String> = (0..16).map(|i| format!("10.0.0.{}", i)).collect();
        let refs: Vec<&str> = ips.iter().map(String::as_str).collect();
        redo.add_or_update(instance_key(), batch_of(&refs));

        let handles: Vec<_> = ips
            .iter()
            .take(8)
            .cloned()
            .map(|ip| {
                let redo = redo.clone();
                std::thread::spawn(move || redo.retain_batch(&instance_key(), |i| i.ip != ip))
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.join().unwrap(), BatchRetain::Retained { .. }));
        }

        let RedoPayload::Instances(left) = redo.get(&instance_key()).unwrap().payload else {
            panic!("expected batch payload");
        };
        let mut left: Vec<String> = left.into_iter().map(|i| i.ip).collect();
        left.sort();
        let mut expected: Vec<String> = ips[8..].to_vec();
        expected.sort();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn test_unregistering_dropped_on_disconnect() {
        let redo = service();
        let executor = RecordingExecutor::default();
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());
        redo.redo_pending(&executor, 1).await;
        redo.mark_removing(&instance_key());

        redo.on_connection_lost();
        assert!(!redo.contains(&instance_key()));
    }

    #[tokio::test]
    async fn test_server_rejection_parks_until_next_call() {
        let redo = service();
        let executor = RecordingExecutor::default();
        *executor.fail_with.lock() = Some(NamingError::ServerRejected {
            code: 429,
            message: "quota".into(),
        });
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());

        assert_eq!(redo.redo_pending(&executor, 1).await, 1);
        assert!(!redo.get(&instance_key()).unwrap().retryable);
        assert_eq!(redo.redo_pending(&executor, 1).await, 0);

        *executor.fail_with.lock() = None;
        redo.add_or_update(instance_key(), instance_a());
        assert_eq!(redo.redo_pending(&executor, 1).await, 1);
        assert!(redo.is_registered(&instance_key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_backs_off() {
        let redo = service();
        let executor = RecordingExecutor::default();
        *executor.fail_with.lock() = Some(NamingError::Connection("reset".into()));
        redo.on_connection_established(1);
        redo.add_or_update(instance_key(), instance_a());

        assert_eq!(redo.redo_pending(&executor, 1).await, 1);
        // Still inside the backoff window.
        assert_eq!(redo.redo_pending(&executor, 1).await, 0);

        tokio::time::advance(Duration::from_secs(7)).await;
        *executor.fail_with.lock() = None;
        assert_eq!(redo.redo_pending(&executor, 1).await, 1);
        assert!(redo.is_registered(&instance_key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redo_concurrency_is_bounded() {
        let redo = RedoService::new(2, Duration::from_secs(3));
        let executor = Arc::new(RecordingExecutor {
            delay: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        redo.on_connection_established(1);
        for i in 0..6 {
            redo.add_or_update(
                RedoKey::Subscriber(ServiceKey::simple(format!("s{}", i))),
                RedoPayload::Subscriber,
            );
        }

        assert_eq!(redo.redo_pending(executor.as_ref(), 1).await, 6);
        assert_eq!(executor.max_running.load(Ordering::SeqCst), 2);
        assert_eq!(redo.unfinished_count(), 0);
    }

    #[test]
    fn test_snapshot_and_shutdown() {
        let redo = service();
        redo.add_or_update(instance_key(), instance_a());
        redo.add_or_update(
            RedoKey::FuzzyWatch(FuzzyWatchPattern::in_default_namespace("g", "*")),
            RedoPayload::FuzzyWatch,
        );
        assert_eq!(redo.snapshot().len(), 2);

        redo.shutdown();
        assert!(redo.is_empty());
        assert!(!redo.is_connected());
    }
}
