//! Fuzzy (pattern-based) service watching.
//!
//! The engine tracks every service key the client has seen and every active
//! pattern with its attached watchers. Adding a pattern scans the known keys
//! so watchers catch up on services that already exist; observing a new key
//! reports only the patterns for which it is newly matched.

mod pattern;

pub use pattern::{FuzzyWatchPattern, ANY_PATTERN};

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::ServiceKey;
use crate::subscription::call_guarded;
use crate::transport::KeyChange;

/// Identifier handed out for each attached watcher.
pub type WatcherId = Uuid;

/// Rejection code: the client watches too many patterns.
pub const PATTERN_OVER_LIMIT_CODE: i32 = 50310;
/// Rejection code: the pattern matches too many services.
pub const MATCH_COUNT_OVER_LIMIT_CODE: i32 = 50311;

/// Whether a server rejection means a fuzzy watch limit was hit.
pub fn is_over_limit_code(code: i32) -> bool {
    code == PATTERN_OVER_LIMIT_CODE || code == MATCH_COUNT_OVER_LIMIT_CODE
}

/// A matched service appeared or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyWatchEvent {
    pub pattern: FuzzyWatchPattern,
    pub key: ServiceKey,
    pub change: KeyChange,
}

/// Receives fuzzy watch events. Called on the notifying task.
pub trait FuzzyWatcher: Send + Sync {
    fn on_event(&self, event: &FuzzyWatchEvent);

    /// The server refused the pattern because too many services or patterns
    /// are watched. No further events arrive for it.
    fn on_over_limit(&self, pattern: &FuzzyWatchPattern) {
        warn!(pattern = %pattern, "Fuzzy watch over limit");
    }
}

struct WatcherEntry {
    id: WatcherId,
    watcher: Arc<dyn FuzzyWatcher>,
}

#[derive(Default)]
struct PatternContext {
    watchers: Vec<WatcherEntry>,
    matched: BTreeSet<ServiceKey>,
    consistent_with_server: bool,
    over_limit: bool,
}

/// Result of attaching a watcher.
#[derive(Debug, Clone)]
pub struct AddedPattern {
    pub watcher_id: WatcherId,
    /// Keys already matching the pattern, for catch-up notification.
    pub initial: Vec<ServiceKey>,
    /// The pattern was not watched before this call.
    pub new_pattern: bool,
}

/// Difference applied by a server-side match list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSync {
    pub added: Vec<ServiceKey>,
    pub removed: Vec<ServiceKey>,
}

/// Active patterns, their watchers and the keys they match.
#[derive(Default)]
pub struct FuzzyMatchEngine {
    patterns: DashMap<FuzzyWatchPattern, PatternContext>,
    known: DashSet<ServiceKey>,
}

impl FuzzyMatchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `watcher` to `pattern` and return the keys it already matches.
    pub fn add_pattern(
        &self,
        pattern: FuzzyWatchPattern,
        watcher: Arc<dyn FuzzyWatcher>,
    ) -> AddedPattern {
        let scanned: Vec<ServiceKey> = self
            .known
            .iter()
            .filter(|k| pattern.matches(k.key()))
            .map(|k| k.key().clone())
            .collect();

        let watcher_id = Uuid::new_v4();
        let mut new_pattern = false;
        let mut ctx = self.patterns.entry(pattern.clone()).or_insert_with(|| {
            new_pattern = true;
            PatternContext::default()
        });
        ctx.matched.extend(scanned);
        ctx.watchers.push(WatcherEntry {
            id: watcher_id,
            watcher,
        });
        let initial = ctx.matched.iter().cloned().collect();

        debug!(
            pattern = %pattern,
            watcher_id = %watcher_id,
            new_pattern,
            "Fuzzy watcher attached"
        );

        AddedPattern {
            watcher_id,
            initial,
            new_pattern,
        }
    }

    /// Detach a watcher. Returns true when the pattern has no watchers left
    /// and was dropped.
    pub fn remove_pattern(&self, pattern: &FuzzyWatchPattern, watcher_id: WatcherId) -> bool {
        let now_empty = match self.patterns.get_mut(pattern) {
            Some(mut ctx) => {
                ctx.watchers.retain(|w| w.id != watcher_id);
                ctx.watchers.is_empty()
            }
            None => return false,
        };
        if now_empty {
            self.patterns.remove_if(pattern, |_, ctx| ctx.watchers.is_empty());
            info!(pattern = %pattern, "Fuzzy pattern no longer watched");
        }
        now_empty
    }

    /// Record a key and return the patterns that match it for the first time.
    pub fn on_service_key_observed(&self, key: &ServiceKey) -> Vec<FuzzyWatchPattern> {
        let key = key.without_clusters();
        self.known.insert(key.clone());

        let mut newly_matched = Vec::new();
        for mut entry in self.patterns.iter_mut() {
            if entry.over_limit || !entry.key().matches(&key) {
                continue;
            }
            if entry.matched.insert(key.clone()) {
                newly_matched.push(entry.key().clone());
            }
        }
        newly_matched
    }

    /// Forget a key and return the patterns that had matched it.
    pub fn on_service_key_removed(&self, key: &ServiceKey) -> Vec<FuzzyWatchPattern> {
        let key = key.without_clusters();
        self.known.remove(&key);

        let mut unmatched = Vec::new();
        for mut entry in self.patterns.iter_mut() {
            if entry.matched.remove(&key) {
                unmatched.push(entry.key().clone());
            }
        }
        unmatched
    }

    /// Replace a pattern's match set with the server's list.
    pub fn sync_pattern(&self, pattern: &FuzzyWatchPattern, keys: &[ServiceKey]) -> PatternSync {
        let incoming: BTreeSet<ServiceKey> = keys.iter().map(ServiceKey::without_clusters).collect();
        for key in &incoming {
            self.known.insert(key.clone());
        }

        let Some(mut ctx) = self.patterns.get_mut(pattern) else {
            return PatternSync::default();
        };
        let added = incoming.difference(&ctx.matched).cloned().collect();
        let removed = ctx.matched.difference(&incoming).cloned().collect();
        ctx.matched = incoming;
        ctx.consistent_with_server = true;
        PatternSync { added, removed }
    }

    /// Keys currently matched by `pattern`.
    pub fn matched_keys(&self, pattern: &FuzzyWatchPattern) -> Vec<ServiceKey> {
        self.patterns
            .get(pattern)
            .map(|ctx| ctx.matched.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn watchers(&self, pattern: &FuzzyWatchPattern) -> Vec<Arc<dyn FuzzyWatcher>> {
        self.patterns
            .get(pattern)
            .map(|ctx| ctx.watchers.iter().map(|w| w.watcher.clone()).collect())
            .unwrap_or_default()
    }

    pub fn patterns(&self) -> Vec<FuzzyWatchPattern> {
        self.patterns.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_watched(&self, pattern: &FuzzyWatchPattern) -> bool {
        self.patterns.contains_key(pattern)
    }

    /// Patterns that have not been confirmed by the server since the last
    /// reset, with the keys the client already holds for each.
    pub fn unsynced_patterns(&self) -> Vec<(FuzzyWatchPattern, Vec<ServiceKey>)> {
        self.patterns
            .iter()
            .filter(|e| !e.consistent_with_server && !e.over_limit)
            .map(|e| (e.key().clone(), e.matched.iter().cloned().collect()))
            .collect()
    }

    /// Require every pattern to be confirmed again.
    pub fn reset_consistency(&self) {
        for mut entry in self.patterns.iter_mut() {
            entry.consistent_with_server = false;
        }
    }

    pub fn is_over_limit(&self, pattern: &FuzzyWatchPattern) -> bool {
        self.patterns
            .get(pattern)
            .map(|ctx| ctx.over_limit)
            .unwrap_or(false)
    }

    /// Suppress a pattern the server refused and return its watchers.
    pub fn mark_over_limit(&self, pattern: &FuzzyWatchPattern) -> Vec<Arc<dyn FuzzyWatcher>> {
        match self.patterns.get_mut(pattern) {
            Some(mut ctx) => {
                ctx.over_limit = true;
                ctx.watchers.iter().map(|w| w.watcher.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Deliver an event to every watcher of `pattern`.
    pub fn notify(&self, pattern: &FuzzyWatchPattern, key: &ServiceKey, change: KeyChange) {
        let watchers = self.watchers(pattern);
        if watchers.is_empty() {
            return;
        }
        let event = FuzzyWatchEvent {
            pattern: pattern.clone(),
            key: key.without_clusters(),
            change,
        };
        for watcher in watchers {
            call_guarded("fuzzy_watcher", || watcher.on_event(&event));
        }
    }

    /// Suppress `pattern` and tell its watchers.
    pub fn notify_over_limit(&self, pattern: &FuzzyWatchPattern) {
        for watcher in self.mark_over_limit(pattern) {
            call_guarded("fuzzy_watcher", || watcher.on_over_limit(pattern));
        }
    }

    /// Drop all patterns and known keys.
    pub fn clear(&self) {
        self.patterns.clear();
        self.known.clear();
    }
}

// ============================================================================
// Sync loop
// ============================================================================

/// Single-task ticker that drives pattern re-sync.
///
/// Each tick (or ring of the bell) calls the sync callback once. Every
/// `full_sync_interval` the callback is asked for a full re-sync instead.
/// Rings that arrive while a sync is running collapse into one extra pass.
pub struct FuzzySyncLoop {
    bell: Notify,
    check_interval: Duration,
    full_sync_interval: Duration,
}

impl FuzzySyncLoop {
    pub fn new(check_interval: Duration, full_sync_interval: Duration) -> Self {
        Self {
            bell: Notify::new(),
            check_interval,
            full_sync_interval,
        }
    }

    /// Request a sync pass as soon as possible.
    pub fn ring(&self) {
        self.bell.notify_one();
    }

    /// Run until `cancel` flips to true.
    pub async fn run<F, Fut>(&self, mut sync: F, mut cancel: watch::Receiver<bool>)
    where
        F: FnMut(bool) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut last_full_sync = Instant::now();
        info!(
            check_interval_ms = self.check_interval.as_millis() as u64,
            full_sync_interval_ms = self.full_sync_interval.as_millis() as u64,
            "Fuzzy sync loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = self.bell.notified() => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Fuzzy sync loop stopped");
                        break;
                    }
                    continue;
                }
            }

            let full = last_full_sync.elapsed() >= self.full_sync_interval;
            if full {
                last_full_sync = Instant::now();
            }
            sync(full).await;
        }
    }
}
