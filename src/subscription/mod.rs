//! Service subscriptions and listener fan-out.
//!
//! The registry is a multimap from service key to listeners. Subscribing to
//! a key the cache knows nothing about sends the key on the fetch channel so
//! the coordinator can query it immediately instead of waiting for a push.

pub mod dispatch;

pub use dispatch::{call_guarded, Dispatch};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::reconciler::InstanceDiff;
use crate::cache::ServiceInfoCache;
use crate::model::{InstanceRecord, ServiceKey, ServiceSnapshot};
use dispatch::{listener_id, ListenerQueues};

/// Change notification for a subscribed service.
#[derive(Debug, Clone)]
pub struct ServiceChangeEvent {
    pub key: ServiceKey,
    pub snapshot: Arc<ServiceSnapshot>,
    pub diff: InstanceDiff,
}

impl ServiceChangeEvent {
    pub fn instances(&self) -> &[InstanceRecord] {
        &self.snapshot.instances
    }
}

/// Receives change events for the keys it is subscribed to.
pub trait ServiceListener: Send + Sync + 'static {
    fn on_event(&self, event: &ServiceChangeEvent);

    fn dispatch(&self) -> Dispatch {
        Dispatch::Inline
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// First listener on this key.
    pub first_listener: bool,
    /// The listener was already attached; nothing changed.
    pub duplicate: bool,
    /// No snapshot was cached and an on-demand fetch was requested.
    pub fetch_requested: bool,
}

/// Tracks which keys the process cares about and who to tell.
pub struct SubscriptionRegistry {
    listeners: DashMap<ServiceKey, Vec<Arc<dyn ServiceListener>>>,
    queues: ListenerQueues,
    cache: Arc<ServiceInfoCache>,
    fetch_tx: mpsc::UnboundedSender<ServiceKey>,
}

impl SubscriptionRegistry {
    pub fn new(cache: Arc<ServiceInfoCache>, fetch_tx: mpsc::UnboundedSender<ServiceKey>) -> Self {
        Self {
            listeners: DashMap::new(),
            queues: ListenerQueues::default(),
            cache,
            fetch_tx,
        }
    }

    /// Attach `listener` to `key`.
    ///
    /// Queued listeners need a tokio runtime for their worker task.
    pub fn subscribe(&self, key: ServiceKey, listener: Arc<dyn ServiceListener>) -> SubscribeOutcome {
        let id = listener_id(&listener);
        let (first_listener, duplicate) = {
            let mut slot = self.listeners.entry(key.clone()).or_default();
            let first = slot.is_empty();
            if slot.iter().any(|l| listener_id(l) == id) {
                (first, true)
            } else {
                slot.push(listener.clone());
                (first, false)
            }
        };

        if !duplicate && listener.dispatch() == Dispatch::Queued {
            self.queues.acquire(&listener);
        }

        let fetch_requested = if self.cache.get(&key).is_none() {
            if self.fetch_tx.send(key.clone()).is_err() {
                warn!(key = %key, "Fetch channel closed, skipping on-demand fetch");
                false
            } else {
                true
            }
        } else {
            false
        };

        debug!(
            key = %key,
            first_listener,
            duplicate,
            fetch_requested,
            "Listener subscribed"
        );

        SubscribeOutcome {
            first_listener,
            duplicate,
            fetch_requested,
        }
    }

    /// Detach `listener` from `key`. Returns true when the key has no
    /// listeners left.
    pub fn unsubscribe(&self, key: &ServiceKey, listener: &Arc<dyn ServiceListener>) -> bool {
        let id = listener_id(listener);
        let (removed, now_empty) = match self.listeners.get_mut(key) {
            Some(mut slot) => {
                let before = slot.len();
                slot.retain(|l| listener_id(l) != id);
                (slot.len() != before, slot.is_empty())
            }
            None => return false,
        };

        if removed && listener.dispatch() == Dispatch::Queued {
            self.queues.release(listener);
        }
        if now_empty {
            self.listeners.remove_if(key, |_, slot| slot.is_empty());
            debug!(key = %key, "Last listener removed");
        }
        now_empty
    }

    pub fn is_subscribed(&self, key: &ServiceKey) -> bool {
        self.listeners
            .get(key)
            .map(|slot| !slot.is_empty())
            .unwrap_or(false)
    }

    pub fn subscribed_keys(&self) -> Vec<ServiceKey> {
        self.listeners
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn listener_count(&self, key: &ServiceKey) -> usize {
        self.listeners.get(key).map(|slot| slot.len()).unwrap_or(0)
    }

    /// Deliver `event` to every listener of `key`. Returns the number of
    /// listeners reached.
    pub fn notify(&self, key: &ServiceKey, event: ServiceChangeEvent) -> usize {
        let listeners: Vec<Arc<dyn ServiceListener>> = match self.listeners.get(key) {
            Some(slot) => slot.clone(),
            None => return 0,
        };
        let event = Arc::new(event);

        let mut delivered = 0;
        for listener in listeners {
            let ok = match listener.dispatch() {
                Dispatch::Inline => call_guarded("inline", || listener.on_event(&event)),
                Dispatch::Queued => self.queues.enqueue(&listener, event.clone()),
            };
            if ok {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop all subscriptions and stop queued listener workers.
    pub fn clear(&self) {
        self.listeners.clear();
        self.queues.clear();
    }
}
