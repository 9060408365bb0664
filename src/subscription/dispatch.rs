//! Listener invocation.
//!
//! Inline listeners run on the notifying task. Queued listeners get one
//! sequential queue each, drained by a dedicated tokio task, so a slow
//! listener only delays its own events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{ServiceChangeEvent, ServiceListener};

/// How a listener wants to be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Called directly on the task that applied the change.
    #[default]
    Inline,
    /// Called from the listener's own sequential queue.
    Queued,
}

/// Run a listener callback, containing any panic.
///
/// Returns false if the callback panicked.
pub fn call_guarded<F: FnOnce()>(listener: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            error!(listener = %listener, "Listener panicked");
            false
        }
    }
}

/// Identity of a listener: the address of its shared allocation.
pub(crate) fn listener_id(listener: &Arc<dyn ServiceListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

struct ListenerQueue {
    tx: mpsc::UnboundedSender<Arc<ServiceChangeEvent>>,
    refs: usize,
}

/// One event queue per queued listener, shared across the keys it
/// subscribes to.
#[derive(Default)]
pub(crate) struct ListenerQueues {
    queues: DashMap<usize, ListenerQueue>,
}

impl ListenerQueues {
    /// Take a reference on the listener's queue, spawning its worker on
    /// first use.
    pub(crate) fn acquire(&self, listener: &Arc<dyn ServiceListener>) {
        let id = listener_id(listener);
        self.queues
            .entry(id)
            .and_modify(|q| q.refs += 1)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(drain(listener.clone(), rx));
                debug!(listener_id = id, "Listener queue started");
                ListenerQueue { tx, refs: 1 }
            });
    }

    /// Drop a reference. The worker exits once the last one is gone and the
    /// queue has drained.
    pub(crate) fn release(&self, listener: &Arc<dyn ServiceListener>) {
        let id = listener_id(listener);
        if let Some(mut q) = self.queues.get_mut(&id) {
            q.refs = q.refs.saturating_sub(1);
        }
        self.queues.remove_if(&id, |_, q| q.refs == 0);
    }

    pub(crate) fn enqueue(
        &self,
        listener: &Arc<dyn ServiceListener>,
        event: Arc<ServiceChangeEvent>,
    ) -> bool {
        match self.queues.get(&listener_id(listener)) {
            Some(q) => q.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        self.queues.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }
}

async fn drain(
    listener: Arc<dyn ServiceListener>,
    mut rx: mpsc::UnboundedReceiver<Arc<ServiceChangeEvent>>,
) {
    while let Some(event) = rx.recv().await {
        call_guarded("queued", || listener.on_event(&event));
    }
}
