//! In-memory transport for testing.
//!
//! Records every request that reaches a live connection, serves canned
//! service snapshots, and lets tests drop and restore the connection or
//! inject pushes through the registered inbound handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ConnectionEvent, Epoch, InboundHandler, NamingTransport, PushAck, PushMessage, Request,
    Response, TransportError,
};
use crate::fuzzy::FuzzyWatchPattern;
use crate::model::{ServiceKey, ServiceSnapshot};

/// Mock transport for testing.
#[derive(Default)]
pub struct MockTransport {
    epoch: AtomicU64,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_requests: AtomicBool,
    reject: Mutex<Option<(i32, String)>>,
    request_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<(Epoch, Request)>>,
    services: Mutex<HashMap<ServiceKey, ServiceSnapshot>>,
    fuzzy_matches: Mutex<HashMap<FuzzyWatchPattern, Vec<ServiceKey>>>,
    inbound: Mutex<Option<Weak<dyn InboundHandler>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `connect()` fail until cleared.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make requests fail with a connection error until cleared.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Make requests fail with a server rejection until cleared.
    pub fn set_reject(&self, reject: Option<(i32, String)>) {
        *self.reject.lock() = reject;
    }

    /// Delay every request by `delay`.
    pub fn set_request_delay(&self, delay: Option<Duration>) {
        *self.request_delay.lock() = delay;
    }

    /// Serve `snapshot` for subscribe and query requests on its key.
    pub fn set_service(&self, snapshot: ServiceSnapshot) {
        self.services.lock().insert(snapshot.key.clone(), snapshot);
    }

    /// Serve `keys` as the server-side match set for `pattern`.
    pub fn set_fuzzy_matches(&self, pattern: FuzzyWatchPattern, keys: Vec<ServiceKey>) {
        self.fuzzy_matches.lock().insert(pattern, keys);
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<(Epoch, Request)> {
        self.requests.lock().clone()
    }

    /// Drain recorded requests.
    pub fn take_requests(&self) -> Vec<(Epoch, Request)> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Number of recorded requests of the given kind.
    pub fn request_count(&self, kind: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|(_, r)| r.kind() == kind)
            .count()
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.inbound.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Drop the current connection and notify the inbound handler.
    pub async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let epoch = self.current_epoch();
        if let Some(handler) = self.handler() {
            handler
                .on_connection_event(ConnectionEvent::Disconnected(epoch))
                .await;
        }
    }

    /// Open a new connection on the transport's own initiative and notify
    /// the inbound handler.
    pub async fn restore_connection(&self) -> Epoch {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        if let Some(handler) = self.handler() {
            handler
                .on_connection_event(ConnectionEvent::Connected(epoch))
                .await;
        }
        epoch
    }

    /// Open a new connection without telling the inbound handler, as when
    /// the connect event is still on its way.
    pub fn advance_epoch(&self) -> Epoch {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        epoch
    }

    /// Deliver a push to the inbound handler.
    pub async fn push(&self, message: PushMessage) -> PushAck {
        match self.handler() {
            Some(handler) => handler.on_push(message).await,
            None => PushAck::Nack("no inbound handler".to_string()),
        }
    }
}

#[async_trait]
impl NamingTransport for MockTransport {
    async fn connect(&self) -> Result<Epoch, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "Mock connect failure".to_string(),
            ));
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        Ok(epoch)
    }

    async fn request(&self, epoch: Epoch, request: Request) -> Result<Response, TransportError> {
        if !self.is_connected() || epoch != self.current_epoch() {
            return Err(TransportError::NotConnected);
        }

        let delay = *self.request_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.requests.lock().push((epoch, request.clone()));

        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "Mock request failure".to_string(),
            ));
        }
        if let Some((code, message)) = self.reject.lock().clone() {
            return Err(TransportError::Rejected { code, message });
        }

        let response = match request {
            Request::Subscribe { key } | Request::QueryService { key } => {
                let snapshot = self
                    .services
                    .lock()
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| ServiceSnapshot::empty(key));
                Response::Service(snapshot)
            }
            Request::FuzzyWatch { pattern, .. } => Response::FuzzyWatch {
                matched: self
                    .fuzzy_matches
                    .lock()
                    .get(&pattern)
                    .cloned()
                    .unwrap_or_default(),
            },
            _ => Response::Ack,
        };
        Ok(response)
    }

    fn register_inbound(&self, handler: Weak<dyn InboundHandler>) {
        *self.inbound.lock() = Some(handler);
    }
}
