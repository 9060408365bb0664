//! Transport collaborator contract.
//!
//! The naming core does not open sockets. It needs a request/response
//! channel tagged with a connection epoch, plus inbound delivery of server
//! pushes and connection state changes. Implementations:
//! - `MockTransport`: in-memory transport for tests and embedding

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;

use crate::fuzzy::FuzzyWatchPattern;
use crate::model::{InstanceRecord, ServiceKey, ServiceSnapshot};

pub mod mock;

pub use mock::MockTransport;

/// Monotonically increasing connection id. Zero means "never connected".
pub type Epoch = u64;

/// Logical connection state published by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(Epoch),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            ConnectionState::Connected(epoch) => Some(*epoch),
            _ => None,
        }
    }
}

/// Connection change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(Epoch),
    Disconnected(Epoch),
}

impl ConnectionEvent {
    pub fn epoch(&self) -> Epoch {
        match self {
            ConnectionEvent::Connected(epoch) | ConnectionEvent::Disconnected(epoch) => *epoch,
        }
    }
}

/// Outbound request to the registry server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    RegisterInstance {
        key: ServiceKey,
        instance: InstanceRecord,
    },
    BatchRegisterInstances {
        key: ServiceKey,
        instances: Vec<InstanceRecord>,
    },
    DeregisterInstance {
        key: ServiceKey,
        instance: InstanceRecord,
    },
    BatchDeregisterInstances {
        key: ServiceKey,
        instances: Vec<InstanceRecord>,
    },
    Subscribe {
        key: ServiceKey,
    },
    Unsubscribe {
        key: ServiceKey,
    },
    QueryService {
        key: ServiceKey,
    },
    FuzzyWatch {
        pattern: FuzzyWatchPattern,
        /// Keys the client already knows for this pattern.
        received: Vec<ServiceKey>,
        initializing: bool,
    },
    CancelFuzzyWatch {
        pattern: FuzzyWatchPattern,
    },
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::RegisterInstance { .. } => "register_instance",
            Request::BatchRegisterInstances { .. } => "batch_register_instances",
            Request::DeregisterInstance { .. } => "deregister_instance",
            Request::BatchDeregisterInstances { .. } => "batch_deregister_instances",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::QueryService { .. } => "query_service",
            Request::FuzzyWatch { .. } => "fuzzy_watch",
            Request::CancelFuzzyWatch { .. } => "cancel_fuzzy_watch",
        }
    }
}

/// Server response to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ack,
    Service(ServiceSnapshot),
    FuzzyWatch { matched: Vec<ServiceKey> },
}

/// Kind of change for a service key reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    Added,
    Removed,
}

/// Server-initiated message.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// Full instance list for a key.
    Service(ServiceSnapshot),
    /// Incremental change applied on top of the cached list.
    ServiceDelta {
        key: ServiceKey,
        revision: u64,
        upserted: Vec<InstanceRecord>,
        /// Identities (`ip:port:cluster`) of removed instances.
        removed: Vec<String>,
    },
    /// Several full lists in one push; each key is applied independently.
    ServiceBatch(Vec<ServiceSnapshot>),
    /// A service appeared or disappeared on the server.
    ServiceKeyChanged { key: ServiceKey, change: KeyChange },
    /// Complete set of keys matching a watched pattern.
    FuzzyWatchSync {
        pattern: FuzzyWatchPattern,
        keys: Vec<ServiceKey>,
    },
}

/// Reply to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    Ack,
    Nack(String),
}

/// Errors surfaced by a transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Rejected by server (code {code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Receiver of inbound traffic. Implemented by the connection coordinator.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_push(&self, push: PushMessage) -> PushAck;

    async fn on_connection_event(&self, event: ConnectionEvent);
}

/// Bidirectional channel to the registry server.
#[async_trait]
pub trait NamingTransport: Send + Sync {
    /// Open a new connection and return its epoch.
    async fn connect(&self) -> Result<Epoch, TransportError>;

    /// Send a request on the connection identified by `epoch`.
    async fn request(&self, epoch: Epoch, request: Request) -> Result<Response, TransportError>;

    /// Install the inbound handler. Held weakly to avoid a reference cycle.
    fn register_inbound(&self, handler: Weak<dyn InboundHandler>);
}
