//! Naming Sync - client-side service discovery core
//!
//! Keeps a local, lock-free view of service instances in sync with a
//! registry server: server pushes are reconciled into the cache, listeners
//! are told what changed, and every registration, subscription and fuzzy
//! watch is replayed after a reconnect. The wire transport is supplied by
//! the embedding process through `transport::NamingTransport`.

pub mod balancer;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fuzzy;
pub mod model;
pub mod redo;
pub mod subscription;
pub mod transport;
pub mod utils;

pub use client::{FuzzyWatchRegistration, NamingClient};
pub use config::{DisconnectedPolicy, NamingConfig};
pub use connection::Submission;
pub use error::{NamingError, Result};
pub use model::{InstanceRecord, ServiceKey, ServiceSnapshot};
