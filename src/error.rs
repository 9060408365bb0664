//! Error taxonomy for the naming client.
//!
//! Connection failures are absorbed by the redo machinery and retried; they
//! reach callers only as `Submission::Pending`. Parameter errors fail fast.
//! Server rejections surface to the caller and park the redo task until the
//! caller tries again. Local storage errors never leave the cache module.

use crate::balancer::ChooserError;
use crate::transport::TransportError;

/// Result type for naming operations.
pub type Result<T> = std::result::Result<T, NamingError>;

/// Errors that can occur during naming operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NamingError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Server rejected request (code {code}): {message}")]
    ServerRejected { code: i32, message: String },

    #[error("Local storage error: {0}")]
    LocalStorage(String),

    #[error("Timed out waiting for connection after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Stale snapshot for {key}: revision {incoming} older than {current}")]
    Stale {
        key: String,
        incoming: u64,
        current: u64,
    },

    #[error("Chooser error: {0}")]
    Chooser(#[from] ChooserError),

    #[error("Naming client is shut down")]
    Shutdown,
}

impl NamingError {
    /// Build an invalid-parameter error.
    pub fn invalid(message: impl Into<String>) -> Self {
        NamingError::InvalidParameter(message.into())
    }
}

impl From<TransportError> for NamingError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connection(message) => NamingError::Connection(message),
            TransportError::NotConnected => NamingError::Connection("not connected".to_string()),
            TransportError::Rejected { code, message } => {
                NamingError::ServerRejected { code, message }
            }
            TransportError::Timeout(d) => NamingError::Timeout(d),
        }
    }
}
