//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the backoff
//! used between redo attempts for a single task and the backoff used while
//! re-establishing the connection.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::error::NamingError;

/// Backoff between redo attempts for one task.
///
/// - Min delay: `base` (the redo tick)
/// - Max delay: 60s
/// - Max attempts: 16, after which the max delay is reused
/// - Jitter enabled
pub fn redo_backoff(base: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(Duration::from_secs(60))
        .with_max_times(16)
        .with_jitter()
}

/// Backoff while reconnecting the transport.
///
/// - Min delay: `min`
/// - Max delay: `max`
/// - Max attempts: 30 per round; the caller starts a new round after that
/// - Jitter enabled
pub fn reconnect_backoff(min: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_max_times(30)
        .with_jitter()
}

/// Delay before retry number `attempt` (1-based) under `builder`.
///
/// Past the builder's attempt limit the builder's max delay is returned.
pub fn delay_for_attempt(builder: ExponentialBuilder, attempt: u32, max: Duration) -> Duration {
    let index = attempt.saturating_sub(1) as usize;
    builder.build().nth(index).unwrap_or(max)
}

/// Whether a failed request should be retried automatically.
///
/// Retryable:
/// - `Connection`, `Timeout`: transient transport trouble
///
/// Non-retryable:
/// - `ServerRejected`: waits for the caller to try again
/// - `InvalidParameter` and local failures: will never succeed on retry
pub fn is_retryable(error: &NamingError) -> bool {
    matches!(error, NamingError::Connection(_) | NamingError::Timeout(_))
}
