//! Deadline helpers for the millisecond-resolution operation timeouts.
//!
//! Operations that may suspend more than once (allowance waits, queue waits,
//! lock acquisitions) convert their caller-supplied timeout into a single
//! absolute deadline up front, so the budget is shared across every
//! suspension point instead of restarting at each one.

use crate::error::{RelayError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Convert an optional timeout into an absolute deadline. `None` means the
/// operation waits indefinitely.
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// Await `future`, failing with [`RelayError::Timeout`] once the deadline
/// passes. A `None` deadline awaits without bound.
pub async fn with_deadline<F: Future>(deadline: Option<Instant>, future: F) -> Result<F::Output> {
    match deadline {
        None => Ok(future.await),
        Some(at) => tokio::time::timeout_at(at, future)
            .await
            .map_err(|_| RelayError::Timeout),
    }
}
