//! # Request Registry
//!
//! Rendezvous between operations awaiting a daemon reply and the inbound
//! dispatcher that completes them.
//!
//! Identifiers are connection-scoped, monotonic and never recycled, so a
//! lingering late reply can only ever reference a slot that no longer exists
//! and is silently discarded. The registry backs `request` as well as the
//! subscribe/unsubscribe acknowledgement round trips.

use crate::error::{RelayError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Completion payload delivered to a waiting caller.
pub(crate) type Completion = Result<Vec<u8>>;

pub(crate) struct RequestRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Completion>>>,
}

impl RequestRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next id and insert a completion slot for it.
    pub(crate) fn begin(&self) -> (u64, oneshot::Receiver<Completion>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("request registry poisoned");
        let previous = pending.insert(id, tx);
        debug_assert!(previous.is_none(), "request id {id} reused");
        (id, rx)
    }

    /// Fulfil a slot if it still exists. A slot removed by timeout or
    /// cancellation makes this a silent no-op.
    pub(crate) fn complete(&self, id: u64, outcome: Completion) {
        let slot = self
            .pending
            .lock()
            .expect("request registry poisoned")
            .remove(&id);
        if let Some(tx) = slot {
            // The caller may have vanished between removal and send; both
            // outcomes leave the registry consistent.
            let _ = tx.send(outcome);
        }
    }

    /// Remove a slot owned by a caller whose deadline expired. Returns whether
    /// the slot was still present.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        self.pending
            .lock()
            .expect("request registry poisoned")
            .remove(&id)
            .is_some()
    }

    /// Complete every outstanding slot with `Closed`; used by teardown.
    pub(crate) fn abort_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("request registry poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(RelayError::Closed));
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic_and_unique() {
        let registry = RequestRegistry::new();
        let (a, _rx_a) = registry.begin();
        let (b, _rx_b) = registry.begin();
        let (c, _rx_c) = registry.begin();
        assert!(a < b && b < c);
        assert_eq!(registry.outstanding(), 3);
    }

    #[tokio::test]
    async fn complete_delivers_to_the_waiter() {
        let registry = RequestRegistry::new();
        let (id, rx) = registry.begin();
        registry.complete(id, Ok(b"reply".to_vec()));
        assert_eq!(rx.await.unwrap().unwrap(), b"reply");
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn late_reply_after_cancel_is_discarded() {
        let registry = RequestRegistry::new();
        let (id, rx) = registry.begin();
        assert!(registry.cancel(id));
        drop(rx);
        // Must not panic or resurrect the slot.
        registry.complete(id, Ok(vec![]));
        assert_eq!(registry.outstanding(), 0);
        assert!(!registry.cancel(id));
    }

    #[tokio::test]
    async fn abort_all_fails_every_waiter_with_closed() {
        let registry = RequestRegistry::new();
        let (_a, rx_a) = registry.begin();
        let (_b, rx_b) = registry.begin();
        registry.abort_all();
        assert!(matches!(rx_a.await.unwrap(), Err(RelayError::Closed)));
        assert!(matches!(rx_b.await.unwrap(), Err(RelayError::Closed)));
        assert_eq!(registry.outstanding(), 0);
    }
}
