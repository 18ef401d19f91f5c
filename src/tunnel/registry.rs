//! Tunnel registry: connection-scoped id allocation and routing state for
//! every live tunnel. Inbound tunnel packets are resolved here by local id.
//!
//! Identifiers are monotonic and never recycled within a connection, so a
//! packet referencing a freed id can never be misrouted to a newer tunnel.

use crate::tunnel::TunnelShared;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct TunnelRegistry {
    next_id: AtomicU64,
    tunnels: Mutex<HashMap<u64, Arc<TunnelShared>>>,
}

impl TunnelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next local tunnel id.
    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, shared: Arc<TunnelShared>) {
        let mut tunnels = self.tunnels.lock().expect("tunnel registry poisoned");
        let previous = tunnels.insert(shared.local_id(), shared);
        debug_assert!(previous.is_none(), "tunnel id reused");
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<TunnelShared>> {
        self.tunnels
            .lock()
            .expect("tunnel registry poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Arc<TunnelShared>> {
        self.tunnels
            .lock()
            .expect("tunnel registry poisoned")
            .remove(&id)
    }

    /// Remove and return every live tunnel; used by connection teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<TunnelShared>> {
        self.tunnels
            .lock()
            .expect("tunnel registry poisoned")
            .drain()
            .map(|(_, shared)| shared)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    #[test]
    fn ids_are_monotonic() {
        let registry = TunnelRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let c = registry.allocate_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn register_get_remove_roundtrip() {
        let registry = TunnelRegistry::new();
        let id = registry.allocate_id();
        let shared = TunnelShared::accepted(id, 9, 1024, Weak::new());
        registry.register(Arc::clone(&shared));
        assert!(registry.get(id).is_some());
        assert!(registry.get(id + 1).is_none());
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = TunnelRegistry::new();
        for _ in 0..3 {
            let id = registry.allocate_id();
            registry.register(TunnelShared::accepted(id, 9, 1024, Weak::new()));
        }
        assert_eq!(registry.drain().len(), 3);
        assert_eq!(registry.len(), 0);
    }
}
