//! Lease client registry keyed by node address

use pgsched_core::NodeAddress;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::traits::LeaseClient;

/// Builds a lease client for a node address
pub type LeaseClientFactory = Arc<dyn Fn(&NodeAddress) -> Arc<dyn LeaseClient> + Send + Sync>;

/// Lazily created lease clients, one per node address
///
/// Owned by the scheduler's control loop, so it needs no locking.
pub struct LeaseClientRegistry {
    factory: LeaseClientFactory,
    clients: HashMap<NodeAddress, Arc<dyn LeaseClient>>,
}

impl LeaseClientRegistry {
    /// Create an empty registry backed by `factory`
    pub fn new(factory: LeaseClientFactory) -> Self {
        Self {
            factory,
            clients: HashMap::new(),
        }
    }

    /// Get the client for `address`, creating it on first use
    pub fn get_or_create(&mut self, address: &NodeAddress) -> Arc<dyn LeaseClient> {
        if let Some(client) = self.clients.get(address) {
            return client.clone();
        }

        let client = (self.factory)(address);
        self.clients.insert(address.clone(), client.clone());
        debug!(address = %address, "Created lease client");
        client
    }

    /// Drop clients for addresses not in `alive`
    ///
    /// Returns the number of clients evicted.
    pub fn retain_alive<'a>(&mut self, alive: impl IntoIterator<Item = &'a NodeAddress>) -> usize {
        let alive: std::collections::HashSet<&NodeAddress> = alive.into_iter().collect();
        let before = self.clients.len();
        self.clients.retain(|address, _| {
            let keep = alive.contains(address);
            if !keep {
                debug!(address = %address, "Evicted lease client");
            }
            keep
        });
        before - self.clients.len()
    }

    /// Number of live clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ManualLeaseClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(created: Arc<AtomicUsize>) -> LeaseClientFactory {
        Arc::new(move |address: &NodeAddress| {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(ManualLeaseClient::new(address.clone())) as Arc<dyn LeaseClient>
        })
    }

    #[test]
    fn test_clients_are_created_lazily_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut registry = LeaseClientRegistry::new(counting_factory(created.clone()));
        assert!(registry.is_empty());

        let a = NodeAddress::new("127.0.0.1", 7000);
        let first = registry.get_or_create(&a);
        let second = registry.get_or_create(&a);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_retain_alive_evicts_dead_nodes() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut registry = LeaseClientRegistry::new(counting_factory(created.clone()));

        let a = NodeAddress::new("127.0.0.1", 7000);
        let b = NodeAddress::new("127.0.0.1", 7001);
        registry.get_or_create(&a);
        registry.get_or_create(&b);

        assert_eq!(registry.retain_alive([&a]), 1);
        assert_eq!(registry.len(), 1);

        // A node coming back gets a fresh client
        registry.get_or_create(&b);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }
}
