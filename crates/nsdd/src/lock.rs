//! Multicast lock management.
//!
//! On Wi-Fi, multicast filtering would starve mDNS unless the platform's
//! multicast lock is held. Holding it costs power, so the lock is held only
//! while some *active* app has a modern-backend request that can actually
//! see a Wi-Fi network. The decision is re-derived from scratch after any
//! change to the three inputs: the Wi-Fi network set, the active-uid set,
//! and the request registries.

use crate::clients::ClientRegistry;
use nsd_core::types::Network;
use std::collections::HashSet;
use tracing::{debug, info};

/// Actuates the platform multicast lock. Implementations need not be
/// idempotent; the manager guarantees one call per boundary crossing.
pub trait MulticastLock: Send {
    fn acquire(&mut self, uid: u32);
    fn release(&mut self);
}

/// Default actuator: records transitions in the log. There is no Linux
/// equivalent of the platform flag, so observing the transitions is the
/// useful part.
#[derive(Debug, Default)]
pub struct LoggingMulticastLock;

impl MulticastLock for LoggingMulticastLock {
    fn acquire(&mut self, uid: u32) {
        info!(uid, "multicast lock acquired");
    }

    fn release(&mut self) {
        info!("multicast lock released");
    }
}

/// Derives the lock state from its three inputs.
pub struct LockManager {
    lock: Box<dyn MulticastLock>,
    held_for_uid: Option<u32>,
    wifi_lock_required_networks: HashSet<Network>,
    running_app_active_uids: HashSet<u32>,
}

impl LockManager {
    pub fn new(lock: Box<dyn MulticastLock>) -> Self {
        Self {
            lock,
            held_for_uid: None,
            wifi_lock_required_networks: HashSet::new(),
            running_app_active_uids: HashSet::new(),
        }
    }

    /// Replaces the Wi-Fi network set. Call `evaluate` afterwards.
    pub fn set_required_networks(&mut self, networks: HashSet<Network>) {
        self.wifi_lock_required_networks = networks;
    }

    /// Marks a uid active or inactive. Call `evaluate` afterwards.
    pub fn set_uid_active(&mut self, uid: u32, active: bool) {
        if active {
            self.running_app_active_uids.insert(uid);
        } else {
            self.running_app_active_uids.remove(&uid);
        }
    }

    pub fn is_held(&self) -> bool {
        self.held_for_uid.is_some()
    }

    /// Recomputes whether the lock should be held and actuates only on a
    /// boundary crossing. Re-evaluation while held (possibly for a
    /// different uid) is a no-op.
    pub fn evaluate(&mut self, registry: &ClientRegistry) {
        let needed = self.needs_lock_uid(registry);
        match (self.held_for_uid, needed) {
            (None, Some(uid)) => {
                self.lock.acquire(uid);
                self.held_for_uid = Some(uid);
            }
            (Some(_), None) => {
                self.lock.release();
                self.held_for_uid = None;
            }
            _ => {
                debug!(held = ?self.held_for_uid, needed = ?needed, "multicast lock unchanged");
            }
        }
    }

    /// The uid the lock should be held for, if any: some active uid owning
    /// a modern-backend request whose requested network intersects the
    /// Wi-Fi set (a request with no requested network matches any).
    fn needs_lock_uid(&self, registry: &ClientRegistry) -> Option<u32> {
        if self.wifi_lock_required_networks.is_empty() {
            return None;
        }
        for (tx, connector) in registry.transactions() {
            let Some(client) = registry.client(connector) else {
                continue;
            };
            if !self.running_app_active_uids.contains(&client.uid) {
                continue;
            }
            let matches = client.requests.values().any(|request| {
                request.transaction_id() == tx
                    && match request.modern_requested_network() {
                        None => false,
                        Some(None) => true,
                        Some(Some(network)) => {
                            self.wifi_lock_required_networks.contains(&network)
                        }
                    }
            });
            if matches {
                return Some(client.uid);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientInfo, ClientRequest, DiscoveryPurpose, RequestHeader};
    use crate::engine::ListenerHandle;
    use nsd_core::types::{ClientRequestId, ConnectorId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct CountingLock {
        acquires: Arc<AtomicU32>,
        releases: Arc<AtomicU32>,
    }

    impl MulticastLock for CountingLock {
        fn acquire(&mut self, _uid: u32) {
            self.acquires.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_manager() -> (LockManager, Arc<AtomicU32>, Arc<AtomicU32>) {
        let acquires = Arc::new(AtomicU32::new(0));
        let releases = Arc::new(AtomicU32::new(0));
        let manager = LockManager::new(Box::new(CountingLock {
            acquires: acquires.clone(),
            releases: releases.clone(),
        }));
        (manager, acquires, releases)
    }

    fn registry_with_modern_request(
        uid: u32,
        requested_network: Option<Network>,
    ) -> ClientRegistry {
        let mut registry = ClientRegistry::default();
        let connector = ConnectorId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert_client(ClientInfo::new(connector.clone(), uid, true, tx));
        let txid = registry.allocate_transaction_id();
        registry.insert_request(
            &connector,
            ClientRequestId::new(1),
            ClientRequest::Discovery {
                header: RequestHeader::new(txid, ClientRequestId::new(1), "_ipp._tcp"),
                listener: ListenerHandle::new(1),
                requested_network,
                purpose: DiscoveryPurpose::Browse,
            },
        );
        registry
    }

    #[test]
    fn lock_acquired_for_active_uid_with_wildcard_network() {
        let (mut manager, acquires, releases) = counting_manager();
        let registry = registry_with_modern_request(1000, None);

        manager.set_required_networks(HashSet::from([Network::new(1)]));
        manager.set_uid_active(1000, true);
        manager.evaluate(&registry);

        assert!(manager.is_held());
        assert_eq!(acquires.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_evaluation_is_idempotent() {
        let (mut manager, acquires, releases) = counting_manager();
        let registry = registry_with_modern_request(1000, None);

        manager.set_required_networks(HashSet::from([Network::new(1)]));
        manager.set_uid_active(1000, true);
        for _ in 0..5 {
            manager.evaluate(&registry);
        }
        assert_eq!(acquires.load(Ordering::SeqCst), 1);

        let empty = ClientRegistry::default();
        for _ in 0..5 {
            manager.evaluate(&empty);
        }
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(!manager.is_held());
    }

    #[test]
    fn inactive_uid_does_not_hold_the_lock() {
        let (mut manager, acquires, _) = counting_manager();
        let registry = registry_with_modern_request(1000, None);

        manager.set_required_networks(HashSet::from([Network::new(1)]));
        manager.evaluate(&registry);

        assert!(!manager.is_held());
        assert_eq!(acquires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_wifi_networks_means_no_lock() {
        let (mut manager, acquires, _) = counting_manager();
        let registry = registry_with_modern_request(1000, None);
        manager.set_uid_active(1000, true);
        manager.evaluate(&registry);
        assert!(!manager.is_held());
        assert_eq!(acquires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn requested_network_must_intersect_wifi_set() {
        let (mut manager, _, _) = counting_manager();
        manager.set_required_networks(HashSet::from([Network::new(1)]));
        manager.set_uid_active(1000, true);

        let other = registry_with_modern_request(1000, Some(Network::new(9)));
        manager.evaluate(&other);
        assert!(!manager.is_held());

        let matching = registry_with_modern_request(1000, Some(Network::new(1)));
        manager.evaluate(&matching);
        assert!(manager.is_held());
    }

    #[test]
    fn legacy_requests_never_hold_the_lock() {
        use crate::clients::LegacyVerb;

        let (mut manager, _, _) = counting_manager();
        let mut registry = ClientRegistry::default();
        let connector = ConnectorId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert_client(ClientInfo::new(connector.clone(), 1000, false, tx));
        let txid = registry.allocate_transaction_id();
        registry.insert_request(
            &connector,
            ClientRequestId::new(1),
            ClientRequest::Legacy {
                header: RequestHeader::new(txid, ClientRequestId::new(1), "_ipp._tcp"),
                verb: LegacyVerb::Discover,
            },
        );

        manager.set_required_networks(HashSet::from([Network::new(1)]));
        manager.set_uid_active(1000, true);
        manager.evaluate(&registry);
        assert!(!manager.is_held());
    }
}
