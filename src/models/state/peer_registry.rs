use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::peer::Peer;

#[derive(Debug, Default)]
struct RegistryInner {
    peers: HashMap<String, Arc<Peer>>,
    connected: HashMap<IpAddr, usize>,
    incoming: usize,
    outgoing: usize,

    /// Flattened copy of `peers`, dropped on every mutation.
    listing: Option<Arc<[Arc<Peer>]>>,
}

impl RegistryInner {
    fn count_in(&mut self, peer: &Peer) {
        *self.connected.entry(peer.ip()).or_default() += 1;
        if peer.is_incoming() {
            self.incoming += 1;
        } else {
            self.outgoing += 1;
        }
    }

    fn count_out(&mut self, peer: &Peer) {
        if let Some(count) = self.connected.get_mut(&peer.ip()) {
            *count -= 1;
            if *count == 0 {
                self.connected.remove(&peer.ip());
            }
        }
        if peer.is_incoming() {
            self.incoming -= 1;
        } else {
            self.outgoing -= 1;
        }
    }
}

/// The set of active connections, keyed by peer hash.
///
/// The registry only stores peers. It never stops one: a displaced peer is
/// handed back to the caller, who decides what happens to it.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a peer under its hash. Returns the peer previously stored
    /// under the same hash, if any.
    pub fn upsert(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let mut inner = self.write();
        inner.count_in(&peer);
        let displaced = inner.peers.insert(peer.hash().to_string(), peer);
        if let Some(old) = &displaced {
            inner.count_out(old);
        }
        inner.listing = None;
        displaced
    }

    /// Remove the peer, but only if the entry under its hash is this very
    /// peer and not a newer connection that replaced it.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut inner = self.write();
        let is_stored = inner
            .peers
            .get(peer.hash())
            .is_some_and(|stored| Arc::ptr_eq(stored, peer));
        if !is_stored {
            return false;
        }

        inner.peers.remove(peer.hash());
        inner.count_out(peer);
        inner.listing = None;
        true
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Peer>> {
        self.read().peers.get(hash).cloned()
    }

    /// A point-in-time listing that can be iterated without holding any
    /// lock.
    pub fn snapshot(&self) -> Arc<[Arc<Peer>]> {
        if let Some(listing) = &self.read().listing {
            return Arc::clone(listing);
        }

        let mut inner = self.write();
        if let Some(listing) = &inner.listing {
            return Arc::clone(listing);
        }
        let listing: Arc<[Arc<Peer>]> = inner.peers.values().cloned().collect();
        inner.listing = Some(Arc::clone(&listing));
        listing
    }

    pub fn count_for_address(&self, address: IpAddr) -> usize {
        self.read().connected.get(&address).copied().unwrap_or_default()
    }

    pub fn is_connected(&self, address: IpAddr) -> bool {
        self.count_for_address(address) > 0
    }

    pub fn incoming(&self) -> usize {
        self.read().incoming
    }

    pub fn outgoing(&self) -> usize {
        self.read().outgoing
    }

    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the counters against the stored peers.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.read();
        assert_eq!(inner.peers.len(), inner.incoming + inner.outgoing);

        let mut expected: HashMap<IpAddr, usize> = HashMap::new();
        for peer in inner.peers.values() {
            *expected.entry(peer.ip()).or_default() += 1;
        }
        assert_eq!(expected, inner.connected);

        let incoming = inner.peers.values().filter(|p| p.is_incoming()).count();
        assert_eq!(incoming, inner.incoming);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;
    use crate::tests::shared::get_dummy_socket_address;
    use crate::tests::shared::test_args;
    use crate::tests::shared::TestChannels;

    fn active_peer(
        channels: &TestChannels,
        address: SocketAddr,
        incoming: bool,
        node_id: u64,
    ) -> Arc<Peer> {
        let peer = channels.peer(test_args(), address, incoming);
        drop(peer.activate_detached(node_id, 8108));
        peer
    }

    #[test]
    fn upsert_returns_displaced_peer() {
        let channels = TestChannels::new();
        let registry = PeerRegistry::new();
        let first = active_peer(&channels, get_dummy_socket_address(1), true, 7);
        let second = active_peer(&channels, get_dummy_socket_address(1), false, 7);
        assert_eq!(first.hash(), second.hash());

        assert!(registry.upsert(Arc::clone(&first)).is_none());
        let displaced = registry.upsert(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&first, &displaced));

        assert_eq!(1, registry.len());
        assert_eq!(0, registry.incoming());
        assert_eq!(1, registry.outgoing());
        assert_eq!(1, registry.count_for_address(first.ip()));
        registry.assert_consistent();
    }

    #[test]
    fn stale_remove_keeps_replacement() {
        let channels = TestChannels::new();
        let registry = PeerRegistry::new();
        let stale = active_peer(&channels, get_dummy_socket_address(1), true, 7);
        let replacement = active_peer(&channels, get_dummy_socket_address(1), true, 7);

        registry.upsert(Arc::clone(&stale));
        registry.upsert(Arc::clone(&replacement));

        assert!(!registry.remove(&stale));
        assert!(registry.is_connected(stale.ip()));
        assert!(registry.remove(&replacement));
        assert!(!registry.is_connected(stale.ip()));
        assert!(registry.is_empty());
        registry.assert_consistent();
    }

    #[test]
    fn snapshot_is_rebuilt_after_mutation() {
        let channels = TestChannels::new();
        let registry = PeerRegistry::new();
        let peer = active_peer(&channels, get_dummy_socket_address(1), true, 7);

        assert_eq!(0, registry.snapshot().len());
        registry.upsert(Arc::clone(&peer));
        let snapshot = registry.snapshot();
        assert_eq!(1, snapshot.len());
        assert!(Arc::ptr_eq(&snapshot, &registry.snapshot()));

        registry.remove(&peer);
        assert_eq!(1, snapshot.len());
        assert_eq!(0, registry.snapshot().len());
    }

    #[derive(Debug, Clone, test_strategy::Arbitrary)]
    enum Operation {
        Upsert {
            #[strategy(0u8..4)]
            address: u8,
            #[strategy(0u64..3)]
            node_id: u64,
            incoming: bool,
        },
        Remove(#[strategy(0usize..16)] usize),
    }

    #[proptest]
    fn counters_match_entries_after_every_operation(
        #[strategy(prop::collection::vec(any::<Operation>(), 0..64))] operations: Vec<Operation>,
    ) {
        let channels = TestChannels::new();
        let registry = PeerRegistry::new();
        let mut created: Vec<Arc<Peer>> = vec![];

        for operation in operations {
            match operation {
                Operation::Upsert {
                    address,
                    node_id,
                    incoming,
                } => {
                    let peer = active_peer(
                        &channels,
                        get_dummy_socket_address(address),
                        incoming,
                        node_id,
                    );
                    created.push(Arc::clone(&peer));
                    registry.upsert(peer);
                }
                Operation::Remove(index) => {
                    if let Some(peer) = created.get(index) {
                        registry.remove(peer);
                    }
                }
            }
            registry.assert_consistent();
            prop_assert_eq!(registry.len(), registry.incoming() + registry.outgoing());
        }
    }
}
