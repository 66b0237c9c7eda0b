// Copyright 2024 Tessera Contributors
// This file is part of the tessera library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod slot;
pub use slot::{Direction, Slot, SlotId, SlotState};

use crate::OverlayConfig;
use tessera_account::NodeKey;
use tessera_node_messages::Endpoints;

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::net::SocketAddr;

/// The maximum number of endpoints suggested to a refused client.
const REDIRECT_ENDPOINT_COUNT: usize = 10;
/// The maximum number of candidate endpoints held in the boot cache.
const MAXIMUM_BOOT_CACHE: usize = 1000;
/// The number of connection failures after which a candidate is dropped.
const MAXIMUM_BOOT_FAILURES: u32 = 3;
/// The maximum number of endpoints handed out per timer tick.
const MAXIMUM_AUTOCONNECT_PER_TICK: usize = 8;

/// The outcome of the final admission gate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Activate {
    /// The slot is now active.
    Success,
    /// A live peer already holds this node key.
    Duplicate,
    /// All slots are taken; the slot remains reservable only for producing a
    /// redirect list.
    Full,
}

/// The slot table and endpoint bookkeeping: per-process caps on inbound and
/// outbound connections, the boot cache of dial candidates, the fixed-peer
/// pool, and the redirect source for clients that cannot be admitted.
pub struct PeerFinder {
    max_peers: usize,
    out_peers: usize,
    want_incoming: bool,
    auto_connect: bool,
    peer_private: bool,
    ip_limit: usize,
    /// The local listening endpoint, bound once the listener is enabled.
    local: OnceCell<SocketAddr>,
    /// The self-reported public endpoint, if configured.
    public: OnceCell<SocketAddr>,
    books: Mutex<Books>,
}

#[derive(Default)]
struct Books {
    /// Every live slot. Closed slots are removed.
    slots: IndexMap<SlotId, Slot>,
    /// The node keys of active slots.
    active_keys: IndexMap<NodeKey, SlotId>,
    /// The remote endpoint of every live slot, for duplicate detection.
    connected: IndexMap<SocketAddr, SlotId>,
    /// Live inbound slots per source IP.
    ip_counts: IndexMap<std::net::IpAddr, usize>,
    /// Candidate endpoints with their failure counts.
    boot_cache: IndexMap<SocketAddr, u32>,
    /// Fixed-peer endpoints, never dropped.
    fixed: IndexSet<SocketAddr>,
    next_id: u32,
}

impl Books {
    fn outbound_live(&self) -> usize {
        self.slots.values().filter(|slot| slot.is_outbound()).count()
    }

    fn active_total(&self) -> usize {
        self.slots.values().filter(|slot| slot.state == SlotState::Active).count()
    }
}

impl PeerFinder {
    /// Initializes a new peer finder from the overlay configuration.
    pub fn new(config: &OverlayConfig) -> Self {
        Self {
            max_peers: config.max_peers,
            out_peers: config.out_peers(),
            want_incoming: config.want_incoming && !config.peer_private,
            auto_connect: config.auto_connect,
            peer_private: config.peer_private,
            ip_limit: config.ip_limit.max(0) as usize,
            local: OnceCell::new(),
            public: OnceCell::new(),
            books: Mutex::new(Books::default()),
        }
    }

    /// Records the bound listening endpoint, and the public endpoint when the
    /// configuration advertises one.
    pub fn set_local_endpoint(&self, local: SocketAddr, public: Option<SocketAddr>) {
        let _ = self.local.set(local);
        if let Some(public) = public {
            let _ = self.public.set(public);
        }
    }

    /// Returns the bound listening endpoint, if the listener is enabled.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local.get().copied()
    }

    /// Adds the given endpoints to the fixed-peer pool.
    pub fn add_fixed_peers(&self, endpoints: &[SocketAddr]) {
        self.books.lock().fixed.extend(endpoints.iter().copied());
    }

    /// Returns `true` if the given endpoint coincides with our own listening
    /// identity.
    fn is_self(&self, endpoint: &SocketAddr) -> bool {
        self.local.get() == Some(endpoint) || self.public.get() == Some(endpoint)
    }

    /// Reserves an inbound slot for the given connection.
    ///
    /// Returns `None` on a self-connect, when inbound connections are not
    /// wanted, or when the source IP is at its cap; the caller must then drop
    /// the connection without sending a response. Refused attempts are never
    /// counted against the per-IP cap.
    pub fn new_inbound_slot(&self, local: SocketAddr, remote: SocketAddr) -> Option<SlotId> {
        if !self.want_incoming {
            return None;
        }
        if local == remote || self.is_self(&remote) {
            debug!("Dropping inbound connection from '{remote}' (self-connect)");
            return None;
        }

        let mut books = self.books.lock();
        if self.ip_limit > 0 {
            let count = books.ip_counts.get(&remote.ip()).copied().unwrap_or(0);
            if count >= self.ip_limit {
                debug!("Dropping inbound connection from '{remote}' (IP at limit of {})", self.ip_limit);
                return None;
            }
        }

        let id = SlotId(books.next_id);
        books.next_id += 1;
        books.slots.insert(id, Slot::inbound(remote));
        books.connected.insert(remote, id);
        *books.ip_counts.entry(remote.ip()).or_insert(0) += 1;
        Some(id)
    }

    /// Reserves an outbound slot toward the given endpoint.
    ///
    /// Returns `None` when outbound capacity is exhausted, when the endpoint
    /// is already represented by a live slot, or on a self-connect.
    pub fn new_outbound_slot(&self, remote: SocketAddr) -> Option<SlotId> {
        if self.is_self(&remote) {
            return None;
        }

        let mut books = self.books.lock();
        let fixed = books.fixed.contains(&remote);
        if self.peer_private && !fixed {
            return None;
        }
        if books.connected.contains_key(&remote) {
            return None;
        }
        if books.outbound_live() >= self.out_peers && !fixed {
            return None;
        }

        let id = SlotId(books.next_id);
        books.next_id += 1;
        books.slots.insert(id, Slot::outbound(remote, fixed));
        books.connected.insert(remote, id);
        Some(id)
    }

    /// Transitions a connect slot to `Connected` once the transport is up.
    ///
    /// Returns `false` when the connection turned out to reach ourselves or
    /// when the endpoint was claimed by another slot in the meantime.
    pub fn on_connected(&self, id: SlotId, local: SocketAddr) -> bool {
        let mut books = self.books.lock();
        let Some(slot) = books.slots.get_mut(&id) else {
            return false;
        };
        if slot.state != SlotState::Connect {
            return false;
        }
        if slot.remote == local {
            return false;
        }
        slot.state = SlotState::Connected;
        let remote = slot.remote;
        books.connected.get(&remote) == Some(&id)
    }

    /// The final admission gate, once the handshake has revealed the remote
    /// node key.
    pub fn activate(&self, id: SlotId, node_key: NodeKey, cluster: bool) -> Activate {
        let mut books = self.books.lock();
        if let Some(holder) = books.active_keys.get(&node_key) {
            if *holder != id {
                return Activate::Duplicate;
            }
        }
        let full = books.active_total() >= self.max_peers;
        let Some(slot) = books.slots.get_mut(&id) else {
            return Activate::Full;
        };
        // Fixed and cluster peers are admitted past the cap.
        if full && !cluster && slot.direction != Direction::Fixed {
            return Activate::Full;
        }

        slot.state = SlotState::Active;
        slot.node_key = Some(node_key);
        slot.cluster = cluster;
        books.active_keys.insert(node_key, id);
        Activate::Success
    }

    /// Records the listening port advertised by an inbound peer.
    pub fn set_listening_port(&self, id: SlotId, port: u16) {
        if let Some(slot) = self.books.lock().slots.get_mut(&id) {
            slot.listening_port = Some(port);
        }
    }

    /// Idempotent teardown; releases all capacity held by the slot.
    pub fn on_closed(&self, id: SlotId) {
        let mut books = self.books.lock();
        let Some(slot) = books.slots.shift_remove(&id) else {
            return;
        };

        if books.connected.get(&slot.remote) == Some(&id) {
            books.connected.shift_remove(&slot.remote);
        }
        if let Some(node_key) = slot.node_key {
            if books.active_keys.get(&node_key) == Some(&id) {
                books.active_keys.shift_remove(&node_key);
            }
        }
        if slot.direction == Direction::Inbound {
            if let Some(count) = books.ip_counts.get_mut(&slot.remote.ip()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    books.ip_counts.shift_remove(&slot.remote.ip());
                }
            }
        }

        // Track candidate health for outbound endpoints.
        if slot.is_outbound() && !books.fixed.contains(&slot.remote) {
            match slot.state {
                SlotState::Active => {
                    if books.boot_cache.len() < MAXIMUM_BOOT_CACHE {
                        books.boot_cache.insert(slot.remote, 0);
                    }
                }
                _ => {
                    let failures = books.boot_cache.entry(slot.remote).or_insert(0);
                    *failures += 1;
                    if *failures >= MAXIMUM_BOOT_FAILURES {
                        books.boot_cache.shift_remove(&slot.remote);
                    }
                }
            }
        }
    }

    /// Returns zero or more endpoints to dial, bounded by the remaining
    /// outbound capacity and the per-tick throttle. Disconnected fixed peers
    /// come first and are offered regardless of the autoconnect policy.
    pub fn autoconnect(&self) -> Vec<SocketAddr> {
        let books = self.books.lock();
        let mut out = Vec::new();

        for endpoint in &books.fixed {
            if !books.connected.contains_key(endpoint) && !self.is_self(endpoint) {
                out.push(*endpoint);
            }
        }

        if self.auto_connect && !self.peer_private {
            let capacity = self.out_peers.saturating_sub(books.outbound_live() + out.len());
            let mut candidates: Vec<SocketAddr> = books
                .boot_cache
                .keys()
                .filter(|endpoint| !books.connected.contains_key(*endpoint) && !self.is_self(endpoint))
                .copied()
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            out.extend(candidates.into_iter().take(capacity));
        }

        out.truncate(MAXIMUM_AUTOCONNECT_PER_TICK);
        out
    }

    /// Returns a short list of known healthy peer endpoints to suggest to a
    /// client that cannot be admitted.
    pub fn redirect(&self, id: SlotId) -> Vec<SocketAddr> {
        let books = self.books.lock();
        books
            .slots
            .iter()
            .filter(|(slot_id, slot)| **slot_id != id && slot.state == SlotState::Active)
            .filter_map(|(_, slot)| slot.listening_endpoint())
            .take(REDIRECT_ENDPOINT_COUNT)
            .collect()
    }

    /// Absorbs a redirect list received from a peer into the boot cache.
    pub fn on_redirects(&self, endpoints: &[SocketAddr]) {
        let mut books = self.books.lock();
        for endpoint in endpoints {
            if books.boot_cache.len() >= MAXIMUM_BOOT_CACHE {
                break;
            }
            if self.is_self(endpoint) || books.connected.contains_key(endpoint) {
                continue;
            }
            books.boot_cache.entry(*endpoint).or_insert(0);
        }
    }

    /// Returns the broadcast set of known listening endpoints to share with
    /// peers.
    pub fn build_endpoints_for_peers(&self) -> Vec<SocketAddr> {
        let books = self.books.lock();
        books
            .slots
            .values()
            .filter(|slot| slot.state == SlotState::Active)
            .filter_map(|slot| slot.listening_endpoint())
            .take(Endpoints::MAXIMUM_ENDPOINTS)
            .collect()
    }

    /// Returns a snapshot of the given slot.
    pub fn slot(&self, id: SlotId) -> Option<Slot> {
        self.books.lock().slots.get(&id).cloned()
    }

    /// Returns the number of active slots.
    pub fn active_count(&self) -> usize {
        self.books.lock().active_total()
    }

    /// Returns the maximum number of peers.
    pub fn limit(&self) -> usize {
        self.max_peers
    }

    /// Returns the number of boot-cache candidates.
    pub fn candidate_count(&self) -> usize {
        self.books.lock().boot_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_account::Account;

    use rand::rngs::OsRng;

    fn finder(max_peers: usize) -> PeerFinder {
        let config = OverlayConfig { max_peers, ip_limit: 2, ..Default::default() };
        let finder = PeerFinder::new(&config);
        finder.set_local_endpoint("192.0.2.1:2459".parse().unwrap(), None);
        finder
    }

    fn addr(n: u8) -> SocketAddr {
        format!("198.51.100.{n}:2459").parse().unwrap()
    }

    fn node_key() -> NodeKey {
        Account::new(&mut OsRng).node_key()
    }

    #[test]
    fn test_inbound_slot_lifecycle() {
        let finder = finder(8);
        let local = "192.0.2.1:2459".parse().unwrap();

        let id = finder.new_inbound_slot(local, addr(1)).unwrap();
        assert_eq!(finder.slot(id).unwrap().state, SlotState::Accept);

        assert_eq!(finder.activate(id, node_key(), false), Activate::Success);
        assert_eq!(finder.slot(id).unwrap().state, SlotState::Active);
        assert_eq!(finder.active_count(), 1);

        finder.on_closed(id);
        assert!(finder.slot(id).is_none());
        assert_eq!(finder.active_count(), 0);
        // Idempotent.
        finder.on_closed(id);
    }

    #[test]
    fn test_inbound_self_connect_is_refused() {
        let finder = finder(8);
        let local: SocketAddr = "192.0.2.1:2459".parse().unwrap();
        assert!(finder.new_inbound_slot(local, local).is_none());

        // The refusal must not charge the per-IP cap: the same IP still gets
        // its full allowance afterwards.
        let same_ip_a: SocketAddr = "192.0.2.1:50001".parse().unwrap();
        let same_ip_b: SocketAddr = "192.0.2.1:50002".parse().unwrap();
        assert!(finder.new_inbound_slot(local, same_ip_a).is_some());
        assert!(finder.new_inbound_slot(local, same_ip_b).is_some());
    }

    #[test]
    fn test_ip_limit_caps_inbound_slots() {
        let finder = finder(8);
        let local = "192.0.2.1:2459".parse().unwrap();

        let a: SocketAddr = "198.51.100.1:50001".parse().unwrap();
        let b: SocketAddr = "198.51.100.1:50002".parse().unwrap();
        let c: SocketAddr = "198.51.100.1:50003".parse().unwrap();

        let first = finder.new_inbound_slot(local, a).unwrap();
        let _second = finder.new_inbound_slot(local, b).unwrap();
        assert!(finder.new_inbound_slot(local, c).is_none());

        // Closing a slot releases the charge.
        finder.on_closed(first);
        assert!(finder.new_inbound_slot(local, c).is_some());
    }

    #[test]
    fn test_outbound_duplicate_endpoint_is_refused() {
        let finder = finder(100);
        let id = finder.new_outbound_slot(addr(1)).unwrap();
        assert!(finder.new_outbound_slot(addr(1)).is_none());

        finder.on_closed(id);
        assert!(finder.new_outbound_slot(addr(1)).is_some());
    }

    #[test]
    fn test_outbound_capacity_is_bounded() {
        let config = OverlayConfig { max_peers: 100, ..Default::default() };
        let finder = PeerFinder::new(&config);
        let out_peers = config.out_peers();

        for n in 0..out_peers {
            assert!(finder.new_outbound_slot(addr(n as u8)).is_some());
        }
        assert!(finder.new_outbound_slot(addr(out_peers as u8)).is_none());
    }

    #[test]
    fn test_on_connected_detects_accidental_self_connect() {
        let finder = finder(8);
        let id = finder.new_outbound_slot(addr(1)).unwrap();
        // The local endpoint of the socket equals the dialed remote: we
        // connected to ourselves through a loop.
        assert!(!finder.on_connected(id, addr(1)));

        let id2 = finder.new_outbound_slot(addr(2)).unwrap();
        assert!(finder.on_connected(id2, "192.0.2.1:39000".parse().unwrap()));
        assert_eq!(finder.slot(id2).unwrap().state, SlotState::Connected);
    }

    #[test]
    fn test_activate_duplicate_node_key() {
        let finder = finder(8);
        let local = "192.0.2.1:2459".parse().unwrap();
        let key = node_key();

        let a = finder.new_inbound_slot(local, addr(1)).unwrap();
        let b = finder.new_inbound_slot(local, addr(2)).unwrap();
        assert_eq!(finder.activate(a, key, false), Activate::Success);
        assert_eq!(finder.activate(b, key, false), Activate::Duplicate);
    }

    #[test]
    fn test_activate_full_and_redirect() {
        let finder = finder(1);
        let local = "192.0.2.1:2459".parse().unwrap();

        let first = finder.new_inbound_slot(local, addr(1)).unwrap();
        finder.set_listening_port(first, 2459);
        assert_eq!(finder.activate(first, node_key(), false), Activate::Success);

        let second = finder.new_inbound_slot(local, addr(2)).unwrap();
        assert_eq!(finder.activate(second, node_key(), false), Activate::Full);

        // The refused slot is still good for producing a redirect list.
        let redirects = finder.redirect(second);
        assert_eq!(redirects, vec![addr(1)]);
        finder.on_closed(second);
    }

    #[test]
    fn test_cluster_peers_bypass_full() {
        let finder = finder(1);
        let local = "192.0.2.1:2459".parse().unwrap();

        let first = finder.new_inbound_slot(local, addr(1)).unwrap();
        assert_eq!(finder.activate(first, node_key(), false), Activate::Success);

        let second = finder.new_inbound_slot(local, addr(2)).unwrap();
        assert_eq!(finder.activate(second, node_key(), true), Activate::Success);
    }

    #[test]
    fn test_autoconnect_draws_from_boot_cache() {
        let finder = finder(100);
        finder.on_redirects(&[addr(1), addr(2), addr(3)]);
        assert_eq!(finder.candidate_count(), 3);

        let endpoints = finder.autoconnect();
        assert!(!endpoints.is_empty());
        assert!(endpoints.iter().all(|e| [addr(1), addr(2), addr(3)].contains(e)));
    }

    #[test]
    fn test_autoconnect_prefers_fixed_peers() {
        let config = OverlayConfig { max_peers: 100, peer_private: true, ..Default::default() };
        let finder = PeerFinder::new(&config);
        finder.add_fixed_peers(&[addr(9)]);
        finder.on_redirects(&[addr(1)]);

        // A private node solicits fixed peers only.
        assert_eq!(finder.autoconnect(), vec![addr(9)]);
    }

    #[test]
    fn test_failed_candidates_are_dropped() {
        let finder = finder(100);
        finder.on_redirects(&[addr(1)]);

        for _ in 0..MAXIMUM_BOOT_FAILURES {
            let id = finder.new_outbound_slot(addr(1)).unwrap();
            finder.on_closed(id);
        }
        assert_eq!(finder.candidate_count(), 0);
    }

    #[test]
    fn test_private_node_refuses_inbound() {
        let config = OverlayConfig { peer_private: true, ..Default::default() };
        let finder = PeerFinder::new(&config);
        let local = "192.0.2.1:2459".parse().unwrap();
        assert!(finder.new_inbound_slot(local, addr(1)).is_none());
    }
}
