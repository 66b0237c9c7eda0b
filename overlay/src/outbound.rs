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

use crate::{helpers::RELAYED, peer::PeerId, Overlay};
use tessera_node_messages::{Message, MessageId};

use std::collections::HashSet;

impl Overlay {
    /// Queues a message toward the given peer. A full queue closes the
    /// session rather than growing without bound.
    pub fn send(&self, id: PeerId, message: Message) {
        let Some(peer) = self.peer(id) else {
            trace!("Not sending '{}' to unknown {id}", message.name());
            return;
        };
        if let Err(error) = peer.enqueue(message) {
            warn!("Disconnecting from '{}' - {error}", peer.remote());
            self.on_peer_closed(&peer);
        }
    }

    /// Sends a message to every active peer. A relayable message is marked
    /// in the suppression table first, so echoes of our own traffic are not
    /// relayed back out.
    pub fn broadcast(&self, message: Message) {
        if let Some(uid) = message.uid() {
            let mut skip = HashSet::new();
            self.hash_router.swap_set(uid, &mut skip, RELAYED);
        }
        let hop_bound = message.hops().is_some();
        for peer in self.peers() {
            if hop_bound && !peer.is_hop_aware() {
                continue;
            }
            if let Err(error) = peer.enqueue(message.clone()) {
                warn!("Disconnecting from '{}' - {error}", peer.remote());
                self.on_peer_closed(&peer);
            }
        }
    }

    /// Fans a message out to every active hop-aware peer not in the skip
    /// set. The hop count is advanced on the way out, or forcibly zeroed
    /// when expiration is configured so that downstream nodes cannot observe
    /// our relay topology.
    pub fn relay(&self, mut message: Message, uid: MessageId, skip: &HashSet<PeerId>) {
        if let Some(hops) = message.hops() {
            match self.config.expire {
                true => message.set_hops(Some(0)),
                false => message.set_hops(Some(hops.saturating_add(1))),
            }
        }
        let hop_bound = message.hops().is_some();

        let mut relayed = 0usize;
        for peer in self.peers() {
            if skip.contains(&peer.id()) {
                continue;
            }
            if hop_bound && !peer.is_hop_aware() {
                continue;
            }
            if let Err(error) = peer.enqueue(message.clone()) {
                warn!("Disconnecting from '{}' - {error}", peer.remote());
                self.on_peer_closed(&peer);
                continue;
            }
            relayed += 1;
        }
        trace!("Relayed '{uid}' to {relayed} peers");
    }
}
