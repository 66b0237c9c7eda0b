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

use crate::Overlay;
use tessera_node_messages::{Endpoints, Message, Ping};

use rand::Rng;
use std::time::Duration;

/// The duration in seconds after which a peer with no traffic is considered
/// gone.
const RADIO_SILENCE_IN_SECS: u64 = 150; // 2.5 minutes
/// How often, in ticks, the overlay pings its peers.
const PING_INTERVAL_IN_SECS: u64 = 8;
/// How often, in ticks, the overlay shares its known endpoints.
const ENDPOINTS_INTERVAL_IN_SECS: u64 = 30;

impl Overlay {
    /// Starts the 1-Hz timer driving autoconnect, suppression-table expiry,
    /// and peer liveness.
    pub(crate) fn initialize_heartbeat(&self) {
        let overlay = self.clone();
        self.handles.lock().push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                if overlay.is_closing() {
                    break;
                }
                overlay.heartbeat(ticks);
                ticks += 1;
            }
        }));
    }

    /// Processes one timer tick.
    fn heartbeat(&self, ticks: u64) {
        // Expire stale suppression entries.
        self.hash_router.sweep();

        // Solicit outbound connections; each endpoint becomes an attempt.
        for endpoint in self.finder.autoconnect() {
            self.connect(endpoint);
        }

        let our_seq = self.latest_ledger_seq();
        for peer in self.peers() {
            // Radio silence closes the session.
            if !peer.check(Duration::from_secs(RADIO_SILENCE_IN_SECS)) {
                debug!("Disconnecting from '{}' (radio silence)", peer.remote());
                self.on_peer_closed(&peer);
                continue;
            }
            // An insane peer follows a different ledger; drop it.
            if !peer.check_sanity(our_seq) {
                debug!("Disconnecting from '{}' (insane)", peer.remote());
                self.on_peer_closed(&peer);
                continue;
            }
            if ticks % PING_INTERVAL_IN_SECS == 0 {
                let ping = Message::Ping(Ping {
                    version: Message::VERSION,
                    ledger_seq: our_seq,
                    nonce: rand::thread_rng().gen(),
                });
                self.send(peer.id(), ping);
            }
        }

        // Gossip our view of the network now and then.
        if ticks > 0 && ticks % ENDPOINTS_INTERVAL_IN_SECS == 0 {
            let endpoints = self.finder.build_endpoints_for_peers();
            if !endpoints.is_empty() {
                self.broadcast(Message::Endpoints(Endpoints { endpoints }));
            }
        }
    }
}
