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

use crate::{
    handshake::ProtocolVersion,
    helpers::Consumer,
    peer_finder::{Direction, SlotId},
    Overlay,
};
use tessera_account::NodeKey;
use tessera_node_messages::{Message, MessageCodec};

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::{
    fmt,
    net::SocketAddr,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_rustls::TlsStream;
use tokio_util::codec::{Framed, FramedParts};

/// The capacity of the per-peer outbound queue. A full queue closes the
/// session rather than growing without bound.
const MESSAGE_QUEUE_DEPTH: usize = 256;
/// The number of recently seen ledger or transaction-set hashes remembered
/// per peer.
const RECENT_HASHES: usize = 128;
/// How far a peer's claimed ledger sequence may diverge from ours before the
/// peer is considered insane.
const SANITY_DIVERGENCE: u64 = 200;

/// A monotonically assigned short id for one peer session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

/// A long-lived full-duplex session with a handshaked peer: one read pump,
/// one write pump draining a bounded FIFO, and the per-peer liveness state.
#[derive(Clone)]
pub struct Peer(Arc<InnerPeer>);

impl Deref for Peer {
    type Target = InnerPeer;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct InnerPeer {
    id: PeerId,
    slot: SlotId,
    node_key: NodeKey,
    direction: Direction,
    remote: SocketAddr,
    /// The endpoint other nodes can dial, when the peer advertises one.
    listening: Option<SocketAddr>,
    version: ProtocolVersion,
    cluster: bool,
    /// Whether the peer opted into crawl disclosure.
    crawl: bool,
    user_agent: Option<String>,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    claimed_ledger_seq: AtomicU64,
    insane: AtomicBool,
    recent_ledgers: Mutex<IndexSet<[u8; 32]>>,
    recent_tx_sets: Mutex<IndexSet<[u8; 32]>>,
    outbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
    /// The admission charge for this connection; released on teardown.
    _resource: Consumer,
}

impl Peer {
    /// Initializes a new peer session, returning the receiving end of its
    /// outbound queue for the write pump.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: PeerId,
        slot: SlotId,
        node_key: NodeKey,
        direction: Direction,
        remote: SocketAddr,
        listening: Option<SocketAddr>,
        version: ProtocolVersion,
        cluster: bool,
        crawl: bool,
        user_agent: Option<String>,
        resource: Consumer,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let (closed, _) = watch::channel(false);
        let peer = Self(Arc::new(InnerPeer {
            id,
            slot,
            node_key,
            direction,
            remote,
            listening,
            version,
            cluster,
            crawl,
            user_agent,
            connected_at: Instant::now(),
            last_seen: Mutex::new(Instant::now()),
            claimed_ledger_seq: AtomicU64::new(0),
            insane: AtomicBool::new(false),
            recent_ledgers: Default::default(),
            recent_tx_sets: Default::default(),
            outbound,
            closed,
            _resource: resource,
        }));
        (peer, rx)
    }

    /// Returns the short id of the peer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Returns the slot the peer occupies.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Returns the node key of the peer.
    pub fn node_key(&self) -> NodeKey {
        self.node_key
    }

    /// Returns the direction of the peer's slot.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the transport endpoint of the peer.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Returns the advertised listening endpoint of the peer, if any.
    pub fn listening(&self) -> Option<SocketAddr> {
        self.listening
    }

    /// Returns the negotiated protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Returns `true` if the peer understands hop counts.
    pub fn is_hop_aware(&self) -> bool {
        self.version.is_hop_aware()
    }

    /// Returns `true` if the peer is a member of our trusted cluster.
    pub fn is_cluster(&self) -> bool {
        self.cluster
    }

    /// Returns `true` if the peer opted into crawl disclosure.
    pub fn is_crawl_public(&self) -> bool {
        self.crawl
    }

    /// Returns the self-reported build of the peer.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Returns how long the session has been up.
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queues a message for delivery to the peer.
    ///
    /// Fails when the bounded queue is full; the caller must treat this as
    /// fatal for the session.
    pub(crate) fn enqueue(&self, message: Message) -> Result<()> {
        self.outbound
            .try_send(message)
            .map_err(|error| anyhow!("send queue overflow to '{}' ({error})", self.remote))
    }

    /// Signals both pumps to wind down; the socket closes once they exit.
    pub(crate) fn close(&self) {
        let _ = self.closed.send(true);
    }

    /// Records activity from the peer.
    pub(crate) fn seen(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Records the ledger sequence the peer last claimed.
    pub(crate) fn set_claimed_ledger_seq(&self, seq: u64) {
        self.claimed_ledger_seq.store(seq, Ordering::Relaxed);
    }

    /// Returns `true` if the peer has shown activity within the given window.
    pub fn check(&self, radio_silence: Duration) -> bool {
        self.last_seen.lock().elapsed() <= radio_silence
    }

    /// Checks the peer's claimed ledger sequence against ours. A peer that
    /// diverges too far is marked insane; the verdict is sticky.
    pub fn check_sanity(&self, our_seq: u64) -> bool {
        let claimed = self.claimed_ledger_seq.load(Ordering::Relaxed);
        if claimed != 0 && our_seq != 0 && claimed.abs_diff(our_seq) > SANITY_DIVERGENCE {
            self.insane.store(true, Ordering::Relaxed);
        }
        !self.insane.load(Ordering::Relaxed)
    }

    /// Returns `true` if the peer has announced the given ledger hash.
    pub fn has_ledger(&self, hash: &[u8; 32]) -> bool {
        self.recent_ledgers.lock().contains(hash)
    }

    /// Returns `true` if the peer has announced the given transaction set.
    pub fn has_tx_set(&self, hash: &[u8; 32]) -> bool {
        self.recent_tx_sets.lock().contains(hash)
    }

    /// Records a ledger hash announced by the peer.
    pub(crate) fn note_ledger(&self, hash: [u8; 32]) {
        Self::note(&self.recent_ledgers, hash);
    }

    /// Records a transaction-set hash announced by the peer.
    pub(crate) fn note_tx_set(&self, hash: [u8; 32]) {
        Self::note(&self.recent_tx_sets, hash);
    }

    fn note(set: &Mutex<IndexSet<[u8; 32]>>, hash: [u8; 32]) {
        let mut set = set.lock();
        if set.insert(hash) && set.len() > RECENT_HASHES {
            set.shift_remove_index(0);
        }
    }

    /// Scores the peer for fan-out selection: cluster members first, then by
    /// uptime.
    pub fn score(&self) -> u64 {
        let uptime = self.uptime().as_secs().min(u32::MAX as u64);
        ((self.cluster as u64) << 32) | uptime
    }

    /// Starts the read and write pumps over the given stream. Bytes already
    /// read past the HTTP upgrade are handed over as the initial read buffer
    /// so no frame is lost.
    pub(crate) fn run(
        &self,
        overlay: Overlay,
        stream: TlsStream<TcpStream>,
        residue: BytesMut,
        mut outbound_rx: mpsc::Receiver<Message>,
    ) {
        let mut parts = FramedParts::new::<Message>(stream, MessageCodec::default());
        parts.read_buf = residue;
        let framed = Framed::from_parts(parts);
        let (mut sink, mut source) = framed.split();

        // The write pump: drain the bounded queue one message at a time.
        let peer = self.clone();
        let overlay_ = overlay.clone();
        let guard = overlay.register_child();
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            while !*closed_rx.borrow() {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        overlay_.report_traffic(&message, false);
                        trace!("Sending '{}' to '{}'", message.name(), peer.remote());
                        // A backpressured write must not outlive the session.
                        tokio::select! {
                            _ = closed_rx.changed() => break,
                            result = sink.send(message) => {
                                if let Err(error) = result {
                                    trace!("Failed to send a message to '{}' - {error}", peer.remote());
                                    overlay_.on_peer_closed(&peer);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        // The read pump: exactly one outstanding read at a time.
        let peer = self.clone();
        let guard = overlay.register_child();
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            while !*closed_rx.borrow() {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    result = source.next() => match result {
                        Some(Ok(message)) => {
                            peer.seen();
                            if let Err(error) = overlay.inbound(&peer, message).await {
                                warn!("Disconnecting from '{}' - {error}", peer.remote());
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            debug!("Lost connection to '{}' - {error}", peer.remote());
                            break;
                        }
                        None => break,
                    }
                }
            }
            overlay.on_peer_closed(&peer);
        });
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("node_key", &self.node_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_account::Account;
    use tessera_node_messages::Ping;

    use crate::helpers::ResourceManager;
    use rand::rngs::OsRng;

    fn consumer() -> Consumer {
        ResourceManager::new(0).new_inbound_endpoint("198.51.100.1".parse().unwrap())
    }

    fn peer() -> (Peer, mpsc::Receiver<Message>) {
        Peer::new(
            PeerId(1),
            SlotId(1),
            Account::new(&mut OsRng).node_key(),
            Direction::Inbound,
            "198.51.100.1:50000".parse().unwrap(),
            Some("198.51.100.1:2459".parse().unwrap()),
            ProtocolVersion::CURRENT,
            false,
            true,
            None,
            consumer(),
        )
    }

    #[test]
    fn test_queue_overflow_is_fatal() {
        let (peer, _rx) = peer();
        let ping = Message::Ping(Ping { version: 1, ledger_seq: 0, nonce: 0 });
        for _ in 0..MESSAGE_QUEUE_DEPTH {
            peer.enqueue(ping.clone()).unwrap();
        }
        assert!(peer.enqueue(ping).is_err());
    }

    #[test]
    fn test_sanity_is_sticky() {
        let (peer, _rx) = peer();
        assert!(peer.check_sanity(1000));

        peer.set_claimed_ledger_seq(5000);
        assert!(!peer.check_sanity(1000));

        // Even after the claim converges, the verdict stands.
        peer.set_claimed_ledger_seq(1000);
        assert!(!peer.check_sanity(1000));
    }

    #[test]
    fn test_recent_hashes_are_bounded() {
        let (peer, _rx) = peer();
        for n in 0..(RECENT_HASHES + 10) {
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&(n as u64).to_le_bytes());
            peer.note_ledger(hash);
        }
        assert!(!peer.has_ledger(&{
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&0u64.to_le_bytes());
            hash
        }));
        let mut last = [0u8; 32];
        last[..8].copy_from_slice(&((RECENT_HASHES + 9) as u64).to_le_bytes());
        assert!(peer.has_ledger(&last));
    }

    #[test]
    fn test_score_prefers_cluster_members() {
        let (member, _rx) = Peer::new(
            PeerId(2),
            SlotId(2),
            Account::new(&mut OsRng).node_key(),
            Direction::Outbound,
            "198.51.100.2:2459".parse().unwrap(),
            None,
            ProtocolVersion::CURRENT,
            true,
            false,
            None,
            consumer(),
        );
        let (stranger, _rx) = peer();
        assert!(member.score() > stranger.score());
    }
}
