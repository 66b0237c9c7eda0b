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

#![forbid(unsafe_code)]

#[macro_use]
extern crate tracing;

mod config;
pub use config::{ConfigError, OverlayConfig};

mod connect;

mod crawl;

pub mod handshake;
pub use handshake::{HandshakeError, Hello, ProtocolVersion, SharedValue};

mod heartbeat;

mod helpers;
pub use helpers::*;

mod inbound;

mod outbound;

mod peer;
pub use peer::{Peer, PeerId};

mod peer_finder;
pub use peer_finder::{Activate, Direction, PeerFinder, Slot, SlotId, SlotState};

pub mod tls;

use tessera_account::{Account, NodeKey};
use tessera_node_messages::{Manifest, ManifestSet, Message, Proposal, Validation};

use anyhow::{bail, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::BytesMut;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use std::{
    net::SocketAddr,
    ops::Deref,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// The hooks through which the overlay hands inbound traffic to the rest of
/// the node, and learns what the node would advertise.
pub trait OverlayEvents: Send + Sync {
    /// The sequence and hash of the latest closed ledger, when one is known.
    fn latest_ledger(&self) -> Option<(u64, [u8; 32])> {
        None
    }
    /// A proposal arrived and passed overlay-level checks.
    fn on_proposal(&self, _from: PeerId, _proposal: &Proposal) {}
    /// A validation arrived and passed overlay-level checks.
    fn on_validation(&self, _from: PeerId, _validation: &Validation) {}
    /// A manifest was applied to the cache with the given disposition.
    fn on_manifest(&self, _manifest: &Manifest, _disposition: ManifestDisposition) {}
    /// A peer session became active.
    fn on_peer_activated(&self, _peer: &Peer) {}
    /// A peer session ended.
    fn on_peer_deactivated(&self, _peer: &Peer) {}
}

/// A no-op event sink for nodes that wire the hooks up later.
pub struct NullEvents;

impl OverlayEvents for NullEvents {}

#[derive(Clone)]
pub struct Overlay(Arc<InnerOverlay>);

impl Deref for Overlay {
    type Target = Arc<InnerOverlay>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct InnerOverlay {
    /// The overlay configuration.
    config: OverlayConfig,
    /// The signing identity of the node.
    account: Account,
    /// The slot table and endpoint bookkeeping.
    finder: PeerFinder,
    /// The per-source admission budget and traffic books.
    resource: ResourceManager,
    /// The relay suppression table.
    hash_router: HashRouter,
    /// The validator-key rotation records.
    manifests: ManifestCache,
    /// The trusted validator master keys.
    trusted_validators: IndexSet<NodeKey>,
    /// The manifest persistence hook.
    store: Arc<dyn ManifestStore>,
    /// The hooks into the rest of the node.
    events: Arc<dyn OverlayEvents>,
    /// The TLS acceptor for inbound connections.
    tls_acceptor: TlsAcceptor,
    /// The TLS connector for outbound attempts.
    tls_connector: TlsConnector,
    /// The peer sessions, keyed by slot.
    peers: RwLock<IndexMap<SlotId, Peer>>,
    /// The peer sessions, keyed by short id.
    ids: RwLock<IndexMap<PeerId, Peer>>,
    /// The endpoints with an outbound attempt in flight. Prevents
    /// simultaneous two-way dials toward the same endpoint.
    connecting: Mutex<IndexSet<SocketAddr>>,
    /// The source of short ids.
    next_peer_id: AtomicU32,
    /// The live children: peer pumps, connect attempts, inbound handshakes.
    children: Arc<ChildTracker>,
    /// The long-running task handles (listener, heartbeat).
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// The shutdown signal. Set under the `peers` write lock so that
    /// `add_active` cannot race a missed entry.
    closing: watch::Sender<bool>,
}

impl Overlay {
    /// Initializes a new overlay. Fails on configuration errors; the node
    /// must not come up with an invalid overlay section.
    pub fn new(
        config: OverlayConfig,
        account: Account,
        store: Arc<dyn ManifestStore>,
        events: Arc<dyn OverlayEvents>,
    ) -> Result<Self> {
        config.validate()?;
        let trusted_validators = ManifestCache::load_validator_keys(&config.validator_keys)?;

        // Seed the manifest cache: the configured manifest first, then every
        // persisted row.
        let manifests = ManifestCache::new();
        if let Some(blob) = &config.validation_manifest {
            let raw = BASE64_STANDARD.decode(blob).map_err(|_| ConfigError::InvalidManifest)?;
            let manifest = Manifest::from_bytes(&raw).map_err(|_| ConfigError::InvalidManifest)?;
            manifests.config_manifest(manifest, &trusted_validators)?;
        }
        manifests.load(&*store, &trusted_validators)?;

        // The peer TLS identity is ephemeral; authentication rides on the
        // hello signature.
        let (certs, key) = tls::ephemeral_identity()?;
        let tls_acceptor = TlsAcceptor::from(Arc::new(tls::server_config(certs, key)?));
        let tls_connector = TlsConnector::from(Arc::new(tls::client_config()));

        let finder = PeerFinder::new(&config);
        let resource = ResourceManager::new(config.ip_limit.max(0) as usize);
        let (closing, _) = watch::channel(false);

        Ok(Self(Arc::new(InnerOverlay {
            config,
            account,
            finder,
            resource,
            hash_router: HashRouter::default(),
            manifests,
            trusted_validators,
            store,
            events,
            tls_acceptor,
            tls_connector,
            peers: Default::default(),
            ids: Default::default(),
            connecting: Default::default(),
            next_peer_id: AtomicU32::new(0),
            children: Arc::new(ChildTracker::default()),
            handles: Default::default(),
            closing,
        })))
    }

    /// Runs the overlay: binds the listener, seeds the finder from the
    /// configured endpoints, and starts the 1-Hz timer.
    pub async fn run(&self) -> Result<()> {
        // Resolve the configured endpoints once, at startup.
        let fixed = resolve_endpoints(&self.config.ips_fixed).await;
        self.finder.add_fixed_peers(&fixed);
        let bootstrap = resolve_endpoints(&self.config.bootstrap_ips()).await;
        self.finder.on_redirects(&bootstrap);

        self.enable_listener().await?;
        self.initialize_heartbeat();
        Ok(())
    }

    /// Binds the peer listener and starts accepting connections.
    async fn enable_listener(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listening_port)).await?;
        let local = listener.local_addr()?;
        let public = self.config.public_ip.map(|ip| SocketAddr::new(ip.into(), local.port()));
        self.finder.set_local_endpoint(local, public);
        info!("Started the overlay listener at '{local}'");

        let overlay = self.clone();
        self.handles.lock().push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if overlay.is_closing() {
                            break;
                        }
                        let overlay_ = overlay.clone();
                        let guard = overlay.register_child();
                        let mut closing_rx = overlay.closing.subscribe();
                        tokio::spawn(async move {
                            let _guard = guard;
                            tokio::select! {
                                _ = closing_rx.wait_for(|closing| *closing) => (),
                                _ = overlay_.handle_inbound(stream, remote) => (),
                            }
                        });
                    }
                    Err(error) => {
                        warn!("Failed to accept a connection - {error}");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        }));
        Ok(local)
    }

    /// Returns the configuration of the overlay.
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Returns the account of the node.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Returns the peer finder.
    pub fn finder(&self) -> &PeerFinder {
        &self.finder
    }

    /// Returns the resource manager.
    pub fn resource(&self) -> &ResourceManager {
        &self.resource
    }

    /// Returns the manifest cache.
    pub fn manifests(&self) -> &ManifestCache {
        &self.manifests
    }

    /// Returns the bound listening endpoint.
    pub fn local_ip(&self) -> SocketAddr {
        self.finder.local_endpoint().expect("The overlay listener is not enabled")
    }

    /// Returns the number of active peer sessions.
    pub fn size(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns the maximum number of peer sessions.
    pub fn limit(&self) -> usize {
        self.finder.limit()
    }

    /// Returns the active peer with the given short id.
    pub fn peer(&self, id: PeerId) -> Option<Peer> {
        self.ids.read().get(&id).cloned()
    }

    /// Returns a snapshot of the active peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    /// Scores every active peer with the given function and returns up to
    /// `limit` peers, best first. Ties keep insertion order.
    pub fn select_peers(&self, limit: usize, score: impl Fn(&Peer) -> u64) -> Vec<Peer> {
        let mut peers = self.peers();
        // A stable sort preserves insertion order between equal scores.
        peers.sort_by_key(|peer| std::cmp::Reverse(score(peer)));
        peers.truncate(limit);
        peers
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Registers a child with the shutdown tracker.
    pub(crate) fn register_child(&self) -> ChildGuard {
        self.children.register()
    }

    /// The number of live children; zero once shutdown completes.
    pub fn num_children(&self) -> usize {
        self.children.count()
    }

    /// Assigns the next short id.
    pub(crate) fn next_peer_id(&self) -> PeerId {
        PeerId(self.next_peer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Builds our hello for the given session.
    pub(crate) fn local_hello(&self, shared: &SharedValue) -> Hello {
        Hello::new(
            &self.account,
            shared,
            self.config.public_ip,
            self.finder.local_endpoint().map(|endpoint| endpoint.port()),
            self.events.latest_ledger(),
            self.config.cluster_name.clone(),
        )
    }

    /// Registers a fully handshaked peer and starts its pumps.
    ///
    /// The insertion and the pump start happen under the peer-table write
    /// lock: `shut_down` flips the closing flag under the same lock, so a
    /// peer is either registered before the shutdown sweep or refused here.
    pub(crate) fn add_active(
        &self,
        peer: Peer,
        stream: TlsStream<TcpStream>,
        residue: BytesMut,
        outbound_rx: mpsc::Receiver<Message>,
    ) -> Result<()> {
        {
            let mut peers = self.peers.write();
            if self.is_closing() {
                bail!("the overlay is shutting down");
            }
            peers.insert(peer.slot(), peer.clone());
            self.ids.write().insert(peer.id(), peer.clone());
            peer.run(self.clone(), stream, residue, outbound_rx);
        }

        info!("Connected to '{}' as '{}'", peer.remote(), peer.node_key());
        self.events.on_peer_activated(&peer);

        // Bring the new peer up to date on validator-key rotations.
        let manifests = self.manifests.manifests();
        if !manifests.is_empty() {
            let _ = peer.enqueue(Message::ManifestSet(ManifestSet { manifests, history: true }));
        }
        Ok(())
    }

    /// Tears down a peer session. Idempotent; the first caller releases the
    /// slot and notifies the node.
    pub(crate) fn on_peer_closed(&self, peer: &Peer) {
        peer.close();
        let removed = self.peers.write().shift_remove(&peer.slot());
        if removed.is_some() {
            self.ids.write().shift_remove(&peer.id());
            self.finder.on_closed(peer.slot());
            debug!("Disconnected from '{}'", peer.remote());
            self.events.on_peer_deactivated(peer);
        }
    }

    /// Closes the session of the given peer, if it is active.
    pub fn disconnect(&self, id: PeerId) {
        if let Some(peer) = self.peer(id) {
            peer.close();
        }
    }

    /// Shuts the overlay down: refuses new work, winds down every child, and
    /// returns once no asynchronous operation remains.
    pub async fn shut_down(&self) {
        info!("Shutting down the overlay...");

        // Flip the closing flag under the peer-table lock, then sweep.
        let peers: Vec<Peer> = {
            let peers = self.peers.write();
            self.closing.send_replace(true);
            peers.values().cloned().collect()
        };
        // Stop the listener and the timer.
        self.handles.lock().drain(..).for_each(|handle| handle.abort());
        // Wind down every session; pumps remove themselves as they exit.
        for peer in peers {
            peer.close();
        }
        // Block until the children table drains.
        self.children.quiesce().await;
    }

    /// Measures and records one message of traffic.
    pub(crate) fn report_traffic(&self, message: &Message, inbound: bool) {
        let category = match message {
            Message::Proposal(..) => TrafficCategory::Proposal,
            Message::Validation(..) => TrafficCategory::Validation,
            Message::ManifestSet(..) => TrafficCategory::Manifests,
            Message::Endpoints(..) => TrafficCategory::Endpoints,
            _ => TrafficCategory::Base,
        };
        let mut raw = Vec::new();
        if message.serialize(&mut raw).is_ok() {
            self.resource.report_traffic(category, inbound, raw.len() as u64);
        }
    }
}

/// Resolves the configured endpoint strings, skipping any that fail.
async fn resolve_endpoints(entries: &[String]) -> Vec<SocketAddr> {
    let mut endpoints = Vec::with_capacity(entries.len());
    for entry in entries {
        match tokio::net::lookup_host(entry.as_str()).await {
            Ok(resolved) => endpoints.extend(resolved),
            Err(error) => warn!("Unable to resolve '{entry}' - {error}"),
        }
    }
    endpoints
}

/// Counts the live children and lets shutdown block until they drain.
#[derive(Default)]
pub(crate) struct ChildTracker {
    count: AtomicUsize,
    drained: Notify,
}

impl ChildTracker {
    fn register(self: &Arc<Self>) -> ChildGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ChildGuard(self.clone())
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn quiesce(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            // Register interest before the check, or a guard dropped in
            // between would notify nobody.
            drained.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

pub(crate) struct ChildGuard(Arc<ChildTracker>);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}
