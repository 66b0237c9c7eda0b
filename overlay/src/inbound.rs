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
    handshake::{self, http, Hello, ProtocolVersion},
    helpers::RELAYED,
    peer::Peer,
    peer_finder::{Activate, Direction, SlotId},
    tls, Consumer, HandshakeError, ManifestDisposition, Overlay,
};
use tessera_node_messages::{ManifestSet, Message, MessageId, Pong};

use anyhow::{bail, Result};
use bytes::BytesMut;
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsStream;

/// The watchdog applied to each stage of an inbound handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

impl Overlay {
    /// Handles one accepted connection through admission, handshake, and
    /// handoff to a peer session.
    pub(crate) async fn handle_inbound(&self, stream: TcpStream, remote: SocketAddr) {
        if let Err(error) = self.handle_inbound_inner(stream, remote).await {
            debug!("Dropping inbound connection from '{remote}' - {error}");
        }
    }

    async fn handle_inbound_inner(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        // Admission budget first; refused sources are not worth a TLS
        // handshake.
        let consumer = self.resource.new_inbound_endpoint(remote.ip());
        if consumer.disconnect() {
            bail!("over the resource limit");
        }

        let tls = timeout(HANDSHAKE_TIMEOUT, self.tls_acceptor.accept(stream)).await??;
        let mut stream = TlsStream::Server(tls);
        let (request, residue) = timeout(HANDSHAKE_TIMEOUT, http::read_request(&mut stream)).await??;

        // Admin route: /crawl answers with the active-peer document.
        if request.target == "/crawl" {
            let body = serde_json::to_vec(&self.crawl())?;
            let headers = [("Content-Type".to_string(), "application/json".to_string())];
            stream.write_all(&http::encode_response(200, "OK", &headers, &body)).await?;
            stream.shutdown().await?;
            return Ok(());
        }

        // Peer-upgrade detection; anything else is not ours.
        let Some(upgrade) = request.header("Upgrade").map(str::to_string) else {
            stream.write_all(&http::encode_response(404, "Not Found", &[], b"")).await?;
            stream.shutdown().await?;
            return Ok(());
        };

        // Strict request validation.
        if request.method != "GET" {
            stream.write_all(&http::encode_response(400, "Bad Request", &[], b"only GET is accepted")).await?;
            stream.shutdown().await?;
            bail!("upgrade with method '{}'", request.method);
        }
        if request.header("Transfer-Encoding").is_some() {
            stream.write_all(&http::encode_response(400, "Bad Request", &[], b"no body is accepted")).await?;
            stream.shutdown().await?;
            bail!("upgrade with a transfer encoding");
        }

        // Reserve a slot. A refusal here (self-connect, per-IP cap, inbound
        // disabled) drops the connection without a response.
        let local = stream.get_ref().0.local_addr()?;
        let Some(slot) = self.finder.new_inbound_slot(local, remote) else {
            bail!("no inbound slot");
        };

        // From here on the slot is charged; every failure must release it.
        let result = self.finish_inbound(stream, request, residue, remote, slot, upgrade, consumer).await;
        if result.is_err() {
            self.finder.on_closed(slot);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_inbound(
        &self,
        mut stream: TlsStream<TcpStream>,
        request: http::HttpRequest,
        residue: BytesMut,
        remote: SocketAddr,
        slot: SlotId,
        upgrade: String,
        consumer: Consumer,
    ) -> Result<()> {
        // `Connect-As` is compared case-insensitively; unknown values earn a
        // redirect so the client can try elsewhere.
        match request.header("Connect-As") {
            Some(value) if value.eq_ignore_ascii_case("peer") => (),
            _ => {
                self.respond_redirect(&mut stream, remote, slot).await?;
                bail!("missing or unknown Connect-As");
            }
        }

        let version = match ProtocolVersion::negotiate(&upgrade) {
            Ok(version) => version,
            Err(error) => {
                stream
                    .write_all(&http::encode_response(400, "Bad Request", &[], error.to_string().as_bytes()))
                    .await?;
                stream.shutdown().await?;
                return Err(error.into());
            }
        };

        // Handshake verification: shared value, hello, proof of possession.
        let shared = tls::shared_value(&stream)?;
        let hello = match Hello::from_headers(&request.headers) {
            Ok(hello) => hello,
            Err(error) => {
                stream
                    .write_all(&http::encode_response(400, "Bad Request", &[], error.to_string().as_bytes()))
                    .await?;
                stream.shutdown().await?;
                return Err(error.into());
            }
        };
        hello.verify(&shared)?;

        // A hello signed with our own key is a self-connect; drop without a
        // response so the dialer cannot learn anything from it.
        if hello.node_key == self.account.node_key() {
            return Err(HandshakeError::SelfConnect.into());
        }

        if let Some(port) = hello.listening_port {
            self.finder.set_listening_port(slot, port);
        }

        // Final admission gate.
        let cluster = self.config.cluster_keys.contains(&hello.node_key);
        match self.finder.activate(slot, hello.node_key, cluster) {
            Activate::Success => (),
            Activate::Duplicate => {
                self.respond_redirect(&mut stream, remote, slot).await?;
                return Err(HandshakeError::DuplicateNode.into());
            }
            Activate::Full => {
                self.respond_redirect(&mut stream, remote, slot).await?;
                bail!("all slots are full");
            }
        }

        // Admission: answer with 101 and our own hello over the same shared
        // value, then hand the stream to a peer session.
        let our_hello = self.local_hello(&shared);
        let headers = handshake::upgrade_response_headers(&our_hello, self.config.crawl_public, version);
        timeout(
            HANDSHAKE_TIMEOUT,
            stream.write_all(&http::encode_response(101, "Switching Protocols", &headers, b"")),
        )
        .await??;
        timeout(HANDSHAKE_TIMEOUT, stream.flush()).await??;

        let crawl = request.header("Crawl").is_some_and(|value| value.eq_ignore_ascii_case("public"));
        let user_agent = request.header("User-Agent").map(str::to_string);
        let listening = hello
            .listening_port
            .filter(|port| *port != 0)
            .map(|port| SocketAddr::new(remote.ip(), port));

        let (peer, outbound_rx) = Peer::new(
            self.next_peer_id(),
            slot,
            hello.node_key,
            Direction::Inbound,
            remote,
            listening,
            version,
            cluster,
            crawl,
            user_agent,
            consumer,
        );
        self.add_active(peer, stream, residue, outbound_rx)
    }

    /// Answers a refused client with `503 Service Unavailable` and a short
    /// list of alternate peers to try.
    async fn respond_redirect(
        &self,
        stream: &mut TlsStream<TcpStream>,
        remote: SocketAddr,
        slot: SlotId,
    ) -> Result<()> {
        let peer_ips: Vec<String> =
            self.finder.redirect(slot).into_iter().map(|endpoint| endpoint.to_string()).collect();
        let body = serde_json::to_vec(&serde_json::json!({ "peer-ips": peer_ips }))?;
        let headers = [
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Remote-Address".to_string(), remote.ip().to_string()),
        ];
        stream.write_all(&http::encode_response(503, "Service Unavailable", &headers, &body)).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Handles one decoded message from a peer session. An error fails the
    /// offending session only.
    pub(crate) async fn inbound(&self, peer: &Peer, message: Message) -> Result<()> {
        self.report_traffic(&message, true);
        trace!("Received '{}' from '{}'", message.name(), peer.remote());

        match message {
            Message::Ping(ping) => {
                if ping.ledger_seq != 0 {
                    peer.set_claimed_ledger_seq(ping.ledger_seq);
                }
                let ours = self.latest_ledger_seq();
                if !peer.check_sanity(ours) {
                    bail!("peer diverged to ledger {} while we are at {ours}", ping.ledger_seq);
                }
                peer.enqueue(Message::Pong(Pong { nonce: ping.nonce }))?;
                Ok(())
            }
            Message::Pong(..) => Ok(()),
            Message::Endpoints(endpoints) => {
                self.finder.on_redirects(&endpoints.endpoints);
                Ok(())
            }
            Message::Proposal(proposal) => {
                let uid = proposal.uid();
                peer.note_tx_set(proposal.position);
                self.events.on_proposal(peer.id(), &proposal);
                self.relay_inbound(peer, Message::Proposal(proposal), uid);
                Ok(())
            }
            Message::Validation(validation) => {
                let uid = validation.uid();
                peer.note_ledger(validation.ledger_hash);
                self.events.on_validation(peer.id(), &validation);
                self.relay_inbound(peer, Message::Validation(validation), uid);
                Ok(())
            }
            Message::ManifestSet(set) => {
                self.handle_manifests(peer, set);
                Ok(())
            }
        }
    }

    /// Relays an inbound message onward, honoring the hop-count TTL and the
    /// suppression table.
    fn relay_inbound(&self, peer: &Peer, message: Message, uid: MessageId) {
        if let Some(hops) = message.hops() {
            // Past the TTL the message is consumed locally but goes no
            // further.
            if hops >= self.config.max_ttl {
                trace!("Not relaying '{uid}' (hops = {hops})");
                return;
            }
        }

        let mut skip = HashSet::from([peer.id()]);
        if !self.hash_router.swap_set(uid, &mut skip, RELAYED) {
            return;
        }
        self.relay(message, uid, &skip);
    }

    /// Applies each manifest of a set and re-announces the accepted ones.
    fn handle_manifests(&self, peer: &Peer, set: ManifestSet) {
        let history = set.history;
        for manifest in set.manifests {
            let disposition = self.manifests.apply_manifest(&manifest, &self.trusted_validators);
            self.events.on_manifest(&manifest, disposition);
            match disposition {
                ManifestDisposition::Accepted => {
                    // Write-through before re-announcing.
                    if let Err(error) = self.manifests.save(&*self.store, &manifest) {
                        warn!("Unable to persist a manifest for '{}' - {error}", manifest.master_key);
                    }
                    if !history {
                        let uid = manifest.uid();
                        let mut skip = HashSet::from([peer.id()]);
                        if self.hash_router.swap_set(uid, &mut skip, RELAYED) {
                            let announce = ManifestSet { manifests: vec![manifest], history: false };
                            self.relay(Message::ManifestSet(announce), uid, &skip);
                        }
                    }
                }
                ManifestDisposition::Untrusted => {
                    debug!("Holding an untrusted manifest for '{}'", manifest.master_key);
                }
                ManifestDisposition::Stale => {
                    trace!("Dropping a stale manifest for '{}'", manifest.master_key);
                }
                ManifestDisposition::Invalid => {
                    debug!("Dropping an invalid manifest from '{}'", peer.remote());
                }
            }
        }
    }

    /// The sequence of our latest closed ledger, or 0 when none is known.
    pub(crate) fn latest_ledger_seq(&self) -> u64 {
        self.events.latest_ledger().map_or(0, |(seq, _)| seq)
    }
}
