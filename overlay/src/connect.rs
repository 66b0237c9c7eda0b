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
    peer::Peer,
    peer_finder::{Activate, Direction, SlotId},
    tls, Consumer, HandshakeError, Overlay, SharedValue,
};

use anyhow::{bail, ensure, Result};
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::{net::SocketAddr, time::Duration};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tokio_rustls::TlsStream;

/// The watchdog applied to each stage of an outbound attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

impl Overlay {
    /// Initiates an outbound attempt toward the given endpoint. Silently
    /// ignored when out of slots, over the resource budget, or already in
    /// flight.
    pub fn connect(&self, endpoint: SocketAddr) {
        if self.is_closing() {
            return;
        }
        let consumer = self.resource.new_outbound_endpoint(endpoint.ip());
        if consumer.disconnect() {
            return;
        }
        if !self.connecting.lock().insert(endpoint) {
            return;
        }
        let Some(slot) = self.finder.new_outbound_slot(endpoint) else {
            self.connecting.lock().shift_remove(&endpoint);
            return;
        };

        let overlay = self.clone();
        let guard = self.register_child();
        let mut closing_rx = self.closing.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            debug!("Connecting to '{endpoint}'...");
            let result = tokio::select! {
                _ = closing_rx.wait_for(|closing| *closing) => Err(anyhow::anyhow!("shutting down")),
                result = overlay.connect_attempt(endpoint, slot, consumer) => result,
            };
            if let Err(error) = result {
                debug!("Unable to connect to '{endpoint}' - {error}");
                overlay.finder.on_closed(slot);
            }
            overlay.connecting.lock().shift_remove(&endpoint);
        });
    }

    /// Drives one outbound attempt end to end: TCP, TLS, HTTP upgrade, and
    /// handoff to a peer session.
    async fn connect_attempt(&self, endpoint: SocketAddr, slot: SlotId, consumer: Consumer) -> Result<()> {
        // Connecting.
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await??;
        let local = tcp.local_addr()?;
        ensure!(self.finder.on_connected(slot, local), "the endpoint is a duplicate or ourselves");

        // TLS handshake. The certificate is not the identity; the hello is.
        let server_name = ServerName::from(endpoint.ip());
        let tls = timeout(CONNECT_TIMEOUT, self.tls_connector.connect(server_name, tcp)).await??;
        let mut stream = TlsStream::Client(tls);

        // HTTP send: the upgrade request with our hello, signed over the
        // session's shared value.
        let shared = tls::shared_value(&stream)?;
        let hello = self.local_hello(&shared);
        let headers = handshake::upgrade_request_headers(&hello, self.config.crawl_public);
        timeout(CONNECT_TIMEOUT, stream.write_all(&http::encode_request("/", &headers))).await??;
        timeout(CONNECT_TIMEOUT, stream.flush()).await??;

        // HTTP receive.
        let (response, residue) = timeout(CONNECT_TIMEOUT, http::read_response(&mut stream)).await??;
        match response.status {
            101 => self.complete_outbound(endpoint, slot, stream, response, residue, &shared, consumer),
            503 => {
                // A refusal with suggestions still feeds the finder.
                self.absorb_redirects(&response);
                bail!("'{endpoint}' is full")
            }
            status => bail!("'{endpoint}' refused the upgrade ({status} {})", response.reason),
        }
    }

    /// Verifies the server's hello and hands the stream to a peer session.
    #[allow(clippy::too_many_arguments)]
    fn complete_outbound(
        &self,
        endpoint: SocketAddr,
        slot: SlotId,
        stream: TlsStream<TcpStream>,
        response: http::HttpResponse,
        residue: BytesMut,
        shared: &SharedValue,
        consumer: Consumer,
    ) -> Result<()> {
        let upgrade = response.header("Upgrade").ok_or(HandshakeError::Malformed("missing Upgrade"))?;
        let version = ProtocolVersion::negotiate(upgrade)?;

        let hello = Hello::from_headers(&response.headers)?;
        hello.verify(shared)?;
        if hello.node_key == self.account.node_key() {
            return Err(HandshakeError::SelfConnect.into());
        }

        let cluster = self.config.cluster_keys.contains(&hello.node_key);
        match self.finder.activate(slot, hello.node_key, cluster) {
            Activate::Success => (),
            Activate::Duplicate => return Err(HandshakeError::DuplicateNode.into()),
            Activate::Full => bail!("all slots are full"),
        }

        let direction = match self.finder.slot(slot).map(|slot| slot.direction) {
            Some(direction) => direction,
            None => Direction::Outbound,
        };
        let crawl = response.header("Crawl").is_some_and(|value| value.eq_ignore_ascii_case("public"));
        let user_agent = response.header("Server").map(str::to_string);

        let (peer, outbound_rx) = Peer::new(
            self.next_peer_id(),
            slot,
            hello.node_key,
            direction,
            endpoint,
            Some(endpoint),
            version,
            cluster,
            crawl,
            user_agent,
            consumer,
        );
        self.add_active(peer, stream, residue, outbound_rx)
    }

    /// Absorbs the `peer-ips` body of a 503 refusal into the boot cache.
    fn absorb_redirects(&self, response: &http::HttpResponse) {
        let Ok(body) = serde_json::from_slice::<serde_json::Value>(&response.body) else {
            return;
        };
        let Some(entries) = body.get("peer-ips").and_then(|value| value.as_array()) else {
            return;
        };
        let endpoints: Vec<SocketAddr> = entries
            .iter()
            .filter_map(|value| value.as_str())
            .filter_map(|entry| entry.parse().ok())
            .collect();
        debug!("Absorbing {} redirect endpoints", endpoints.len());
        self.finder.on_redirects(&endpoints);
    }
}
