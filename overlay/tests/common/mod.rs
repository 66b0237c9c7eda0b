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

#![allow(dead_code)]

use tessera_account::Account;
use tessera_node_messages::{Manifest, MessageId, Proposal, Validation};
use tessera_node_overlay::{
    ManifestDisposition, ManifestStore, NullEvents, Overlay, OverlayConfig, OverlayEvents, PeerId,
};

use anyhow::Result;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::sync::Arc;

/// Initializes the logger once, at the requested verbosity.
pub fn initialize_logger(verbosity: u8) {
    match verbosity {
        0 => std::env::set_var("RUST_LOG", "info"),
        1 => std::env::set_var("RUST_LOG", "debug"),
        2.. => std::env::set_var("RUST_LOG", "trace"),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// An in-memory manifest table.
#[derive(Default)]
pub struct MemoryStore(Mutex<Vec<Vec<u8>>>);

impl ManifestStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.0.lock().clone())
    }

    fn save(&self, raw: &[u8]) -> Result<()> {
        self.0.lock().push(raw.to_vec());
        Ok(())
    }
}

/// An event sink that records what the overlay hands to the node.
#[derive(Default)]
pub struct RecordingEvents {
    pub proposals: Mutex<Vec<(PeerId, MessageId)>>,
    pub validations: Mutex<Vec<(PeerId, MessageId)>>,
    pub manifests: Mutex<Vec<(Manifest, ManifestDisposition)>>,
}

impl RecordingEvents {
    pub fn proposal_count(&self, uid: MessageId) -> usize {
        self.proposals.lock().iter().filter(|(_, id)| *id == uid).count()
    }
}

impl OverlayEvents for RecordingEvents {
    fn on_proposal(&self, from: PeerId, proposal: &Proposal) {
        self.proposals.lock().push((from, proposal.uid()));
    }

    fn on_validation(&self, from: PeerId, validation: &Validation) {
        self.validations.lock().push((from, validation.uid()));
    }

    fn on_manifest(&self, manifest: &Manifest, disposition: ManifestDisposition) {
        self.manifests.lock().push((manifest.clone(), disposition));
    }
}

/// A test configuration: ephemeral port, no autoconnect, no remote
/// bootstrap.
pub fn test_config(max_peers: usize) -> OverlayConfig {
    OverlayConfig {
        max_peers,
        auto_connect: false,
        listening_port: 0,
        ip_limit: 0,
        ips: vec!["127.0.0.1:1".to_string()],
        ..Default::default()
    }
}

/// Starts an overlay with a fresh account and a no-op event sink.
pub async fn overlay(max_peers: usize) -> Overlay {
    let account = Account::new(&mut OsRng);
    let overlay =
        Overlay::new(test_config(max_peers), account, Arc::new(MemoryStore::default()), Arc::new(NullEvents))
            .unwrap();
    overlay.run().await.unwrap();
    overlay
}

/// Starts an overlay wired to a recording event sink.
pub async fn overlay_with_events(max_peers: usize) -> (Overlay, Arc<RecordingEvents>) {
    let account = Account::new(&mut OsRng);
    let events = Arc::new(RecordingEvents::default());
    let overlay =
        Overlay::new(test_config(max_peers), account, Arc::new(MemoryStore::default()), events.clone())
            .unwrap();
    overlay.run().await.unwrap();
    (overlay, events)
}

/// A random proposal carrying the given hop count.
pub fn proposal(hops: Option<u8>) -> Proposal {
    let account = Account::new(&mut OsRng);
    Proposal {
        node_key: account.node_key(),
        propose_seq: 1,
        previous_ledger: rand::random(),
        position: rand::random(),
        close_time: 0,
        signature: account.sign(b"position").to_vec(),
        hops,
    }
}
