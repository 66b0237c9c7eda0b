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

mod common;
use common::*;

use tessera_account::Account;
use tessera_node_messages::Manifest;
use tessera_node_overlay::{ManifestDisposition, NullEvents, Overlay};

use deadline::deadline;
use indexmap::IndexSet;
use rand::rngs::OsRng;
use std::{sync::Arc, time::Duration};

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_with_handshake() {
    initialize_logger(1);

    // Create 2 overlays.
    let node0 = overlay(8).await;
    let node1 = overlay(8).await;
    assert_eq!(node0.size(), 0);
    assert_eq!(node1.size(), 0);

    // Connect node0 to node1.
    node0.connect(node1.local_ip());
    let node0_ = node0.clone();
    let node1_ = node1.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1 && node1_.size() == 1);

    // The handshake revealed each node's key to the other.
    assert_eq!(node0.peers()[0].node_key(), node1.account().node_key());
    assert_eq!(node1.peers()[0].node_key(), node0.account().node_key());

    // The slot table agrees with the session tables.
    assert_eq!(node0.finder().active_count(), 1);
    assert_eq!(node1.finder().active_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_connect_is_ignored() {
    initialize_logger(1);

    let node0 = overlay(8).await;
    let node1 = overlay(8).await;

    node0.connect(node1.local_ip());
    let node0_ = node0.clone();
    let node1_ = node1.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1 && node1_.size() == 1);

    // A second dial toward the same endpoint is refused at the slot table.
    node0.connect(node1.local_ip());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node0.size(), 1);
    assert_eq!(node1.size(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_self_connect_is_refused() {
    initialize_logger(1);

    let node = overlay(8).await;
    node.connect(node.local_ip());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node.size(), 0);
    assert_eq!(node.finder().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manifest_history_reaches_new_peers() {
    initialize_logger(1);

    // node0 trusts a validator master key and already holds its manifest.
    let master = Account::new(&mut OsRng);
    let signing = Account::new(&mut OsRng);
    let manifest = Manifest::new(&master, signing.node_key(), 3);
    let trusted: IndexSet<_> = [master.node_key()].into_iter().collect();

    let mut config = test_config(8);
    config.validator_keys = vec![master.node_key().to_string()];
    let node0 = Overlay::new(
        config,
        Account::new(&mut OsRng),
        Arc::new(MemoryStore::default()),
        Arc::new(NullEvents),
    )
    .unwrap();
    node0.run().await.unwrap();
    assert_eq!(node0.manifests().apply_manifest(&manifest, &trusted), ManifestDisposition::Accepted);

    // A fresh peer learns the rotation on connect, as history.
    let (node1, events) = overlay_with_events(8).await;
    node1.connect(node0.local_ip());
    let events_ = events.clone();
    deadline!(Duration::from_secs(5), move || !events_.manifests.lock().is_empty());

    let manifests = events.manifests.lock();
    assert_eq!(manifests[0].0, manifest);
}
