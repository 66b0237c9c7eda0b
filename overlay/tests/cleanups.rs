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

use deadline::deadline;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_shut_down_drains_all_children() {
    initialize_logger(1);

    // Two active peers and one in-flight outbound attempt.
    let node0 = overlay(8).await;
    let node1 = overlay(8).await;
    let node2 = overlay(8).await;
    node1.connect(node0.local_ip());
    node2.connect(node0.local_ip());
    let node0_ = node0.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 2);

    // TEST-NET-3 does not answer; the attempt sits in its watchdog.
    node0.connect("203.0.113.7:2459".parse().unwrap());

    // Shutdown returns in bounded time with no children left.
    tokio::time::timeout(Duration::from_secs(10), node0.shut_down()).await.unwrap();
    assert_eq!(node0.size(), 0);
    assert_eq!(node0.num_children(), 0);
    assert!(node0.is_closing());

    // The peers observe the loss and release their slots.
    let node1_ = node1.clone();
    let node2_ = node2.clone();
    deadline!(Duration::from_secs(5), move || node1_.size() == 0 && node2_.size() == 0);
    assert_eq!(node1.finder().active_count(), 0);
    assert_eq!(node2.finder().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_disconnect_releases_the_slot() {
    initialize_logger(1);

    let node0 = overlay(8).await;
    let node1 = overlay(8).await;
    node1.connect(node0.local_ip());
    let node0_ = node0.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1);

    // node1 closes the session; node0 releases the slot and the endpoint
    // becomes reusable.
    let peer = node1.peers()[0].id();
    node1.disconnect(peer);

    let node0_ = node0.clone();
    let node1_ = node1.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 0 && node1_.size() == 0);
    assert_eq!(node0.finder().active_count(), 0);

    // Reconnecting works: the closed slot no longer claims the endpoint.
    node1.connect(node0.local_ip());
    let node0_ = node0.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connects_are_refused_after_shutdown() {
    initialize_logger(1);

    let node0 = overlay(8).await;
    let node1 = overlay(8).await;
    node0.shut_down().await;

    node0.connect(node1.local_ip());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(node0.size(), 0);
    assert_eq!(node0.num_children(), 0);
}
