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
use tessera_node_overlay::{
    handshake::{self, http, Hello},
    tls,
};

use deadline::deadline;
use rand::rngs::OsRng;
use rustls::pki_types::ServerName;
use std::{sync::Arc, time::Duration};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_rustls::{TlsConnector, TlsStream};

#[tokio::test(flavor = "multi_thread")]
async fn test_full_slots_feed_the_boot_cache() {
    initialize_logger(1);

    // node0 admits a single peer.
    let node0 = overlay(1).await;
    let node1 = overlay(8).await;
    let node2 = overlay(8).await;

    node1.connect(node0.local_ip());
    let node0_ = node0.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1);

    // node2 is refused, but walks away with node1's endpoint (plus the
    // failure record for node0's own endpoint).
    let candidates_before = node2.finder().candidate_count();
    node2.connect(node0.local_ip());
    let node2_ = node2.clone();
    deadline!(Duration::from_secs(5), move || {
        node2_.finder().candidate_count() >= candidates_before + 2
    });

    assert_eq!(node2.size(), 0);
    assert_eq!(node0.size(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_slots_redirect_response() {
    initialize_logger(1);

    // node0 admits a single peer, already taken by node1.
    let node0 = overlay(1).await;
    let node1 = overlay(8).await;
    node1.connect(node0.local_ip());
    let node0_ = node0.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1);

    // A bare TLS client performs the upgrade by hand.
    let tcp = TcpStream::connect(node0.local_ip()).await.unwrap();
    let connector = TlsConnector::from(Arc::new(tls::client_config()));
    let server_name = ServerName::from(node0.local_ip().ip());
    let mut stream = TlsStream::Client(connector.connect(server_name, tcp).await.unwrap());

    let account = Account::new(&mut OsRng);
    let shared = tls::shared_value(&stream).unwrap();
    let hello = Hello::new(&account, &shared, None, Some(2459), None, None);
    let headers = handshake::upgrade_request_headers(&hello, true);
    stream.write_all(&http::encode_request("/", &headers)).await.unwrap();
    stream.flush().await.unwrap();

    // The server refuses with a redirect: 503, the client's address echoed,
    // and the one active peer suggested.
    let (response, _) = http::read_response(&mut stream).await.unwrap();
    assert_eq!(response.status, 503);
    assert!(response.header("Remote-Address").is_some());

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    let peer_ips = body["peer-ips"].as_array().unwrap();
    // node1 dialed in over loopback and advertised its listening port.
    let expected = format!("127.0.0.1:{}", node1.local_ip().port());
    assert_eq!(peer_ips.len(), 1);
    assert_eq!(peer_ips[0].as_str().unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crawl_endpoint() {
    initialize_logger(1);

    let node0 = overlay(8).await;
    let node1 = overlay(8).await;
    node1.connect(node0.local_ip());
    let node0_ = node0.clone();
    deadline!(Duration::from_secs(5), move || node0_.size() == 1);

    // Fetch /crawl over a bare TLS connection.
    let tcp = TcpStream::connect(node0.local_ip()).await.unwrap();
    let connector = TlsConnector::from(Arc::new(tls::client_config()));
    let server_name = ServerName::from(node0.local_ip().ip());
    let mut stream = TlsStream::Client(connector.connect(server_name, tcp).await.unwrap());
    stream.write_all(&http::encode_request("/crawl", &[])).await.unwrap();
    stream.flush().await.unwrap();

    let (response, _) = http::read_response(&mut stream).await.unwrap();
    assert_eq!(response.status, 200);

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    let active = body["overlay"]["active"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["public_key"].as_str().unwrap(), node1.account().node_key().to_string());
    assert_eq!(active[0]["type"].as_str().unwrap(), "in");
    assert_eq!(active[0]["port"].as_u64().unwrap(), node1.local_ip().port() as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_get_upgrade_is_rejected() {
    initialize_logger(1);

    let node0 = overlay(8).await;

    let tcp = TcpStream::connect(node0.local_ip()).await.unwrap();
    let connector = TlsConnector::from(Arc::new(tls::client_config()));
    let server_name = ServerName::from(node0.local_ip().ip());
    let mut stream = TlsStream::Client(connector.connect(server_name, tcp).await.unwrap());

    let account = Account::new(&mut OsRng);
    let shared = tls::shared_value(&stream).unwrap();
    let hello = Hello::new(&account, &shared, None, None, None, None);
    let headers = handshake::upgrade_request_headers(&hello, true);
    let encoded = http::encode_request("/", &headers);
    // Rewrite the method in place.
    let mut request = b"POST".to_vec();
    request.extend_from_slice(&encoded[b"GET".len()..]);
    stream.write_all(&request).await.unwrap();
    stream.flush().await.unwrap();

    let (response, _) = http::read_response(&mut stream).await.unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(node0.size(), 0);
}
