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

pub mod http;

use tessera_account::{Account, NodeKey};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// The upgrade token of the peer protocol.
pub const PROTOCOL_TOKEN: &str = "TSRP";
/// The product identification sent in `User-Agent`.
pub const USER_AGENT: &str = concat!("tesserad/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed hello ({0})")]
    Malformed(&'static str),
    #[error("the session signature does not verify")]
    BadSignature,
    #[error("attempted to self-connect")]
    SelfConnect,
    #[error("a live peer already holds this node key")]
    DuplicateNode,
    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
    #[error("the TLS session does not expose a shared value")]
    NoSharedValue,
}

/// The digest bound to the live TLS session. Both endpoints compute it
/// independently from the session keying material; nobody outside can.
/// Signing it binds a node key to this exact session, preventing replay.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedValue(pub(crate) [u8; 32]);

impl SharedValue {
    /// Returns the bytes covered by the hello signature.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A peer protocol version, advertised in the `Upgrade` header as
/// `TSRP/<major>.<minor>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// The version spoken by this build.
    pub const CURRENT: Self = Self { major: 1, minor: 1 };
    /// The oldest version this build still accepts.
    pub const MINIMUM: Self = Self { major: 1, minor: 0 };

    /// Returns `true` if a peer at this version understands hop counts.
    pub fn is_hop_aware(&self) -> bool {
        *self >= Self::CURRENT
    }

    /// Negotiates the session version from an `Upgrade` header value, which
    /// may carry a comma-separated list of tokens.
    pub fn negotiate(upgrade: &str) -> Result<Self, HandshakeError> {
        let offered = upgrade
            .split(',')
            .map(str::trim)
            .filter_map(|token| token.parse::<Self>().ok())
            .filter(|version| (Self::MINIMUM..=Self::CURRENT).contains(version))
            .max();
        offered.ok_or_else(|| HandshakeError::UnsupportedVersion(upgrade.to_string()))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROTOCOL_TOKEN}/{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || HandshakeError::UnsupportedVersion(s.to_string());
        let rest = s.strip_prefix(PROTOCOL_TOKEN).and_then(|r| r.strip_prefix('/')).ok_or_else(malformed)?;
        let (major, minor) = rest.split_once('.').ok_or_else(malformed)?;
        Ok(Self {
            major: major.parse().map_err(|_| malformed())?,
            minor: minor.parse().map_err(|_| malformed())?,
        })
    }
}

/// The signed identity blob exchanged during the HTTP upgrade.
///
/// Field names on the wire are stable across versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    /// The node's current public key.
    pub node_key: NodeKey,
    /// The signature over the session's shared value.
    pub signature: Vec<u8>,
    /// The self-reported public IP, when known.
    pub public_ip: Option<Ipv4Addr>,
    /// The port the node accepts peers on, when it is listening.
    pub listening_port: Option<u16>,
    /// The sequence of the last closed ledger, when one is known.
    pub ledger_seq: Option<u64>,
    /// The hash of the last closed ledger, when one is known.
    pub closed_ledger: Option<[u8; 32]>,
    /// The advertised cluster name, for cluster members.
    pub cluster: Option<String>,
}

impl Hello {
    /// Produces a hello for the given account, signing the session's shared
    /// value as proof of possession.
    pub fn new(
        account: &Account,
        shared: &SharedValue,
        public_ip: Option<Ipv4Addr>,
        listening_port: Option<u16>,
        ledger: Option<(u64, [u8; 32])>,
        cluster: Option<String>,
    ) -> Self {
        Self {
            node_key: account.node_key(),
            signature: account.sign(shared.as_bytes()).to_vec(),
            public_ip,
            listening_port,
            ledger_seq: ledger.map(|(seq, _)| seq),
            closed_ledger: ledger.map(|(_, hash)| hash),
            cluster,
        }
    }

    /// Verifies the proof of possession against the locally computed shared
    /// value.
    pub fn verify(&self, shared: &SharedValue) -> Result<(), HandshakeError> {
        match self.node_key.verify(shared.as_bytes(), &self.signature) {
            true => Ok(()),
            false => Err(HandshakeError::BadSignature),
        }
    }

    /// Serializes the hello into its header fields, in stable order.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Public-Key".to_string(), self.node_key.to_string()),
            ("Session-Signature".to_string(), BASE64_STANDARD.encode(&self.signature)),
        ];
        if let Some(ip) = self.public_ip {
            headers.push(("Public-IP".to_string(), ip.to_string()));
        }
        if let Some(port) = self.listening_port {
            headers.push(("Listening-Port".to_string(), port.to_string()));
        }
        if let Some(seq) = self.ledger_seq {
            headers.push(("Ledger-Sequence".to_string(), seq.to_string()));
        }
        if let Some(hash) = self.closed_ledger {
            headers.push(("Closed-Ledger".to_string(), BASE64_STANDARD.encode(hash)));
        }
        if let Some(cluster) = &self.cluster {
            headers.push(("Cluster".to_string(), cluster.clone()));
        }
        headers
    }

    /// Parses a hello from header fields. Header names are compared
    /// case-insensitively; required fields are `Public-Key` and
    /// `Session-Signature`.
    pub fn from_headers(headers: &[(String, String)]) -> Result<Self, HandshakeError> {
        let get = |name: &str| {
            headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
        };

        let node_key = get("Public-Key")
            .ok_or(HandshakeError::Malformed("missing Public-Key"))?
            .parse::<NodeKey>()
            .map_err(|_| HandshakeError::Malformed("bad Public-Key"))?;
        let signature = BASE64_STANDARD
            .decode(get("Session-Signature").ok_or(HandshakeError::Malformed("missing Session-Signature"))?)
            .map_err(|_| HandshakeError::Malformed("bad Session-Signature"))?;

        let public_ip = match get("Public-IP") {
            Some(value) => {
                Some(value.parse::<Ipv4Addr>().map_err(|_| HandshakeError::Malformed("bad Public-IP"))?)
            }
            None => None,
        };
        let listening_port = match get("Listening-Port") {
            Some(value) => {
                Some(value.parse::<u16>().map_err(|_| HandshakeError::Malformed("bad Listening-Port"))?)
            }
            None => None,
        };
        let ledger_seq = match get("Ledger-Sequence") {
            Some(value) => {
                Some(value.parse::<u64>().map_err(|_| HandshakeError::Malformed("bad Ledger-Sequence"))?)
            }
            None => None,
        };
        let closed_ledger = match get("Closed-Ledger") {
            Some(value) => {
                let bytes = BASE64_STANDARD
                    .decode(value)
                    .map_err(|_| HandshakeError::Malformed("bad Closed-Ledger"))?;
                Some(bytes.try_into().map_err(|_| HandshakeError::Malformed("bad Closed-Ledger"))?)
            }
            None => None,
        };
        let cluster = get("Cluster").map(str::to_string);

        Ok(Self { node_key, signature, public_ip, listening_port, ledger_seq, closed_ledger, cluster })
    }
}

/// Builds the full header set of an outbound upgrade request.
pub fn upgrade_request_headers(hello: &Hello, crawl_public: bool) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Upgrade".to_string(), ProtocolVersion::CURRENT.to_string()),
        ("Connection".to_string(), "Upgrade".to_string()),
        ("Connect-As".to_string(), "Peer".to_string()),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
        ("Crawl".to_string(), crawl_value(crawl_public).to_string()),
    ];
    headers.extend(hello.to_headers());
    headers
}

/// Builds the header set of a `101 Switching Protocols` response.
pub fn upgrade_response_headers(
    hello: &Hello,
    crawl_public: bool,
    version: ProtocolVersion,
) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Connection".to_string(), "Upgrade".to_string()),
        ("Upgrade".to_string(), version.to_string()),
        ("Server".to_string(), USER_AGENT.to_string()),
        ("Crawl".to_string(), crawl_value(crawl_public).to_string()),
    ];
    headers.extend(hello.to_headers());
    headers
}

/// Returns the `Crawl` header value for the given disclosure policy.
pub fn crawl_value(public: bool) -> &'static str {
    match public {
        true => "public",
        false => "private",
    }
}
