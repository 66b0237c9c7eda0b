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

use indexmap::IndexSet;
use std::net::Ipv4Addr;
use tessera_account::NodeKey;

/// The smallest number of outbound peers the finder will aim for.
const MIN_OUT_PEERS: usize = 8;
/// The share of `max_peers` reserved for outbound connections.
const OUT_PEERS_PERCENT: usize = 15;

/// A configuration error is fatal at startup; the node refuses to come up.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("[overlay.public_ip] '{0}' is not a routable public IPv4 address")]
    InvalidPublicIp(Ipv4Addr),
    #[error("[overlay.ip_limit] must not be negative (found {0})")]
    InvalidIpLimit(i64),
    #[error("[peer.max_peers] must be nonzero")]
    InvalidMaxPeers,
    #[error("[validator_keys] entry '{0}' is not a valid node key")]
    InvalidValidatorKey(String),
    #[error("[validation_manifest] is not a valid manifest blob")]
    InvalidManifest,
    #[error("[validation_manifest] master key is not in [validator_keys]")]
    UntrustedManifest,
}

/// The overlay configuration, assembled by the node from its parsed
/// configuration file. Validation happens once, in [`OverlayConfig::validate`].
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// The maximum number of peer connections. (`peer.max_peers`)
    pub max_peers: usize,
    /// If set, the node neither accepts nor solicits connections beyond its
    /// fixed peers. (`peer.peer_private`)
    pub peer_private: bool,
    /// Whether inbound connections are accepted at all.
    pub want_incoming: bool,
    /// Whether the 1-Hz timer solicits outbound connections.
    pub auto_connect: bool,
    /// The port the overlay listens on; 0 picks an ephemeral port.
    pub listening_port: u16,
    /// The self-reported public address, advertised in the hello.
    /// (`overlay.public_ip`)
    pub public_ip: Option<Ipv4Addr>,
    /// The inclusive cap of inbound connections per source IP.
    /// (`overlay.ip_limit`; negative values are fatal, 0 means unlimited)
    pub ip_limit: i64,
    /// If set, hop counts are stripped on outbound relays. (`overlay.expire`)
    pub expire: bool,
    /// The maximum permitted hop count before a message is no longer relayed.
    pub max_ttl: u8,
    /// Whether this node discloses its peers on the crawl endpoint.
    pub crawl_public: bool,
    /// The bootstrap endpoints. (`ips`)
    pub ips: Vec<String>,
    /// The fixed-peer endpoints, always maintained. (`ips_fixed`)
    pub ips_fixed: Vec<String>,
    /// The built-in bootstrap fallback, used when both `ips` and `ips_fixed`
    /// are empty. Network-specific, hence configuration rather than code.
    pub default_bootstrap: String,
    /// The node keys of the trusted cluster.
    pub cluster_keys: IndexSet<NodeKey>,
    /// The cluster name this node advertises in its hello, if it is a
    /// cluster member.
    pub cluster_name: Option<String>,
    /// The base64-encoded trusted validator master keys. (`validator_keys`)
    pub validator_keys: Vec<String>,
    /// An optional base64-encoded manifest seeding the cache at startup.
    /// (`validation_manifest`)
    pub validation_manifest: Option<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_peers: 21,
            peer_private: false,
            want_incoming: true,
            auto_connect: true,
            listening_port: 0,
            public_ip: None,
            ip_limit: 2,
            expire: false,
            max_ttl: 3,
            crawl_public: true,
            ips: Vec::new(),
            ips_fixed: Vec::new(),
            default_bootstrap: "boot.tessera.network:2459".to_string(),
            cluster_keys: IndexSet::new(),
            cluster_name: None,
            validator_keys: Vec::new(),
            validation_manifest: None,
        }
    }
}

impl OverlayConfig {
    /// Checks the configuration for fatal errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidMaxPeers);
        }
        if self.ip_limit < 0 {
            return Err(ConfigError::InvalidIpLimit(self.ip_limit));
        }
        if let Some(ip) = self.public_ip {
            if ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast() {
                return Err(ConfigError::InvalidPublicIp(ip));
            }
        }
        for entry in &self.validator_keys {
            if entry.parse::<NodeKey>().is_err() {
                return Err(ConfigError::InvalidValidatorKey(entry.clone()));
            }
        }
        Ok(())
    }

    /// The number of outbound slots, derived from `max_peers`.
    pub fn out_peers(&self) -> usize {
        (self.max_peers * OUT_PEERS_PERCENT / 100).max(MIN_OUT_PEERS).min(self.max_peers)
    }

    /// The bootstrap endpoints with the fallback chain applied: `ips`, then
    /// `ips_fixed`, then the built-in default.
    pub fn bootstrap_ips(&self) -> Vec<String> {
        if !self.ips.is_empty() {
            self.ips.clone()
        } else if !self.ips_fixed.is_empty() {
            self.ips_fixed.clone()
        } else {
            vec![self.default_bootstrap.clone()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OverlayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_negative_ip_limit_is_fatal() {
        let config = OverlayConfig { ip_limit: -1, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidIpLimit(-1))));
    }

    #[test]
    fn test_private_public_ip_is_fatal() {
        for ip in ["10.0.0.1", "172.16.3.4", "192.168.1.1", "127.0.0.1", "0.0.0.0", "169.254.0.1"] {
            let config = OverlayConfig { public_ip: Some(ip.parse().unwrap()), ..Default::default() };
            assert!(config.validate().is_err(), "{ip} should be rejected");
        }
        let config = OverlayConfig { public_ip: Some("198.51.100.7".parse().unwrap()), ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_validator_key_is_fatal() {
        let config = OverlayConfig { validator_keys: vec!["???".to_string()], ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValidatorKey(_))));
    }

    #[test]
    fn test_out_peers_derivation() {
        let config = OverlayConfig { max_peers: 100, ..Default::default() };
        assert_eq!(config.out_peers(), 15);

        // Small caps are clamped upward, but never beyond max_peers.
        let config = OverlayConfig { max_peers: 10, ..Default::default() };
        assert_eq!(config.out_peers(), 8);
        let config = OverlayConfig { max_peers: 4, ..Default::default() };
        assert_eq!(config.out_peers(), 4);
    }

    #[test]
    fn test_bootstrap_fallback_chain() {
        let mut config = OverlayConfig::default();
        assert_eq!(config.bootstrap_ips(), vec![config.default_bootstrap.clone()]);

        config.ips_fixed = vec!["192.0.2.1:2459".to_string()];
        assert_eq!(config.bootstrap_ips(), config.ips_fixed);

        config.ips = vec!["192.0.2.2:2459".to_string()];
        assert_eq!(config.bootstrap_ips(), config.ips);
    }
}
