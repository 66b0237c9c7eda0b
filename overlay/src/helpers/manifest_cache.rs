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

use crate::ConfigError;
use tessera_account::NodeKey;
use tessera_node_messages::Manifest;

use anyhow::Result;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

/// The outcome of applying a manifest to the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ManifestDisposition {
    /// The manifest is trusted and now authoritative; persist and re-announce.
    Accepted,
    /// The manifest is valid but its master key is not a trusted validator;
    /// publish to observers only.
    Untrusted,
    /// A manifest with an equal or higher sequence is already held.
    Stale,
    /// The master signature does not verify.
    Invalid,
}

/// The write-through hook to an external blob table of raw manifest bytes.
/// Rows are idempotent by content.
pub trait ManifestStore: Send + Sync {
    /// Loads every stored manifest row.
    fn load_all(&self) -> Result<Vec<Vec<u8>>>;
    /// Appends one manifest row.
    fn save(&self, raw: &[u8]) -> Result<()>;
}

/// The validator-key rotation records, keyed by master node key. For each
/// master only the highest-sequence manifest is kept.
#[derive(Default)]
pub struct ManifestCache {
    /// Applications are serialized under this lock, which also guarantees the
    /// per-master-key ordering invariant.
    map: Mutex<IndexMap<NodeKey, Manifest>>,
}

impl ManifestCache {
    /// Initializes an empty manifest cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the given manifest against the trusted validator set.
    pub fn apply_manifest(&self, manifest: &Manifest, trusted: &IndexSet<NodeKey>) -> ManifestDisposition {
        if !manifest.verify() {
            return ManifestDisposition::Invalid;
        }

        let mut map = self.map.lock();
        if let Some(current) = map.get(&manifest.master_key) {
            if current.sequence >= manifest.sequence {
                return ManifestDisposition::Stale;
            }
        }
        map.insert(manifest.master_key, manifest.clone());

        match trusted.contains(&manifest.master_key) {
            true => ManifestDisposition::Accepted,
            false => ManifestDisposition::Untrusted,
        }
    }

    /// Seeds the cache from a configured manifest at startup. The manifest
    /// must be trusted; anything else is a configuration error.
    pub fn config_manifest(&self, manifest: Manifest, trusted: &IndexSet<NodeKey>) -> Result<(), ConfigError> {
        match self.apply_manifest(&manifest, trusted) {
            ManifestDisposition::Accepted => Ok(()),
            ManifestDisposition::Untrusted => Err(ConfigError::UntrustedManifest),
            _ => Err(ConfigError::InvalidManifest),
        }
    }

    /// Parses the configured validator-key entries into the trusted set.
    /// Fails if any entry is malformed.
    pub fn load_validator_keys(entries: &[String]) -> Result<IndexSet<NodeKey>, ConfigError> {
        let mut keys = IndexSet::with_capacity(entries.len());
        for entry in entries {
            let key = entry.parse::<NodeKey>().map_err(|_| ConfigError::InvalidValidatorKey(entry.clone()))?;
            keys.insert(key);
        }
        Ok(keys)
    }

    /// Re-applies every stored row into the cache.
    pub fn load(&self, store: &dyn ManifestStore, trusted: &IndexSet<NodeKey>) -> Result<()> {
        for raw in store.load_all()? {
            match Manifest::from_bytes(&raw) {
                Ok(manifest) => {
                    let disposition = self.apply_manifest(&manifest, trusted);
                    trace!("Loaded stored manifest for '{}' ({disposition:?})", manifest.master_key);
                }
                Err(error) => warn!("Skipping an undecodable stored manifest - {error}"),
            }
        }
        Ok(())
    }

    /// Writes the given manifest through to the store.
    pub fn save(&self, store: &dyn ManifestStore, manifest: &Manifest) -> Result<()> {
        store.save(&manifest.to_bytes()?)
    }

    /// Returns the signing key currently authorized for the given master key.
    pub fn signing_key_for(&self, master: &NodeKey) -> Option<NodeKey> {
        let map = self.map.lock();
        let manifest = map.get(master)?;
        match manifest.is_revocation() {
            true => None,
            false => Some(manifest.signing_key),
        }
    }

    /// Returns the highest sequence observed for the given master key.
    pub fn sequence_of(&self, master: &NodeKey) -> Option<u32> {
        self.map.lock().get(master).map(|manifest| manifest.sequence)
    }

    /// Returns a snapshot of every held manifest, for the history set sent
    /// to newly connected peers.
    pub fn manifests(&self) -> Vec<Manifest> {
        self.map.lock().values().cloned().collect()
    }

    /// Returns the number of master keys tracked.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Returns `true` if no manifests are held.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
