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

use crate::{sha512_half, MessageId};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tessera_account::{Account, NodeKey};

/// A signed record rotating a master node key to a new signing key.
///
/// For a given master key, only the manifest with the highest sequence number
/// is authoritative; a strictly higher sequence revokes any lower one. A
/// manifest with `sequence == u32::MAX` revokes the master key outright.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub master_key: NodeKey,
    pub signing_key: NodeKey,
    pub sequence: u32,
    pub master_signature: Vec<u8>,
}

impl Manifest {
    /// The sequence number that revokes a master key.
    pub const REVOCATION_SEQUENCE: u32 = u32::MAX;

    /// Produces a new manifest signed by the given master account.
    pub fn new(master: &Account, signing_key: NodeKey, sequence: u32) -> Self {
        let mut manifest =
            Self { master_key: master.node_key(), signing_key, sequence, master_signature: Vec::new() };
        manifest.master_signature = master.sign(&manifest.signing_bytes()).to_vec();
        manifest
    }

    /// Returns the bytes covered by the master signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 32 + 32 + 4);
        bytes.extend_from_slice(b"MAN\0");
        bytes.extend_from_slice(&self.master_key.to_bytes());
        bytes.extend_from_slice(&self.signing_key.to_bytes());
        bytes.extend_from_slice(&self.sequence.to_le_bytes());
        bytes
    }

    /// Returns `true` if the master signature is valid.
    pub fn verify(&self) -> bool {
        self.master_key.verify(&self.signing_bytes(), &self.master_signature)
    }

    /// Returns `true` if this manifest revokes its master key.
    pub fn is_revocation(&self) -> bool {
        self.sequence == Self::REVOCATION_SEQUENCE
    }

    /// Returns the content-hash identity of the manifest.
    pub fn uid(&self) -> MessageId {
        let mut preimage = self.signing_bytes();
        preimage.extend_from_slice(&self.master_signature);
        MessageId(sha512_half(&preimage))
    }

    /// Serializes the manifest into its raw persisted form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a manifest from its raw persisted form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;

    #[test]
    fn test_verify_detects_tampering() {
        let rng = &mut OsRng;
        let master = Account::new(rng);
        let signing = Account::new(rng);

        let mut manifest = Manifest::new(&master, signing.node_key(), 3);
        assert!(manifest.verify());

        manifest.sequence = 4;
        assert!(!manifest.verify());
    }

    #[test]
    fn test_raw_round_trip() {
        let rng = &mut OsRng;
        let master = Account::new(rng);
        let signing = Account::new(rng);

        let manifest = Manifest::new(&master, signing.node_key(), 11);
        let bytes = manifest.to_bytes().unwrap();
        let decoded = Manifest::from_bytes(&bytes).unwrap();
        assert_eq!(manifest, decoded);
        assert!(decoded.verify());
    }

    #[test]
    fn test_revocation_sequence() {
        let rng = &mut OsRng;
        let master = Account::new(rng);
        let signing = Account::new(rng);

        let manifest = Manifest::new(&master, signing.node_key(), Manifest::REVOCATION_SEQUENCE);
        assert!(manifest.is_revocation());
        assert!(manifest.verify());
    }
}
