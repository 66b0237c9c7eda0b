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

#![forbid(unsafe_code)]

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The number of bytes in a node key.
pub const NODE_KEY_LENGTH: usize = 32;
/// The number of bytes in a signature.
pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid node key encoding")]
    InvalidKey,
    #[error("invalid secret key encoding")]
    InvalidSecret,
    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// The long-lived public signing key identifying a node across sessions.
///
/// Equality, ordering, and hashing are defined over the canonical key bytes,
/// so node keys can serve as table keys throughout the overlay.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey([u8; NODE_KEY_LENGTH]);

impl NodeKey {
    /// Initializes a node key from its canonical bytes, rejecting encodings
    /// that do not decompress to a valid curve point.
    pub fn from_bytes(bytes: [u8; NODE_KEY_LENGTH]) -> Result<Self, AccountError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| AccountError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Returns the canonical bytes of the node key.
    pub const fn to_bytes(&self) -> [u8; NODE_KEY_LENGTH] {
        self.0
    }

    /// Verifies a signature over the given message with this node key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({self})")
    }
}

impl FromStr for NodeKey {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_STANDARD.decode(s).map_err(|_| AccountError::InvalidKey)?;
        let bytes: [u8; NODE_KEY_LENGTH] = bytes.try_into().map_err(|_| AccountError::InvalidKey)?;
        Self::from_bytes(bytes)
    }
}

/// A helper struct for a node's signing identity.
#[derive(Clone)]
pub struct Account {
    /// The node secret key.
    signing_key: SigningKey,
    /// The node public key.
    node_key: NodeKey,
}

impl Account {
    /// Samples a new account.
    pub fn new<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Self::from(SigningKey::generate(rng))
    }

    /// Initializes an account from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; NODE_KEY_LENGTH]) -> Self {
        Self::from(SigningKey::from_bytes(&seed))
    }

    /// Returns the node key of the account.
    pub const fn node_key(&self) -> NodeKey {
        self.node_key
    }

    /// Returns a signature for the given message, using the account secret key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verifies a signature for the given message, using the account node key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.node_key.verify(message, signature)
    }
}

impl From<SigningKey> for Account {
    /// Initializes a new account from a secret key.
    fn from(signing_key: SigningKey) -> Self {
        let node_key = NodeKey(signing_key.verifying_key().to_bytes());
        Self { signing_key, node_key }
    }
}

impl FromStr for Account {
    type Err = AccountError;

    /// Initializes an account from a base64-encoded secret seed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_STANDARD.decode(s).map_err(|_| AccountError::InvalidSecret)?;
        let seed: [u8; NODE_KEY_LENGTH] = bytes.try_into().map_err(|_| AccountError::InvalidSecret)?;
        Ok(Self::from_seed(seed))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account").field("node_key", &self.node_key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;

    #[test]
    fn test_sign_and_verify() {
        let account = Account::new(&mut OsRng);
        let signature = account.sign(b"hello overlay");
        assert!(account.verify(b"hello overlay", &signature));
        assert!(!account.verify(b"hello underlay", &signature));
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let account = Account::new(&mut OsRng);
        let other = Account::new(&mut OsRng);
        let signature = account.sign(b"proof of possession");
        assert!(!other.node_key().verify(b"proof of possession", &signature));
    }

    #[test]
    fn test_node_key_base64_round_trip() {
        let account = Account::new(&mut OsRng);
        let encoded = account.node_key().to_string();
        let decoded = NodeKey::from_str(&encoded).unwrap();
        assert_eq!(account.node_key(), decoded);
    }

    #[test]
    fn test_node_key_rejects_garbage() {
        assert!(NodeKey::from_str("not base64 at all!").is_err());
        assert!(NodeKey::from_str("AAEC").is_err());
    }

    #[test]
    fn test_node_key_bincode_round_trip() {
        let account = Account::new(&mut OsRng);
        let bytes = bincode::serialize(&account.node_key()).unwrap();
        let decoded: NodeKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(account.node_key(), decoded);
    }
}
