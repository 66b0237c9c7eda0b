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

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

/// The content-hash identity of a protocol message: the first half of the
/// SHA-512 digest over its hop-independent serialization.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 32]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &hex::encode(self.0)[..16])
    }
}

/// Returns the first 32 bytes of the SHA-512 digest of the given bytes.
pub fn sha512_half(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha512::digest(bytes);
    let mut half = [0u8; 32];
    half.copy_from_slice(&digest[..32]);
    half
}
