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

use super::*;

use tessera_account::NodeKey;

/// A validator's signed attestation of a closed ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validation {
    pub node_key: NodeKey,
    pub ledger_seq: u64,
    pub ledger_hash: [u8; 32],
    pub full: bool,
    pub signature: Vec<u8>,
    pub hops: Option<u8>,
}

impl Validation {
    /// Returns the content-hash identity of the validation.
    pub fn uid(&self) -> MessageId {
        let mut preimage = Vec::with_capacity(4 + 32 + 8 + 32 + 1 + self.signature.len());
        preimage.extend_from_slice(b"VAL\0");
        preimage.extend_from_slice(&self.node_key.to_bytes());
        preimage.extend_from_slice(&self.ledger_seq.to_le_bytes());
        preimage.extend_from_slice(&self.ledger_hash);
        preimage.push(self.full as u8);
        preimage.extend_from_slice(&self.signature);
        MessageId(sha512_half(&preimage))
    }
}

impl MessageTrait for Validation {
    /// Returns the message name.
    #[inline]
    fn name(&self) -> &str {
        "Validation"
    }

    /// Serializes the message into the buffer.
    #[inline]
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        Ok(bincode::serialize_into(
            writer,
            &(self.node_key, self.ledger_seq, self.ledger_hash, self.full, &self.signature, self.hops),
        )?)
    }

    /// Deserializes the given buffer into a message.
    #[inline]
    fn deserialize(bytes: BytesMut) -> Result<Self> {
        let (node_key, ledger_seq, ledger_hash, full, signature, hops) =
            bincode::deserialize_from(&mut bytes.reader())?;
        Ok(Self { node_key, ledger_seq, ledger_hash, full, signature, hops })
    }
}
