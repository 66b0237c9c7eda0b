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

/// A consensus position proposed by a validator for the next ledger.
///
/// The signature is opaque to the overlay; it is produced and checked by the
/// consensus engine. The hop count is overlay-local metadata and is excluded
/// from the content-hash identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub node_key: NodeKey,
    pub propose_seq: u64,
    pub previous_ledger: [u8; 32],
    pub position: [u8; 32],
    pub close_time: u64,
    pub signature: Vec<u8>,
    pub hops: Option<u8>,
}

impl Proposal {
    /// Returns the content-hash identity of the proposal.
    pub fn uid(&self) -> MessageId {
        let mut preimage = Vec::with_capacity(4 + 32 + 8 + 32 + 32 + 8 + self.signature.len());
        preimage.extend_from_slice(b"PRP\0");
        preimage.extend_from_slice(&self.node_key.to_bytes());
        preimage.extend_from_slice(&self.propose_seq.to_le_bytes());
        preimage.extend_from_slice(&self.previous_ledger);
        preimage.extend_from_slice(&self.position);
        preimage.extend_from_slice(&self.close_time.to_le_bytes());
        preimage.extend_from_slice(&self.signature);
        MessageId(sha512_half(&preimage))
    }
}

impl MessageTrait for Proposal {
    /// Returns the message name.
    #[inline]
    fn name(&self) -> &str {
        "Proposal"
    }

    /// Serializes the message into the buffer.
    #[inline]
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        Ok(bincode::serialize_into(
            writer,
            &(
                self.node_key,
                self.propose_seq,
                self.previous_ledger,
                self.position,
                self.close_time,
                &self.signature,
                self.hops,
            ),
        )?)
    }

    /// Deserializes the given buffer into a message.
    #[inline]
    fn deserialize(bytes: BytesMut) -> Result<Self> {
        let (node_key, propose_seq, previous_ledger, position, close_time, signature, hops) =
            bincode::deserialize_from(&mut bytes.reader())?;
        Ok(Self { node_key, propose_seq, previous_ledger, position, close_time, signature, hops })
    }
}
