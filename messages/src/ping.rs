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

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub ledger_seq: u64,
    pub nonce: u64,
}

impl MessageTrait for Ping {
    /// Returns the message name.
    #[inline]
    fn name(&self) -> &str {
        "Ping"
    }

    /// Serializes the message into the buffer.
    #[inline]
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        Ok(bincode::serialize_into(writer, &(self.version, self.ledger_seq, self.nonce))?)
    }

    /// Deserializes the given buffer into a message.
    #[inline]
    fn deserialize(bytes: BytesMut) -> Result<Self> {
        let (version, ledger_seq, nonce) = bincode::deserialize_from(&mut bytes.reader())?;
        Ok(Self { version, ledger_seq, nonce })
    }
}
