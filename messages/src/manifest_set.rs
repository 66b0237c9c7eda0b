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

/// A batch of manifests. Sets flagged as `history` are sent once on initial
/// connection and are never re-relayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestSet {
    pub manifests: Vec<Manifest>,
    pub history: bool,
}

impl ManifestSet {
    /// The maximum number of manifests permitted in a single message.
    pub const MAXIMUM_MANIFESTS: usize = 1024;
}

impl MessageTrait for ManifestSet {
    /// Returns the message name.
    #[inline]
    fn name(&self) -> &str {
        "ManifestSet"
    }

    /// Serializes the message into the buffer.
    #[inline]
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        Ok(bincode::serialize_into(writer, &(&self.manifests, self.history))?)
    }

    /// Deserializes the given buffer into a message.
    #[inline]
    fn deserialize(bytes: BytesMut) -> Result<Self> {
        let (manifests, history): (Vec<Manifest>, bool) = bincode::deserialize_from(&mut bytes.reader())?;
        if manifests.len() > Self::MAXIMUM_MANIFESTS {
            bail!("Too many manifests ({})", manifests.len());
        }
        Ok(Self { manifests, history })
    }
}
