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

use std::net::SocketAddr;

/// A broadcast set of known peer listening endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub endpoints: Vec<SocketAddr>,
}

impl Endpoints {
    /// The maximum number of endpoints permitted in a single message.
    pub const MAXIMUM_ENDPOINTS: usize = 64;
}

impl MessageTrait for Endpoints {
    /// Returns the message name.
    #[inline]
    fn name(&self) -> &str {
        "Endpoints"
    }

    /// Serializes the message into the buffer.
    #[inline]
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        Ok(bincode::serialize_into(writer, &self.endpoints)?)
    }

    /// Deserializes the given buffer into a message.
    #[inline]
    fn deserialize(bytes: BytesMut) -> Result<Self> {
        let endpoints: Vec<SocketAddr> = bincode::deserialize_from(&mut bytes.reader())?;
        if endpoints.len() > Self::MAXIMUM_ENDPOINTS {
            bail!("Too many endpoints ({})", endpoints.len());
        }
        Ok(Self { endpoints })
    }
}
