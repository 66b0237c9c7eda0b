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

#[macro_use]
extern crate tracing;

mod helpers;
pub use helpers::*;

mod endpoints;
pub use endpoints::Endpoints;

mod manifest;
pub use manifest::Manifest;

mod manifest_set;
pub use manifest_set::ManifestSet;

mod ping;
pub use ping::Ping;

mod pong;
pub use pong::Pong;

mod proposal;
pub use proposal::Proposal;

mod validation;
pub use validation::Validation;

use ::bytes::{Buf, BytesMut};
use anyhow::{bail, Result};
use std::io::Write;

pub trait MessageTrait {
    /// Returns the message name.
    fn name(&self) -> &str;
    /// Serializes the message into the buffer.
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()>;
    /// Deserializes the given buffer into a message.
    fn deserialize(bytes: BytesMut) -> Result<Self>
    where
        Self: Sized;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Endpoints(Endpoints),
    ManifestSet(ManifestSet),
    Ping(Ping),
    Pong(Pong),
    Proposal(Proposal),
    Validation(Validation),
}

impl Message {
    /// The version of the overlay protocol; it can be incremented in order to force users to update.
    pub const VERSION: u32 = 1;

    /// Returns the message name.
    #[inline]
    pub fn name(&self) -> &str {
        match self {
            Self::Endpoints(message) => message.name(),
            Self::ManifestSet(message) => message.name(),
            Self::Ping(message) => message.name(),
            Self::Pong(message) => message.name(),
            Self::Proposal(message) => message.name(),
            Self::Validation(message) => message.name(),
        }
    }

    /// Returns the message ID.
    #[inline]
    pub fn id(&self) -> u16 {
        match self {
            Self::Endpoints(..) => 0,
            Self::ManifestSet(..) => 1,
            Self::Ping(..) => 2,
            Self::Pong(..) => 3,
            Self::Proposal(..) => 4,
            Self::Validation(..) => 5,
        }
    }

    /// Returns the content-hash identity for messages subject to relay
    /// suppression, computed over the hop-independent fields.
    pub fn uid(&self) -> Option<MessageId> {
        match self {
            Self::Proposal(message) => Some(message.uid()),
            Self::Validation(message) => Some(message.uid()),
            _ => None,
        }
    }

    /// Returns the hop count carried by the message, if any.
    pub fn hops(&self) -> Option<u8> {
        match self {
            Self::Proposal(message) => message.hops,
            Self::Validation(message) => message.hops,
            _ => None,
        }
    }

    /// Overwrites the hop count on messages that carry one.
    pub fn set_hops(&mut self, hops: Option<u8>) {
        match self {
            Self::Proposal(message) => message.hops = hops,
            Self::Validation(message) => message.hops = hops,
            _ => (),
        }
    }

    /// Serializes the message into the buffer.
    #[inline]
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.id().to_le_bytes()[..])?;

        match self {
            Self::Endpoints(message) => message.serialize(writer),
            Self::ManifestSet(message) => message.serialize(writer),
            Self::Ping(message) => message.serialize(writer),
            Self::Pong(message) => message.serialize(writer),
            Self::Proposal(message) => message.serialize(writer),
            Self::Validation(message) => message.serialize(writer),
        }
    }

    /// Deserializes the given buffer into a message.
    #[inline]
    pub fn deserialize(mut bytes: BytesMut) -> Result<Self> {
        // Ensure there is at least a message ID in the buffer.
        if bytes.remaining() < 2 {
            bail!("Missing message ID");
        }

        // Read the message ID.
        let id: u16 = bytes.get_u16_le();

        // Deserialize the data field.
        let message = match id {
            0 => Self::Endpoints(MessageTrait::deserialize(bytes)?),
            1 => Self::ManifestSet(MessageTrait::deserialize(bytes)?),
            2 => Self::Ping(MessageTrait::deserialize(bytes)?),
            3 => Self::Pong(MessageTrait::deserialize(bytes)?),
            4 => Self::Proposal(MessageTrait::deserialize(bytes)?),
            5 => Self::Validation(MessageTrait::deserialize(bytes)?),
            _ => bail!("Unknown message ID {id}"),
        };

        Ok(message)
    }
}
