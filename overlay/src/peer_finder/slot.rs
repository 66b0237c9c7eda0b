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

use tessera_account::NodeKey;

use std::{fmt, net::SocketAddr};

/// An opaque handle into the slot table, stable for a slot's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub(crate) u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// The direction of a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Fixed,
}

/// The admission state of a slot.
///
/// ```text
/// Connect --on_connected--> Connected --activate--> Active --on_closed--> Closed
/// Accept  ---------------------------activate-----> Active --on_closed--> Closed
/// any     --on_closed--> Closed (terminal)
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Accept,
    Connect,
    Connected,
    Active,
    Closed,
}

/// One admission quantum, governing a single peer connection.
#[derive(Clone, Debug)]
pub struct Slot {
    pub direction: Direction,
    pub remote: SocketAddr,
    /// The listening port advertised by an inbound peer, if any.
    pub listening_port: Option<u16>,
    pub state: SlotState,
    /// The remote node key, set once the state reaches `Active`.
    pub node_key: Option<NodeKey>,
    pub cluster: bool,
}

impl Slot {
    /// Initializes an inbound slot in the `Accept` state.
    pub(crate) fn inbound(remote: SocketAddr) -> Self {
        Self {
            direction: Direction::Inbound,
            remote,
            listening_port: None,
            state: SlotState::Accept,
            node_key: None,
            cluster: false,
        }
    }

    /// Initializes an outbound slot in the `Connect` state.
    pub(crate) fn outbound(remote: SocketAddr, fixed: bool) -> Self {
        Self {
            direction: if fixed { Direction::Fixed } else { Direction::Outbound },
            remote,
            listening_port: Some(remote.port()),
            state: SlotState::Connect,
            node_key: None,
            cluster: false,
        }
    }

    /// Returns `true` if the slot occupies outbound capacity.
    pub fn is_outbound(&self) -> bool {
        matches!(self.direction, Direction::Outbound | Direction::Fixed)
    }

    /// Returns the endpoint other nodes can dial to reach this peer, when the
    /// peer is known to be listening.
    pub fn listening_endpoint(&self) -> Option<SocketAddr> {
        match self.listening_port {
            Some(port) if port != 0 => Some(SocketAddr::new(self.remote.ip(), port)),
            _ => None,
        }
    }
}
