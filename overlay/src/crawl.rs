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

use crate::{peer_finder::Direction, Overlay};

use serde_json::json;

impl Overlay {
    /// Builds the `/crawl` document: the set of active peers, with transport
    /// details disclosed only for peers that opted in.
    pub fn crawl(&self) -> serde_json::Value {
        let active: Vec<serde_json::Value> = self
            .peers()
            .iter()
            .map(|peer| {
                let mut entry = json!({
                    "public_key": peer.node_key().to_string(),
                    "type": match peer.direction() {
                        Direction::Inbound => "in",
                        Direction::Outbound | Direction::Fixed => "out",
                    },
                    "uptime": peer.uptime().as_secs(),
                });
                if peer.is_crawl_public() {
                    if let Some(listening) = peer.listening() {
                        entry["ip"] = json!(listening.ip().to_string());
                        entry["port"] = json!(listening.port());
                    }
                }
                if let Some(agent) = peer.user_agent() {
                    entry["version"] = json!(agent);
                }
                entry
            })
            .collect();

        json!({ "overlay": { "active": active } })
    }

    /// Builds the overlay summary document for the administrative surface.
    pub fn json(&self) -> serde_json::Value {
        let traffic: serde_json::Map<String, serde_json::Value> = self
            .resource
            .traffic_counts()
            .into_iter()
            .map(|(name, counts)| {
                (name.to_string(), json!({
                    "bytes_in": counts.bytes_in,
                    "bytes_out": counts.bytes_out,
                    "messages_in": counts.messages_in,
                    "messages_out": counts.messages_out,
                }))
            })
            .collect();

        json!({
            "size": self.size(),
            "limit": self.limit(),
            "candidates": self.finder.candidate_count(),
            "traffic": traffic,
        })
    }
}
