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

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// The traffic categories tracked for metrics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrafficCategory {
    Base,
    Proposal,
    Validation,
    Manifests,
    Endpoints,
}

impl TrafficCategory {
    const ALL: [Self; 5] = [Self::Base, Self::Proposal, Self::Validation, Self::Manifests, Self::Endpoints];

    /// Returns the category name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Proposal => "proposal",
            Self::Validation => "validation",
            Self::Manifests => "manifests",
            Self::Endpoints => "endpoints",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Base => 0,
            Self::Proposal => 1,
            Self::Validation => 2,
            Self::Manifests => 3,
            Self::Endpoints => 4,
        }
    }
}

/// A snapshot of one traffic category's counters.
#[derive(Copy, Clone, Debug, Default)]
pub struct TrafficCounts {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

#[derive(Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

/// The admission budget indexed by source IP, plus per-category traffic
/// accounting. Cloning is cheap; all clones share one set of books.
#[derive(Clone)]
pub struct ResourceManager(Arc<ResourceInner>);

struct ResourceInner {
    /// The inclusive per-IP cap on inbound connections; 0 means unlimited.
    ip_limit: usize,
    /// The live inbound charge per source IP.
    inbound: Mutex<IndexMap<IpAddr, usize>>,
    /// The traffic books, one per category.
    traffic: [Counters; TrafficCategory::ALL.len()],
}

impl ResourceManager {
    /// Initializes a new resource manager with the given per-IP cap.
    pub fn new(ip_limit: usize) -> Self {
        Self(Arc::new(ResourceInner {
            ip_limit,
            inbound: Default::default(),
            traffic: Default::default(),
        }))
    }

    /// Charges an inbound connection from the given source IP.
    pub fn new_inbound_endpoint(&self, ip: IpAddr) -> Consumer {
        *self.0.inbound.lock().entry(ip).or_insert(0) += 1;
        Consumer { manager: self.0.clone(), ip, inbound: true }
    }

    /// Charges an outbound connection to the given IP. Outbound endpoints are
    /// self-initiated and never classified as over limit.
    pub fn new_outbound_endpoint(&self, ip: IpAddr) -> Consumer {
        Consumer { manager: self.0.clone(), ip, inbound: false }
    }

    /// Records `n` bytes and one message of traffic in the given category.
    pub fn report_traffic(&self, category: TrafficCategory, inbound: bool, n: u64) {
        let counters = &self.0.traffic[category.index()];
        match inbound {
            true => {
                counters.bytes_in.fetch_add(n, Ordering::Relaxed);
                counters.messages_in.fetch_add(1, Ordering::Relaxed);
            }
            false => {
                counters.bytes_out.fetch_add(n, Ordering::Relaxed);
                counters.messages_out.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns a snapshot of all traffic counters, by category name.
    pub fn traffic_counts(&self) -> Vec<(&'static str, TrafficCounts)> {
        TrafficCategory::ALL
            .iter()
            .map(|category| {
                let counters = &self.0.traffic[category.index()];
                (category.name(), TrafficCounts {
                    bytes_in: counters.bytes_in.load(Ordering::Relaxed),
                    bytes_out: counters.bytes_out.load(Ordering::Relaxed),
                    messages_in: counters.messages_in.load(Ordering::Relaxed),
                    messages_out: counters.messages_out.load(Ordering::Relaxed),
                })
            })
            .collect()
    }
}

/// The RAII charge for one admitted endpoint. Dropping the consumer releases
/// the charge.
pub struct Consumer {
    manager: Arc<ResourceInner>,
    ip: IpAddr,
    inbound: bool,
}

impl Consumer {
    /// Returns `true` when the client has exceeded its budget and must be
    /// refused.
    pub fn disconnect(&self) -> bool {
        if !self.inbound || self.manager.ip_limit == 0 {
            return false;
        }
        self.manager.inbound.lock().get(&self.ip).copied().unwrap_or(0) > self.manager.ip_limit
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.inbound {
            let mut inbound = self.manager.inbound.lock();
            if let Some(count) = inbound.get_mut(&self.ip) {
                *count -= 1;
                if *count == 0 {
                    inbound.shift_remove(&self.ip);
                }
            }
        }
    }
}
