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

use crate::peer::PeerId;
use tessera_node_messages::MessageId;

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

/// The suppression table preventing relay loops: one entry per message
/// content hash, recording which peers have already seen the content and
/// whether it has been relayed.
pub struct HashRouter {
    /// How long an entry is held after its last touch.
    hold: Duration,
    /// The suppression entries, ordered by last touch for cheap expiry.
    entries: Mutex<LinkedHashMap<MessageId, Entry>>,
}

/// The flag recording that the content has been relayed.
pub const RELAYED: u8 = 0b0000_0001;

struct Entry {
    skip: HashSet<PeerId>,
    flags: u8,
    touched: Instant,
}

impl HashRouter {
    /// Initializes a new hash router holding entries for the given duration.
    pub fn new(hold: Duration) -> Self {
        Self { hold, entries: Mutex::new(LinkedHashMap::new()) }
    }

    /// Atomically ORs `flag` into the entry for `uid`, unions the caller's
    /// skip set with the stored one, and hands the union back through `skip`.
    ///
    /// Returns `true` iff `flag` was newly set.
    pub fn swap_set(&self, uid: MessageId, skip: &mut HashSet<PeerId>, flag: u8) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        // `get_refresh` moves the entry to the back; `sweep` relies on the
        // table staying ordered by last touch.
        match entries.get_refresh(&uid) {
            Some(entry) => {
                entry.touched = now;

                let newly_set = entry.flags & flag == 0;
                entry.flags |= flag;

                entry.skip.extend(skip.iter().copied());
                skip.extend(entry.skip.iter().copied());

                newly_set
            }
            None => {
                entries.insert(uid, Entry { skip: skip.clone(), flags: flag, touched: now });
                true
            }
        }
    }

    /// Drops entries whose last touch is older than the hold time.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        while let Some((_, entry)) = entries.front() {
            if now.duration_since(entry.touched) <= self.hold {
                break;
            }
            entries.pop_front();
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for HashRouter {
    fn default() -> Self {
        // Suppression must outlive a full round of relay gossip.
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_node_messages::sha512_half;

    fn uid(n: u8) -> MessageId {
        MessageId(sha512_half(&[n]))
    }

    #[test]
    fn test_flag_set_once() {
        let router = HashRouter::default();
        let mut skip = HashSet::new();

        assert!(router.swap_set(uid(1), &mut skip, RELAYED));
        assert!(!router.swap_set(uid(1), &mut skip, RELAYED));
        // A different uid is independent.
        assert!(router.swap_set(uid(2), &mut skip, RELAYED));
    }

    #[test]
    fn test_swap_accumulates_skip_sets() {
        let router = HashRouter::default();

        let mut first = HashSet::from([PeerId(1)]);
        assert!(router.swap_set(uid(7), &mut first, RELAYED));

        let mut second = HashSet::from([PeerId(2)]);
        assert!(!router.swap_set(uid(7), &mut second, RELAYED));

        // The second call observes a superset of the first call's contributions.
        assert!(second.contains(&PeerId(1)));
        assert!(second.contains(&PeerId(2)));
    }

    #[test]
    fn test_sweep_expires_entries() {
        let router = HashRouter::new(Duration::from_millis(0));
        let mut skip = HashSet::new();
        router.swap_set(uid(3), &mut skip, RELAYED);

        std::thread::sleep(Duration::from_millis(5));
        router.sweep();
        assert!(router.is_empty());

        // After expiry the flag can be set anew.
        assert!(router.swap_set(uid(3), &mut skip, RELAYED));
    }

    #[test]
    fn test_sweep_reaches_stale_entries_behind_a_hot_one() {
        let router = HashRouter::new(Duration::from_millis(50));
        let mut skip = HashSet::new();

        router.swap_set(uid(1), &mut skip, RELAYED);
        router.swap_set(uid(2), &mut skip, RELAYED);

        // Keep re-touching the first uid while the second goes stale.
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(25));
            router.swap_set(uid(1), &mut skip, RELAYED);
        }
        router.sweep();

        // The stale entry is evicted even though a hot one was inserted
        // ahead of it; the hot one survives.
        assert_eq!(router.len(), 1);
        assert!(!router.swap_set(uid(1), &mut skip, RELAYED));
        assert!(router.swap_set(uid(2), &mut skip, RELAYED));
    }
}
