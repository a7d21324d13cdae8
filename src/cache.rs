// Networked RAID-5 block storage array driven by a poll reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Bounded block cache with least-recently-used eviction.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};

/// Cache key: physical block of a disk.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct BlockKey {
    pub disk: usize,
    pub block: u64,
}

impl BlockKey {
    pub fn new(disk: usize, block: u64) -> Self { BlockKey { disk, block } }
}

impl Display for BlockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.disk, self.block) }
}

#[derive(Clone, Debug)]
pub struct BlockCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<BlockKey, (u64, Vec<u8>)>,
    /// Recency stamps, oldest first.
    recency: BTreeMap<u64, BlockKey>,
}

impl BlockCache {
    /// Cache holding at most `capacity` blocks; zero capacity disables caching.
    pub fn new(capacity: usize) -> Self {
        BlockCache {
            capacity,
            clock: 0,
            entries: empty!(),
            recency: empty!(),
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn contains(&self, key: &BlockKey) -> bool { self.entries.contains_key(key) }

    /// Returns the block and marks it as the most recently used.
    pub fn get(&mut self, key: &BlockKey) -> Option<&[u8]> {
        let stamp = self.tick();
        let (old, data) = self.entries.get_mut(key)?;
        self.recency.remove(&*old);
        self.recency.insert(stamp, *key);
        *old = stamp;
        Some(data.as_slice())
    }

    /// Returns the block without touching its recency.
    pub fn peek(&self, key: &BlockKey) -> Option<&[u8]> {
        self.entries.get(key).map(|(_, data)| data.as_slice())
    }

    /// Inserts or overwrites the block, making it the most recently used and evicting the least
    /// recently used one when over capacity.
    pub fn put(&mut self, key: BlockKey, data: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.tick();
        if let Some((old, _)) = self.entries.insert(key, (stamp, data)) {
            self.recency.remove(&old);
        }
        self.recency.insert(stamp, key);

        while self.entries.len() > self.capacity {
            let Some((_, evicted)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }

    pub fn invalidate(&mut self, key: &BlockKey) -> Option<Vec<u8>> {
        let (stamp, data) = self.entries.remove(key)?;
        self.recency.remove(&stamp);
        Some(data)
    }

    /// Drops every block of the disk.
    pub fn invalidate_disk(&mut self, disk: usize) {
        self.entries.retain(|key, _| key.disk != disk);
        self.recency.retain(|_, key| key.disk != disk);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Keys currently cached, in key order.
    pub fn keys(&self) -> Vec<BlockKey> {
        let mut keys = self.entries.keys().copied().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block: u64) -> BlockKey { BlockKey::new(0, block) }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = BlockCache::new(3);
        for block in 0..3 {
            cache.put(key(block), vec![block as u8]);
        }
        // Touching block 0 makes block 1 the eldest
        assert_eq!(cache.get(&key(0)), Some(&[0u8][..]));
        cache.put(key(3), vec![3]);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key(1)));
        assert_eq!(cache.keys(), vec![key(0), key(2), key(3)]);

        cache.put(key(4), vec![4]);
        assert!(!cache.contains(&key(2)));
    }

    #[test]
    fn overwrite_refreshes() {
        let mut cache = BlockCache::new(2);
        cache.put(key(1), vec![1]);
        cache.put(key(2), vec![2]);
        cache.put(key(1), vec![11]);
        cache.put(key(3), vec![3]);
        assert_eq!(cache.peek(&key(1)), Some(&[11u8][..]));
        assert_eq!(cache.peek(&key(2)), None);
    }

    #[test]
    fn invalidation() {
        let mut cache = BlockCache::new(8);
        cache.put(BlockKey::new(0, 1), vec![1]);
        cache.put(BlockKey::new(1, 1), vec![2]);
        cache.put(BlockKey::new(1, 2), vec![3]);
        assert_eq!(cache.invalidate(&BlockKey::new(0, 1)), Some(vec![1]));
        assert_eq!(cache.invalidate(&BlockKey::new(0, 1)), None);
        cache.invalidate_disk(1);
        assert!(cache.is_empty());
        cache.put(key(7), vec![7]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = BlockCache::new(0);
        cache.put(key(1), vec![1]);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key(1)), None);
    }
}
