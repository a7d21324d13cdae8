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

//! RAID-5 geometry: placement of logical blocks and rotating parity across the disks.
//!
//! For an array of `k` data disks plus one parity disk, logical block `b` belongs to stripe
//! `s = b / k` at slot `j = b % k`. The parity of stripe `s` lives on disk `s mod (k + 1)`; the
//! data slots fill the remaining disks in order, skipping the parity disk. Every block of stripe
//! `s` is stored at physical block `s` of its disk.

use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Geometry {
    data_disks: usize,
    block_size: usize,
    blocks_per_disk: u64,
}

/// Physical placement of a logical block.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Location {
    pub block: u64,
    pub stripe: u64,
    pub slot: usize,
    /// Disk holding the data block.
    pub disk: usize,
    /// Disk holding the parity of the stripe.
    pub parity: usize,
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} (stripe {}, disk {}, parity on disk {})",
            self.block, self.stripe, self.disk, self.parity
        )
    }
}

impl Geometry {
    pub fn new(data_disks: usize, block_size: usize, blocks_per_disk: u64) -> Self {
        Geometry {
            data_disks,
            block_size,
            blocks_per_disk,
        }
    }

    pub fn data_disks(&self) -> usize { self.data_disks }

    /// Number of disks in the array, parity included.
    pub fn disks(&self) -> usize { self.data_disks + 1 }

    pub fn block_size(&self) -> usize { self.block_size }

    /// Number of stripes, equal to the number of blocks on each disk.
    pub fn stripes(&self) -> u64 { self.blocks_per_disk }

    /// Number of logical blocks exposed to clients.
    pub fn capacity(&self) -> u64 { self.blocks_per_disk * self.data_disks as u64 }

    pub fn parity_disk(&self, stripe: u64) -> usize { (stripe % self.disks() as u64) as usize }

    pub fn data_disk(&self, stripe: u64, slot: usize) -> usize {
        debug_assert!(slot < self.data_disks);
        let parity = self.parity_disk(stripe);
        if slot < parity {
            slot
        } else {
            slot + 1
        }
    }

    /// Resolves the placement of a logical block; `None` if the block is beyond the capacity.
    pub fn locate(&self, block: u64) -> Option<Location> {
        if block >= self.capacity() {
            return None;
        }
        let stripe = block / self.data_disks as u64;
        let slot = (block % self.data_disks as u64) as usize;
        Some(Location {
            block,
            stripe,
            slot,
            disk: self.data_disk(stripe, slot),
            parity: self.parity_disk(stripe),
        })
    }
}

/// XORs `other` into `acc` byte by byte.
pub fn xor_into(acc: &mut [u8], other: &[u8]) {
    debug_assert_eq!(acc.len(), other.len());
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

/// XOR of all the blocks, each `len` bytes long.
pub fn xor_all<'a>(blocks: impl IntoIterator<Item = &'a [u8]>, len: usize) -> Vec<u8> {
    let mut acc = vec![0u8; len];
    for block in blocks {
        xor_into(&mut acc, block);
    }
    acc
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn rotating_parity() {
        let geometry = Geometry::new(3, 16, 8);
        assert_eq!(geometry.capacity(), 24);
        let parities = (0..4).map(|s| geometry.parity_disk(s)).collect::<Vec<_>>();
        assert_eq!(parities, vec![0, 1, 2, 3]);

        let loc = geometry.locate(5).unwrap();
        assert_eq!((loc.stripe, loc.slot, loc.parity, loc.disk), (1, 2, 1, 3));
        assert_eq!(geometry.locate(24), None);
    }

    #[test]
    fn every_stripe_covers_all_disks() {
        let geometry = Geometry::new(4, 16, 32);
        for stripe in 0..geometry.stripes() {
            let mut disks = (0..geometry.data_disks())
                .map(|slot| geometry.data_disk(stripe, slot))
                .collect::<BTreeSet<_>>();
            assert!(disks.insert(geometry.parity_disk(stripe)));
            assert_eq!(disks.len(), geometry.disks());

            for slot in 0..geometry.data_disks() {
                let block = stripe * geometry.data_disks() as u64 + slot as u64;
                let loc = geometry.locate(block).unwrap();
                assert_eq!(loc.disk, geometry.data_disk(stripe, slot));
                assert_eq!(loc.parity, geometry.parity_disk(stripe));
            }
        }
    }

    #[test]
    fn xor_recovers_missing_block() {
        let blocks = [vec![1u8, 2, 3], vec![4, 5, 6], vec![7, 8, 9]];
        let parity = xor_all(blocks.iter().map(Vec::as_slice), 3);
        let recovered = xor_all([blocks[0].as_slice(), &blocks[2], &parity], 3);
        assert_eq!(recovered, blocks[1]);
    }
}
