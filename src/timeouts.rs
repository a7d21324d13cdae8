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

use std::collections::BTreeSet;
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime};

/// UNIX timestamp with millisecond precision which helps working with absolute time.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default, Display)]
#[display("{0}ms")]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn from_millis(millis: u64) -> Self { Self(millis) }

    /// Converts into number of milliseconds since UNIX epoch.
    pub fn into_millis(self) -> u64 { self.0 }

    /// Converts into number of whole seconds since UNIX epoch.
    pub fn into_secs(self) -> u64 { self.0 / 1000 }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output { Timestamp(self.0 + rhs.as_millis() as u64) }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_millis(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) { self.0 += rhs.as_millis() as u64 }
}

/// Manages timers and triggers timeouts.
#[derive(Debug, Default)]
pub struct Timer {
    timeouts: BTreeSet<Timestamp>,
}

impl Timer {
    pub fn new() -> Self { Self { timeouts: bset! {} } }

    /// Return the number of timeouts being tracked.
    pub fn len(&self) -> usize { self.timeouts.len() }

    /// Check whether there are timeouts being tracked.
    pub fn is_empty(&self) -> bool { self.timeouts.is_empty() }

    /// Registers a new timeout firing `span` after the given moment.
    pub fn set_timeout(&mut self, span: Duration, after: Timestamp) {
        self.timeouts.insert(after + span);
    }

    /// Get the minimum time duration we should wait for at least one timeout to be reached.
    /// Returns `None` if there are no timeouts.
    pub fn next_expiring_from(&self, time: impl Into<Timestamp>) -> Option<Duration> {
        let time = time.into();
        self.timeouts.iter().next().map(|t| *t - time)
    }

    /// Removes timers which have fired by the given time, returning their number.
    pub fn remove_expired_by(&mut self, time: Timestamp) -> usize {
        // `split_off` keeps the key itself in the "after" half, so a timer set for exactly `time`
        // would survive; shift by one unit to expire it.
        let at = Timestamp(time.0 + 1);
        let unexpired = self.timeouts.split_off(&at);
        let fired = self.timeouts.len();
        self.timeouts = unexpired;
        fired
    }
}
