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

//! Poll engines: thin wrappers over a readiness-multiplexing primitive.

pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use std::{io, ops};

use crate::resource::{Io, ResourceId};

/// Information about I/O events which has happened for a resource.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether I/O source has data to read.
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

/// Yields write readiness before read readiness, so a session flushes its queued responses before
/// decoding more input from the peer.
impl Iterator for IoType {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        if self.write {
            self.write = false;
            Some(Io::Write)
        } else if self.read {
            self.read = false;
            Some(Io::Read)
        } else {
            None
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else {
            f.write_str("write")
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (hangup)
    Connectivity,
    /// OS-level error on the descriptor
    Os,
    /// descriptor is not open
    Invalid,
}

/// Poll engine contract used by the reactor runtime.
///
/// Ready events are buffered inside the engine and consumed through the [`Iterator`] interface,
/// one `(resource, readiness)` pair at a time.
pub trait Poll
where
    Self: Send + Iterator<Item = (ResourceId, Result<IoType, IoFail>)>,
{
    type Waker: Waker;

    /// Registers the waker receiving end under [`ResourceId::WAKER`].
    fn register_waker(&mut self, fd: &impl AsRawFd) -> io::Result<()>;

    /// Registers a new descriptor. Registering a descriptor which is already part of the poll
    /// (under any id) is rejected with [`io::ErrorKind::AlreadyExists`].
    fn register(&mut self, id: ResourceId, fd: &impl AsRawFd, interest: IoType) -> io::Result<()>;

    /// Removes the descriptor from the poll, discarding any of its events which were not yet
    /// consumed.
    fn unregister(&mut self, id: ResourceId);

    fn set_interest(&mut self, id: ResourceId, interest: IoType) -> bool;

    /// Number of registered descriptors, including the waker.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Waits for I/O no longer than `timeout`.
    ///
    /// # Returns
    ///
    /// Number of the new events. Zero means the timeout has expired (an idle tick); an empty
    /// poll returns zero immediately.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Waker wakes the reactor thread from the blocking poll call when another thread sends it a
/// command.
pub trait Waker {
    type Send: WakerSend;
    type Recv: WakerRecv;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error>;
}

pub trait WakerSend: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}

pub trait WakerRecv: AsRawFd + Send + io::Read {
    fn reset(&self);
}
