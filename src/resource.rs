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

use std::fmt::Debug;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::poller::IoType;

/// I/O readiness reported for a single pollable descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

/// Kind of a resource registered inside the reactor runtime.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ResourceType {
    #[display("listener")]
    Listener,
    #[display("transport")]
    Transport,
}

/// Identifier assigned by the reactor runtime to every registered resource.
///
/// Identifiers are never reused within a single runtime, so a stale id held by a handler after the
/// resource got closed can't alias a newer connection.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("#{0}")]
pub struct ResourceId(u64);

impl ResourceId {
    /// Reserved id of the waker used by the reactor controller.
    pub const WAKER: ResourceId = ResourceId(0);

    pub(crate) fn next(self) -> ResourceId { ResourceId(self.0 + 1) }
}

impl From<u64> for ResourceId {
    fn from(raw: u64) -> Self { ResourceId(raw) }
}

/// Anything which can be registered with the reactor poll: a listener or a session socket.
///
/// The reactor calls [`Resource::handle_io`] for each readiness direction reported by the poller;
/// the resource performs the non-blocking I/O itself and reports the outcome as an event which is
/// passed to the [`crate::Handler`].
pub trait Resource: AsRawFd + WriteAtomic + Send {
    type Event;

    /// Readiness the resource is interested in at this moment.
    fn interests(&self) -> IoType;

    fn handle_io(&mut self, io: Io) -> Option<Self::Event>;

    /// Stops taking input and closes the resource once everything queued for writing has been
    /// delivered. Resources which do not buffer output may ignore the request.
    fn finish(&mut self) {}

    /// Best-effort close of the underlying descriptor.
    fn disconnect(self) -> io::Result<()>;
}

#[derive(Debug, Display, Error, From)]
pub enum WriteError {
    /// Underlying resource is not ready to accept the data: it is a listener, or a session which
    /// already went into a closed state. This error happens only due to a business logic bug in a
    /// [`crate::Handler`] implementation.
    #[display("resource not ready to accept the data")]
    NotReady,

    /// Error returned by the operation system and not by the resource itself.
    #[display(inner)]
    #[from]
    Io(io::Error),
}

/// The trait guarantees that the data are either queued in full - or, in case of an error, none of
/// the data is queued. Multiple writes are delivered to the peer in the order they were made.
pub trait WriteAtomic: io::Write {
    fn write_atomic(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        if !self.is_ready_to_write() {
            Err(WriteError::NotReady)
        } else {
            self.write_or_buf(buf).map_err(WriteError::from)
        }
    }

    fn is_ready_to_write(&self) -> bool;

    /// Empties any write buffers in a non-blocking way. If a non-blocking operation is not
    /// possible, errors with [`io::ErrorKind::WouldBlock`] kind of [`io::Error`].
    ///
    /// # Returns
    ///
    /// If the buffer contained any data before this operation.
    fn empty_write_buf(&mut self) -> io::Result<bool>;

    fn write_or_buf(&mut self, buf: &[u8]) -> io::Result<()>;
}
