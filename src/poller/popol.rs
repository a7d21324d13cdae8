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

//! Poll engine based on the [`popol`] library.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll, Waker, WakerRecv, WakerSend};
use crate::resource::ResourceId;

/// Manager for a set of resources which are polled for an event loop by the reactor by using
/// [`popol`] library.
pub struct Poller {
    sources: popol::Sources<ResourceId>,
    fds: HashMap<RawFd, ResourceId>,
    buf: Vec<popol::Event<ResourceId>>,
    events: VecDeque<(ResourceId, Result<IoType, IoFail>)>,
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            fds: empty!(),
            buf: vec![],
            events: empty!(),
        }
    }

    fn apply_interest(&mut self, id: ResourceId, interest: IoType) -> bool {
        if !self.fds.values().any(|known| *known == id) {
            return false;
        }
        self.sources.unset(&id, popol::interest::ALL);
        if interest.read {
            self.sources.set(&id, popol::interest::READ);
        }
        if interest.write {
            self.sources.set(&id, popol::interest::WRITE);
        }
        true
    }
}

impl Poll for Poller {
    type Waker = PopolWaker;

    fn register_waker(&mut self, fd: &impl AsRawFd) -> io::Result<()> {
        self.register(ResourceId::WAKER, fd, IoType::read_only())
    }

    fn register(&mut self, id: ResourceId, fd: &impl AsRawFd, interest: IoType) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        if let Some(existing) = self.fds.get(&raw) {
            #[cfg(feature = "log")]
            log::warn!(target: "popol", "Descriptor {raw} is already registered as {existing}");
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {raw} is already registered as {existing}"),
            ));
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {id} (fd={raw}) with interest `{interest}`");

        self.sources.register(id, fd, popol::interest::READ);
        self.fds.insert(raw, id);
        self.apply_interest(id, interest);
        Ok(())
    }

    fn unregister(&mut self, id: ResourceId) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {id}");

        self.sources.unregister(&id);
        self.fds.retain(|_, known| *known != id);
        // Events which were already fetched for the resource must not outlive it
        self.events.retain(|(ev_id, _)| *ev_id != id);
    }

    fn set_interest(&mut self, id: ResourceId, interest: IoType) -> bool {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Setting interest `{interest}` on {id}");

        self.apply_interest(id, interest)
    }

    fn len(&self) -> usize { self.fds.len() }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        if self.fds.is_empty() {
            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Nothing to poll; idle tick");
            return Ok(0);
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol",
            "Polling {} resources with timeout {timeout:?} (pending event queue is {len})",
            self.fds.len(),
        );

        let timeout = match timeout {
            Some(duration) => popol::Timeout::from(duration),
            None => popol::Timeout::Never,
        };

        self.buf.clear();
        // Blocking call
        match self.sources.poll(&mut self.buf, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        for event in self.buf.drain(..) {
            let res = if event.is_invalid() {
                Err(IoFail::Invalid)
            } else if event.is_error() {
                Err(IoFail::Os)
            } else if event.is_hangup() && !event.is_readable() {
                // A peer hangup with pending data is reported as readable first: the data must be
                // consumed before the session learns about the end of stream.
                Err(IoFail::Connectivity)
            } else {
                Ok(IoType {
                    read: event.is_readable() || event.is_hangup(),
                    write: event.is_writable(),
                })
            };
            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Got `{res:?}` for {}", event.key);
            self.events.push_back((event.key, res))
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Poll resulted in {} new event(s)", self.events.len() - len);

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (ResourceId, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.events.pop_front();
        #[cfg(feature = "log")]
        match &item {
            Some((id, Ok(io))) => {
                log::trace!(target: "popol", "Popped event `{io}` for {id} from the queue")
            }
            Some((id, Err(err))) => {
                log::trace!(target: "popol", "Popped error `{err}` for {id} from the queue")
            }
            None => log::trace!(target: "popol", "Popol queue emptied"),
        }
        item
    }
}

/// Waker made of a connected pair of unix sockets: the sending half writes a byte, the receiving
/// half is registered for reading in the poll.
pub struct PopolWaker;

impl Waker for PopolWaker {
    type Send = WakerWriter;
    type Recv = WakerReader;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;
        Ok((WakerWriter(Arc::new(writer)), WakerReader(reader)))
    }
}

#[derive(Clone)]
pub struct WakerWriter(Arc<UnixStream>);

impl WakerSend for WakerWriter {
    fn wake(&self) -> io::Result<()> {
        match (&*self.0).write(&[1]) {
            Ok(_) => Ok(()),
            // The socket buffer is full, so the reactor is already going to wake up
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

pub struct WakerReader(UnixStream);

impl AsRawFd for WakerReader {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

impl Read for WakerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { self.0.read(buf) }
}

impl WakerRecv for WakerReader {
    fn reset(&self) {
        let mut buf = [0u8; 64];
        while let Ok(len) = (&self.0).read(&mut buf) {
            if len == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};

    use super::*;

    #[test]
    fn empty_poll_is_idle_tick() {
        let mut poller = Poller::new();
        assert!(poller.is_empty());
        assert_eq!(poller.poll(Some(Duration::from_secs(5))).unwrap(), 0);
        assert!(poller.next().is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut poller = Poller::new();
        poller.register(ResourceId::from(1), &listener, IoType::read_only()).unwrap();
        let err = poller.register(ResourceId::from(2), &listener, IoType::read_only()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(poller.len(), 1);
    }

    #[test]
    fn reports_readiness_and_forgets_unregistered() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut poller = Poller::new();
        let id = ResourceId::from(7);
        poller.register(id, &listener, IoType::read_only()).unwrap();
        assert_eq!(poller.poll(Some(Duration::from_secs(5))).unwrap(), 1);

        // Closing from within the same cycle drops the queued readiness
        poller.unregister(id);
        assert!(poller.next().is_none());
        assert!(poller.is_empty());
    }

    #[test]
    fn waker_wakes_poll() {
        let (writer, reader) = PopolWaker::pair().unwrap();
        let mut poller = Poller::new();
        poller.register_waker(&reader).unwrap();
        writer.wake().unwrap();
        writer.wake().unwrap();
        assert_eq!(poller.poll(Some(Duration::from_secs(5))).unwrap(), 1);
        let (id, res) = poller.next().unwrap();
        assert_eq!(id, ResourceId::WAKER);
        assert!(res.unwrap().read);
        reader.reset();
        assert_eq!(poller.poll(Some(Duration::from_millis(10))).unwrap(), 0);
    }
}
