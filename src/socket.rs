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

//! Pollable sockets: the accepting listener and the per-connection service socket driven by a
//! [`StateMachine`].

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::nonblock::{IoStatus, ReadNonblocking, WriteNonblocking};
use crate::poller::IoType;
use crate::state_machine::{Inbound, StateMachine};
use crate::wire::{ProtocolError, Request, Role};
use crate::{Io, Resource, WriteAtomic};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Accept-only listening socket.
#[derive(Debug)]
pub struct ListenerSocket {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl ListenerSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        let local_addr = inner.local_addr()?;
        Ok(ListenerSocket { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }
}

impl AsRawFd for ListenerSocket {
    fn as_raw_fd(&self) -> RawFd { self.inner.as_raw_fd() }
}

impl Write for ListenerSocket {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> { Err(io::ErrorKind::Unsupported.into()) }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl WriteAtomic for ListenerSocket {
    fn is_ready_to_write(&self) -> bool { false }

    fn empty_write_buf(&mut self) -> io::Result<bool> { Ok(false) }

    fn write_or_buf(&mut self, _buf: &[u8]) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

impl Resource for ListenerSocket {
    type Event = io::Result<(TcpStream, SocketAddr)>;

    fn interests(&self) -> IoType { IoType::read_only() }

    fn handle_io(&mut self, io: Io) -> Option<Self::Event> {
        if io != Io::Read {
            return None;
        }
        match self.inner.accept() {
            Ok(accepted) => Some(Ok(accepted)),
            // Another readiness event comes with the next pending connection
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => Some(Err(err)),
        }
    }

    fn disconnect(self) -> io::Result<()> {
        drop(self.inner);
        Ok(())
    }
}

/// Outcome of an I/O readiness on a [`ServiceSocket`].
#[derive(Debug)]
pub enum SessionEvent {
    /// Complete units decoded from the peer, in arrival order.
    Received(Vec<Inbound>),
    /// The peer has broken the protocol; the session state machine is closed. Units decoded
    /// from the same read before the violation come along, though nothing can be answered
    /// on the session anymore.
    Violation {
        error: ProtocolError,
        received: Vec<Inbound>,
    },
    /// The peer has closed the connection, or the connection failed.
    Disconnected,
    /// The session was asked to finish and all of its queued output is delivered.
    Finished,
}

/// Bidirectional per-connection socket. Decoding and output queueing are delegated to the
/// session [`StateMachine`]; the socket only moves bytes between it and the kernel.
#[derive(Debug)]
pub struct ServiceSocket {
    stream: TcpStream,
    peer: SocketAddr,
    machine: StateMachine,
    buf: Vec<u8>,
    /// The connection was dialed without blocking and the handshake is not confirmed yet.
    connecting: bool,
}

impl ServiceSocket {
    pub fn new(stream: TcpStream, peer: SocketAddr, machine: StateMachine) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(ServiceSocket {
            stream,
            peer,
            machine,
            buf: vec![0u8; READ_BUFFER_SIZE],
            connecting: false,
        })
    }

    /// Socket of an accepted connection, which has to identify its role first.
    pub fn identifier(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        ServiceSocket::new(stream, peer, StateMachine::identifier())
    }

    /// Socket of a connection dialed by a backend: the identification line and the login request
    /// are queued right away and sent once the connection is up. The stream may still be
    /// connecting (see [`crate::nonblock::connect_nonblocking`]).
    pub fn declarer(
        stream: TcpStream,
        peer: SocketAddr,
        role: &Role,
        login: &Request,
    ) -> io::Result<Self> {
        let mut socket = ServiceSocket::new(stream, peer, StateMachine::declarer())?;
        socket.connecting = true;
        socket.machine.enqueue(&role.to_line());
        socket.machine.enqueue(&login.encode());
        Ok(socket)
    }

    pub fn peer(&self) -> SocketAddr { self.peer }

    pub fn machine(&self) -> &StateMachine { &self.machine }

    pub fn is_connecting(&self) -> bool { self.connecting }

    /// Confirms the handshake of a dialed connection on its first readiness event. Returns
    /// `false` if the connection has failed.
    fn confirm_connected(&mut self) -> bool {
        if !self.connecting {
            return true;
        }
        match self.stream.take_error() {
            Ok(None) => {
                #[cfg(feature = "log")]
                log::debug!(target: "service", "Connection to {} is established", self.peer);
                self.connecting = false;
                true
            }
            Ok(Some(err)) | Err(err) => {
                #[cfg(feature = "log")]
                log::debug!(target: "service", "Unable to connect to {}: {err}", self.peer);
                false
            }
        }
    }

    fn handle_readable(&mut self) -> Option<SessionEvent> {
        if !self.confirm_connected() {
            return Some(SessionEvent::Disconnected);
        }
        let mut received = vec![];
        let mut ended = false;
        loop {
            match self.stream.read_nonblocking(&mut self.buf) {
                IoStatus::Success(len) => {
                    received.extend(self.machine.feed(&self.buf[..len]));
                    if self.machine.is_closed() {
                        break;
                    }
                }
                IoStatus::WouldBlock => break,
                IoStatus::Shutdown => {
                    ended = true;
                    break;
                }
                IoStatus::Err(err) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "service", "Connection to {} failed: {err}", self.peer);
                    ended = true;
                    break;
                }
            }
        }

        if let Some(error) = self.machine.take_error() {
            return Some(SessionEvent::Violation { error, received });
        }
        if !received.is_empty() {
            // The end of the stream stays readable, so it is reported on the next poll
            return Some(SessionEvent::Received(received));
        }
        if ended {
            if let Some(err) = self.machine.end_of_input() {
                #[cfg(feature = "log")]
                log::debug!(target: "service", "Peer {} left in the middle of a frame: {err}", self.peer);
            }
            return Some(SessionEvent::Disconnected);
        }
        None
    }

    fn handle_writable(&mut self) -> Option<SessionEvent> {
        if !self.confirm_connected() {
            return Some(SessionEvent::Disconnected);
        }
        loop {
            let chunk = self.machine.drain(WRITE_CHUNK_SIZE);
            if chunk.is_empty() {
                break;
            }
            match self.stream.write_nonblocking(&chunk) {
                IoStatus::Success(len) if len < chunk.len() => {
                    self.machine.requeue(&chunk[len..]);
                    break;
                }
                IoStatus::Success(_) => {}
                IoStatus::WouldBlock => {
                    self.machine.requeue(&chunk);
                    break;
                }
                IoStatus::Shutdown => return Some(SessionEvent::Disconnected),
                IoStatus::Err(err) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "service", "Unable to write to {}: {err}", self.peer);
                    return Some(SessionEvent::Disconnected);
                }
            }
        }
        self.machine.is_finished().then_some(SessionEvent::Finished)
    }
}

impl AsRawFd for ServiceSocket {
    fn as_raw_fd(&self) -> RawFd { self.stream.as_raw_fd() }
}

impl Write for ServiceSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_or_buf(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { self.empty_write_buf().map(|_| ()) }
}

impl WriteAtomic for ServiceSocket {
    fn is_ready_to_write(&self) -> bool { !self.machine.is_closed() }

    fn empty_write_buf(&mut self) -> io::Result<bool> {
        let had_data = self.machine.wants_write();
        match self.handle_writable() {
            Some(SessionEvent::Disconnected) => Err(io::ErrorKind::ConnectionAborted.into()),
            _ if self.machine.wants_write() => Err(io::ErrorKind::WouldBlock.into()),
            _ => Ok(had_data),
        }
    }

    fn write_or_buf(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.machine.enqueue(buf) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        Ok(())
    }
}

impl Resource for ServiceSocket {
    type Event = SessionEvent;

    fn interests(&self) -> IoType {
        if self.machine.is_closed() {
            IoType::none()
        } else if self.machine.is_closing() {
            // A writable event reports the session as finished even when nothing is queued
            IoType::write_only()
        } else if self.machine.wants_write() {
            IoType::read_write()
        } else {
            IoType::read_only()
        }
    }

    fn handle_io(&mut self, io: Io) -> Option<Self::Event> {
        match io {
            Io::Read => self.handle_readable(),
            Io::Write => self.handle_writable(),
        }
    }

    fn finish(&mut self) { self.machine.close_after_flush(); }

    fn disconnect(mut self) -> io::Result<()> {
        self.machine.close();
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}
