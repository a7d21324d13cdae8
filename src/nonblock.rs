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

//! Non-blocking socket I/O outcomes, as seen by the session sockets.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

/// Result of a single non-blocking read or write attempt.
#[derive(Debug)]
pub enum IoStatus {
    /// Number of bytes transferred; never zero for a non-empty buffer.
    Success(usize),
    /// The operation would block; retry on the next readiness event.
    WouldBlock,
    /// The peer has closed its side of the connection.
    Shutdown,
    Err(io::Error),
}

pub trait ReadNonblocking: Read {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus {
        match self.read(buf) {
            Ok(0) if !buf.is_empty() => IoStatus::Shutdown,
            Ok(len) => IoStatus::Success(len),
            // The poll is level-triggered, so an interrupted read gets reported again
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted => {
                IoStatus::WouldBlock
            }
            Err(err) => IoStatus::Err(err),
        }
    }
}

pub trait WriteNonblocking: Write {
    fn write_nonblocking(&mut self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Success(0);
        }
        match self.write(buf) {
            Ok(0) => IoStatus::WouldBlock,
            Ok(len) => IoStatus::Success(len),
            Err(err) if err.kind() == ErrorKind::WriteZero => IoStatus::WouldBlock,
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted => {
                IoStatus::WouldBlock
            }
            Err(err) if err.kind() == ErrorKind::BrokenPipe => IoStatus::Shutdown,
            Err(err) => IoStatus::Err(err),
        }
    }
}

impl ReadNonblocking for TcpStream {}

impl WriteNonblocking for TcpStream {}

/// Starts a TCP connection without waiting for the handshake. The returned stream is
/// non-blocking and becomes writable once the handshake is over; the outcome of the handshake
/// is then available from [`TcpStream::take_error`].
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
        Err(err) => return Err(err),
    }
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn reports_would_block_then_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(server.read_nonblocking(&mut buf), IoStatus::WouldBlock));

        let mut client = client;
        assert!(matches!(client.write_nonblocking(b"ping"), IoStatus::Success(4)));
        drop(client);

        // Data written before the close is still delivered
        let mut received = vec![];
        loop {
            match server.read_nonblocking(&mut buf) {
                IoStatus::Success(len) => received.extend_from_slice(&buf[..len]),
                IoStatus::WouldBlock => std::thread::yield_now(),
                IoStatus::Shutdown => break,
                IoStatus::Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(received, b"ping");
    }

    #[test]
    fn connects_without_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = connect_nonblocking(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        assert!(client.take_error().unwrap().is_none());

        loop {
            match client.write_nonblocking(b"hello") {
                IoStatus::Success(5) => break,
                IoStatus::WouldBlock => std::thread::yield_now(),
                other => panic!("unexpected {other:?}"),
            }
        }
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
