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

//! Blocking client of the frontend, used by consoles and tests.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::disk_manager::Management;
use crate::error::ServiceError;
use crate::form::Form;
use crate::wire::{
    Opcode, ProtocolError, Request, Response, ResponseHeader, Role, RESPONSE_HEADER_LEN,
};

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum ClientError {
    /// I/O error talking to the frontend: {0}
    #[from]
    Io(io::Error),

    /// frontend broke the protocol: {0}
    #[from]
    Protocol(ProtocolError),

    /// request failed with {0}
    #[from]
    Service(ServiceError),

    /// frontend answered with an unexpected payload: {0}
    Unexpected(String),
}

/// Client session with the frontend. Requests are issued one at a time, each waiting for its
/// response.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Opens a connection and identifies it as a client, without opening the session.
    pub fn open(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.write_all(&Role::Client.to_line())?;
        Ok(Client { stream })
    }

    /// Opens a connection and a session with CONNECT.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let mut client = Client::open(addr)?;
        client.call(Request::new(Opcode::Connect, 0))?;
        Ok(client)
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    /// Sends the request and waits for the raw response, whatever its status.
    pub fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.stream.write_all(&request.encode())?;

        let mut header = [0u8; RESPONSE_HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        let header = ResponseHeader::decode(&header)?;
        let mut body = vec![0u8; header.body_len as usize];
        self.stream.read_exact(&mut body)?;
        Ok(Response {
            status: header.status,
            body,
        })
    }

    fn call(&mut self, request: Request) -> Result<Vec<u8>, ClientError> {
        Ok(self.request(&request)?.into_result()?)
    }

    fn call_text(&mut self, request: Request) -> Result<String, ClientError> {
        String::from_utf8(self.call(request)?)
            .map_err(|_| ClientError::Unexpected(s!("answer is not UTF-8")))
    }

    pub fn read(&mut self, block: u64) -> Result<Vec<u8>, ClientError> {
        self.call(Request::new(Opcode::Read, block))
    }

    pub fn write(&mut self, block: u64, data: &[u8]) -> Result<(), ClientError> {
        self.call(Request::with_body(Opcode::Write, block, data.to_vec())).map(|_| ())
    }

    /// Initializes the array, either from scratch or from the disk info kept by the disks.
    pub fn init(&mut self, scratch: bool) -> Result<(), ClientError> {
        self.call(Request::new(Opcode::Init, scratch as u64)).map(|_| ())
    }

    pub fn display_disks(&mut self) -> Result<String, ClientError> {
        self.call_text(Request::new(Opcode::DisplayDisks, 0))
    }

    pub fn management(&mut self, disk: usize, command: Management) -> Result<(), ClientError> {
        let request =
            Request::with_body(Opcode::Management, disk as u64, command.to_string().into_bytes());
        self.call(request).map(|_| ())
    }

    /// Frontend clock, in seconds since the UNIX epoch.
    pub fn time(&mut self) -> Result<u64, ClientError> {
        let text = self.call_text(Request::new(Opcode::Time, 0))?;
        text.trim().parse().map_err(|_| ClientError::Unexpected(text))
    }

    pub fn mul(&mut self, a: i64, b: i64) -> Result<i64, ClientError> {
        let form = Form::new().with("a", a).with("b", b);
        let text = self.call_text(Request::with_body(Opcode::Mul, 0, form.encode()))?;
        text.trim().parse().map_err(|_| ClientError::Unexpected(text))
    }

    /// Closes the session. The frontend closes the connection after answering.
    pub fn disconnect(mut self) -> Result<(), ClientError> {
        self.call(Request::new(Opcode::Disconnect, 0)).map(|_| ())
    }
}
