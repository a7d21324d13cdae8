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

//! Frames exchanged between clients, the frontend and the backend block devices.
//!
//! Every connection starts with an identification line sent by the dialing peer, followed by
//! length-delimited frames. All integers are big-endian:
//!
//! ```text
//! request:  opcode:u8 | arg:u64 | body_len:u32 | body
//! response: status:u8 | body_len:u32 | body
//! ```

use std::fmt::{self, Display, Formatter};

use crate::error::ServiceError;

/// Maximum length of a frame body.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;
/// Maximum length of the identification line, including the terminating newline.
pub const MAX_IDENT_LEN: usize = 256;
pub const REQUEST_HEADER_LEN: usize = 13;
pub const RESPONSE_HEADER_LEN: usize = 5;
/// SET_DISK_INFO argument asking the backend to zero-fill its blocks before storing the info.
pub const FORMAT_DISK: u64 = 1;

/// Wire violations. Each of them closes the connection it was observed on.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ProtocolError {
    /// identification line exceeds 256 bytes.
    IdentTooLong,

    /// malformed identification line `{0}`.
    InvalidIdent(String),

    /// unknown opcode {0:#04x}.
    UnknownOpcode(u8),

    /// unknown response status {0}.
    UnknownStatus(u8),

    /// frame body of {0} bytes exceeds the 16 MiB limit.
    BodyTooLarge(u32),

    /// connection closed in the middle of a frame.
    Truncated,
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[repr(u8)]
pub enum Opcode {
    #[display("LOGIN")]
    Login = 1,
    #[display("GET_BLOCK")]
    GetBlock = 2,
    #[display("SET_BLOCK")]
    SetBlock = 3,
    #[display("GET_DISK_INFO")]
    GetDiskInfo = 4,
    #[display("SET_DISK_INFO")]
    SetDiskInfo = 5,
    #[display("UPDATE_LEVEL")]
    UpdateLevel = 6,
    #[display("CONNECT")]
    Connect = 7,
    #[display("DISCONNECT")]
    Disconnect = 8,
    #[display("READ")]
    Read = 9,
    #[display("WRITE")]
    Write = 10,
    #[display("DISPLAY_DISKS")]
    DisplayDisks = 11,
    #[display("INIT")]
    Init = 12,
    #[display("MANAGEMENT")]
    Management = 13,
    #[display("TIME")]
    Time = 14,
    #[display("MUL")]
    Mul = 15,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Opcode::Login,
            2 => Opcode::GetBlock,
            3 => Opcode::SetBlock,
            4 => Opcode::GetDiskInfo,
            5 => Opcode::SetDiskInfo,
            6 => Opcode::UpdateLevel,
            7 => Opcode::Connect,
            8 => Opcode::Disconnect,
            9 => Opcode::Read,
            10 => Opcode::Write,
            11 => Opcode::DisplayDisks,
            12 => Opcode::Init,
            13 => Opcode::Management,
            14 => Opcode::Time,
            15 => Opcode::Mul,
            unknown => return Err(ProtocolError::UnknownOpcode(unknown)),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[repr(u8)]
pub enum Status {
    #[display("OK")]
    Ok = 0,
    #[display("INVALID_ARGUMENTS")]
    InvalidArguments = 1,
    #[display("DISK_REFUSED")]
    DiskRefused = 2,
    #[display("DISCONNECT")]
    Disconnect = 3,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::InvalidArguments,
            2 => Status::DiskRefused,
            3 => Status::Disconnect,
            unknown => return Err(ProtocolError::UnknownStatus(unknown)),
        })
    }
}

/// Role declared by the dialing peer in its identification line.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Role {
    Client,
    Backend { index: usize, address: String },
}

impl Role {
    /// Parses the identification line with the terminating newline already stripped.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidIdent(line.to_owned());
        let mut words = line.split_ascii_whitespace();
        let role = match words.next() {
            Some("CLIENT") => Role::Client,
            Some("BACKEND") => {
                let index = words.next().and_then(|w| w.parse().ok()).ok_or_else(invalid)?;
                let address = words.next().ok_or_else(invalid)?.to_owned();
                Role::Backend { index, address }
            }
            _ => return Err(invalid()),
        };
        if words.next().is_some() {
            return Err(invalid());
        }
        Ok(role)
    }

    pub fn to_line(&self) -> Vec<u8> { format!("{self}\n").into_bytes() }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("CLIENT"),
            Role::Backend { index, address } => write!(f, "BACKEND {index} {address}"),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub arg: u64,
    pub body_len: u32,
}

impl RequestHeader {
    /// Decodes the header from exactly [`REQUEST_HEADER_LEN`] bytes.
    pub fn decode(bytes: &[u8; REQUEST_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let opcode = Opcode::try_from(bytes[0])?;
        let mut arg = [0u8; 8];
        arg.copy_from_slice(&bytes[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[9..13]);
        let body_len = check_len(u32::from_be_bytes(len))?;
        Ok(RequestHeader {
            opcode,
            arg: u64::from_be_bytes(arg),
            body_len,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ResponseHeader {
    pub status: Status,
    pub body_len: u32,
}

impl ResponseHeader {
    /// Decodes the header from exactly [`RESPONSE_HEADER_LEN`] bytes.
    pub fn decode(bytes: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let status = Status::try_from(bytes[0])?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[1..5]);
        let body_len = check_len(u32::from_be_bytes(len))?;
        Ok(ResponseHeader { status, body_len })
    }
}

fn check_len(len: u32) -> Result<u32, ProtocolError> {
    if len as usize > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(len));
    }
    Ok(len)
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Request {
    pub opcode: Opcode,
    pub arg: u64,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(opcode: Opcode, arg: u64) -> Self {
        Request {
            opcode,
            arg,
            body: vec![],
        }
    }

    pub fn with_body(opcode: Opcode, arg: u64, body: Vec<u8>) -> Self {
        Request { opcode, arg, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_HEADER_LEN + self.body.len());
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.arg.to_be_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Response {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: Vec<u8>) -> Self {
        Response {
            status: Status::Ok,
            body,
        }
    }

    pub fn empty() -> Self { Response::ok(vec![]) }

    pub fn error(err: &ServiceError) -> Self {
        Response {
            status: err.status(),
            body: err.reason().into_bytes(),
        }
    }

    pub fn is_ok(&self) -> bool { self.status == Status::Ok }

    /// Converts the response into the payload of a successful call or the reported failure.
    pub fn into_result(self) -> Result<Vec<u8>, ServiceError> {
        match ServiceError::from_status(self.status, &self.body) {
            None => Ok(self.body),
            Some(err) => Err(err),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_HEADER_LEN + self.body.len());
        buf.push(self.status as u8);
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

impl From<Result<Vec<u8>, ServiceError>> for Response {
    fn from(result: Result<Vec<u8>, ServiceError>) -> Self {
        match result {
            Ok(body) => Response::ok(body),
            Err(err) => Response::error(&err),
        }
    }
}
