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

use std::io;
use std::net::SocketAddr;

use crate::wire::Status;

/// Per-request failure, reported to the peer as a response status.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ServiceError {
    /// invalid arguments: {0}
    InvalidArguments(String),

    /// disk refused: {0}
    DiskRefused(String),

    /// session is not open
    Disconnect,
}

impl ServiceError {
    pub fn status(&self) -> Status {
        match self {
            ServiceError::InvalidArguments(_) => Status::InvalidArguments,
            ServiceError::DiskRefused(_) => Status::DiskRefused,
            ServiceError::Disconnect => Status::Disconnect,
        }
    }

    /// Text carried in the body of the error response.
    pub fn reason(&self) -> String {
        match self {
            ServiceError::InvalidArguments(reason) | ServiceError::DiskRefused(reason) => {
                reason.clone()
            }
            ServiceError::Disconnect => s!("session is not open"),
        }
    }

    /// Restores the error from a non-OK response status and its body. Returns `None` for
    /// [`Status::Ok`].
    pub fn from_status(status: Status, body: &[u8]) -> Option<Self> {
        let reason = String::from_utf8_lossy(body).into_owned();
        match status {
            Status::Ok => None,
            Status::InvalidArguments => Some(ServiceError::InvalidArguments(reason)),
            Status::DiskRefused => Some(ServiceError::DiskRefused(reason)),
            Status::Disconnect => Some(ServiceError::Disconnect),
        }
    }
}

/// Configuration inconsistencies detected at startup.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ConfigError {
    /// array needs at least two data disks, but {0} is configured.
    TooFewDataDisks(usize),

    /// array of {0} data disks needs {1} backends, but {2} are configured.
    BackendCount(usize, usize, usize),

    /// block size must be non-zero.
    ZeroBlockSize,

    /// a disk must hold at least one block.
    ZeroBlocks,

    /// poll timeout must be non-zero.
    ZeroPollTimeout,

    /// backend RPC timeout must span at least one reactor iteration.
    ZeroRpcTimeout,

    /// unknown policy `{0}`.
    UnknownPolicy(String),
}

/// Process-level failures of the frontend and backend servers.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// invalid configuration: {0}
    #[from]
    Config(ConfigError),

    /// unable to bind listener on {0}: {1}
    Bind(SocketAddr, io::Error),

    /// unable to open the disk backing store: {0}
    Store(io::Error),

    /// unable to start the reactor thread: {0}
    Spawn(io::Error),

    /// reactor thread is unreachable: {0}
    Control(io::Error),

    /// reactor thread has panicked.
    Join,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let err = ServiceError::DiskRefused(s!("disk 2 is offline"));
        assert_eq!(err.status(), Status::DiskRefused);
        assert_eq!(ServiceError::from_status(err.status(), err.reason().as_bytes()), Some(err));
        assert_eq!(ServiceError::from_status(Status::Disconnect, b""), Some(ServiceError::Disconnect));
        assert_eq!(ServiceError::from_status(Status::Ok, b""), None);
    }
}
