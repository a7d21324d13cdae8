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

//! Configuration values supplied by the process bootstrap.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::layout::Geometry;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_CACHE_CAPACITY: usize = 256;
pub const DEFAULT_FRONTEND_POLL_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_BACKEND_POLL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_RPC_TIMEOUT_TICKS: u64 = 64;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// What a write does when the parity block of its stripe can't be written.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum ParityPolicy {
    /// Commit the data block, record the parity block for rebuild and acknowledge the write.
    #[default]
    #[display("defer")]
    Defer,
    /// Refuse the write.
    #[display("abort")]
    Abort,
}

impl FromStr for ParityPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "defer" => Ok(ParityPolicy::Defer),
            "abort" => Ok(ParityPolicy::Abort),
            other => Err(ConfigError::UnknownPolicy(other.to_owned())),
        }
    }
}

/// What a write does when the data disk of its block is unavailable.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
pub enum DegradedWrite {
    /// Refuse the write.
    #[default]
    #[display("refuse")]
    Refuse,
    /// Fold the new data into the parity block, recording the data block for rebuild.
    #[display("reconstruct")]
    Reconstruct,
}

impl FromStr for DegradedWrite {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refuse" => Ok(DegradedWrite::Refuse),
            "reconstruct" => Ok(DegradedWrite::Reconstruct),
            other => Err(ConfigError::UnknownPolicy(other.to_owned())),
        }
    }
}

/// Array layout: `data_disks` data disks plus one parity disk.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ArrayConfig {
    pub data_disks: usize,
    pub block_size: usize,
    pub blocks_per_disk: u64,
    /// Addresses of the backends, indexed by disk. Shown in the disk table until the backend
    /// announces its own address on login.
    pub backends: Vec<String>,
}

impl ArrayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_disks < 2 {
            return Err(ConfigError::TooFewDataDisks(self.data_disks));
        }
        if self.backends.len() != self.data_disks + 1 {
            return Err(ConfigError::BackendCount(
                self.data_disks,
                self.data_disks + 1,
                self.backends.len(),
            ));
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.blocks_per_disk == 0 {
            return Err(ConfigError::ZeroBlocks);
        }
        Ok(())
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.data_disks, self.block_size, self.blocks_per_disk)
    }
}

#[derive(Clone, Debug)]
pub struct FrontendConfig {
    pub listen: SocketAddr,
    pub array: ArrayConfig,
    pub cache_capacity: usize,
    pub poll_timeout: Duration,
    /// Number of reactor iterations a backend may take to answer before it is declared offline.
    pub rpc_timeout_ticks: u64,
    pub parity_policy: ParityPolicy,
    pub degraded_writes: DegradedWrite,
}

impl FrontendConfig {
    pub fn new(listen: SocketAddr, array: ArrayConfig) -> Self {
        FrontendConfig {
            listen,
            array,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            poll_timeout: DEFAULT_FRONTEND_POLL_TIMEOUT,
            rpc_timeout_ticks: DEFAULT_RPC_TIMEOUT_TICKS,
            parity_policy: ParityPolicy::default(),
            degraded_writes: DegradedWrite::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.array.validate()?;
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ZeroPollTimeout);
        }
        if self.rpc_timeout_ticks == 0 {
            return Err(ConfigError::ZeroRpcTimeout);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Index of the disk within the array.
    pub index: usize,
    /// Frontend address to dial.
    pub frontend: SocketAddr,
    /// Address announced to the frontend.
    pub advertise: String,
    pub disk_path: PathBuf,
    pub block_size: usize,
    pub blocks: u64,
    pub poll_timeout: Duration,
    /// Interval between attempts to reach the frontend.
    pub retry: Duration,
}

impl BackendConfig {
    pub fn new(index: usize, frontend: SocketAddr, disk_path: PathBuf, blocks: u64) -> Self {
        BackendConfig {
            index,
            frontend,
            advertise: format!("disk-{index}"),
            disk_path,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks,
            poll_timeout: DEFAULT_BACKEND_POLL_TIMEOUT,
            retry: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.blocks == 0 {
            return Err(ConfigError::ZeroBlocks);
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ZeroPollTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(data_disks: usize, backends: usize) -> ArrayConfig {
        ArrayConfig {
            data_disks,
            block_size: 512,
            blocks_per_disk: 16,
            backends: (0..backends).map(|i| format!("127.0.0.1:{}", 7001 + i)).collect(),
        }
    }

    #[test]
    fn array_validation() {
        assert_eq!(array(3, 4).validate(), Ok(()));
        assert_eq!(array(1, 2).validate(), Err(ConfigError::TooFewDataDisks(1)));
        assert_eq!(array(3, 3).validate(), Err(ConfigError::BackendCount(3, 4, 3)));

        let mut config = array(3, 4);
        config.block_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBlockSize));
    }

    #[test]
    fn frontend_validation() {
        let mut config = FrontendConfig::new("127.0.0.1:0".parse().unwrap(), array(2, 3));
        assert_eq!(config.validate(), Ok(()));
        config.rpc_timeout_ticks = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroRpcTimeout));
        config.rpc_timeout_ticks = 1;
        config.poll_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPollTimeout));
    }

    #[test]
    fn policies_parse() {
        assert_eq!("abort".parse(), Ok(ParityPolicy::Abort));
        assert_eq!("reconstruct".parse(), Ok(DegradedWrite::Reconstruct));
        assert_eq!(
            "sometimes".parse::<ParityPolicy>(),
            Err(ConfigError::UnknownPolicy(s!("sometimes")))
        );
        assert_eq!(ParityPolicy::default().to_string(), "defer");
    }
}
