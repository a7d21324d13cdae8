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

//! Backing store of a simulated disk: a fixed-size area holding the disk-info form, followed by
//! the blocks.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::ServiceError;
use crate::form::{DiskInfo, Form};

/// Size of the disk-info area preceding the blocks. The form is stored zero-padded.
pub const INFO_AREA_LEN: usize = 1024;

#[derive(Debug)]
pub struct DiskStore<F> {
    file: F,
    block_size: usize,
    blocks: u64,
}

impl DiskStore<File> {
    /// Opens or creates the backing file, growing it zero-filled to the full disk size.
    pub fn open(path: impl AsRef<Path>, block_size: usize, blocks: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = INFO_AREA_LEN as u64 + block_size as u64 * blocks;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(DiskStore::with(file, block_size, blocks))
    }
}

impl DiskStore<Cursor<Vec<u8>>> {
    pub fn in_memory(block_size: usize, blocks: u64) -> Self {
        let len = INFO_AREA_LEN + block_size * blocks as usize;
        DiskStore::with(Cursor::new(vec![0u8; len]), block_size, blocks)
    }
}

impl<F: Read + Write + Seek> DiskStore<F> {
    pub fn with(file: F, block_size: usize, blocks: u64) -> Self {
        DiskStore {
            file,
            block_size,
            blocks,
        }
    }

    pub fn block_size(&self) -> usize { self.block_size }

    pub fn blocks(&self) -> u64 { self.blocks }

    fn offset(&self, block: u64) -> Result<u64, ServiceError> {
        if block >= self.blocks {
            return Err(ServiceError::InvalidArguments(format!(
                "block {block} is beyond the disk of {} blocks",
                self.blocks
            )));
        }
        Ok(INFO_AREA_LEN as u64 + block * self.block_size as u64)
    }

    pub fn read_block(&mut self, block: u64) -> Result<Vec<u8>, ServiceError> {
        let offset = self.offset(block)?;
        let mut data = vec![0u8; self.block_size];
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut data))
            .map_err(io_failure)?;
        Ok(data)
    }

    pub fn write_block(&mut self, block: u64, data: &[u8]) -> Result<(), ServiceError> {
        let offset = self.offset(block)?;
        if data.len() != self.block_size {
            return Err(ServiceError::InvalidArguments(format!(
                "block must be {} bytes, not {}",
                self.block_size,
                data.len()
            )));
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .and_then(|_| self.file.flush())
            .map_err(io_failure)
    }

    /// Zero-fills every block, leaving the disk-info area intact.
    pub fn format(&mut self) -> Result<(), ServiceError> {
        let zeros = vec![0u8; self.block_size];
        self.file.seek(SeekFrom::Start(INFO_AREA_LEN as u64)).map_err(io_failure)?;
        for _ in 0..self.blocks {
            self.file.write_all(&zeros).map_err(io_failure)?;
        }
        self.file.flush().map_err(io_failure)
    }

    /// Raw disk-info form, without the padding. Empty if the disk was never initialized.
    pub fn raw_info(&mut self) -> Result<Vec<u8>, ServiceError> {
        let mut area = vec![0u8; INFO_AREA_LEN];
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_exact(&mut area))
            .map_err(io_failure)?;
        let len = area.iter().position(|byte| *byte == 0).unwrap_or(area.len());
        area.truncate(len);
        Ok(area)
    }

    pub fn info(&mut self) -> Result<Option<DiskInfo>, ServiceError> {
        let raw = self.raw_info()?;
        if raw.is_empty() {
            return Ok(None);
        }
        let info = Form::decode(&raw)
            .and_then(|form| DiskInfo::from_form(&form))
            .map_err(|err| ServiceError::DiskRefused(format!("stored disk info is corrupted: {err}")))?;
        Ok(Some(info))
    }

    pub fn set_info(&mut self, info: &DiskInfo) -> Result<(), ServiceError> {
        let mut area = info.to_form().encode();
        if area.len() > INFO_AREA_LEN {
            return Err(ServiceError::InvalidArguments(s!("disk info is too large")));
        }
        area.resize(INFO_AREA_LEN, 0);
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&area))
            .and_then(|_| self.file.flush())
            .map_err(io_failure)
    }

    /// Adds `addition` to the stored level, returning the new level.
    pub fn update_level(&mut self, addition: u64) -> Result<u64, ServiceError> {
        let Some(mut info) = self.info()? else {
            return Err(ServiceError::InvalidArguments(s!("disk is not initialized")));
        };
        info.level = info.level.saturating_add(addition);
        self.set_info(&info)?;
        Ok(info.level)
    }
}

fn io_failure(err: io::Error) -> ServiceError {
    #[cfg(feature = "log")]
    log::error!(target: "backend", "Backing store failure: {err}");
    ServiceError::DiskRefused(format!("backing store failure: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(level: u64) -> DiskInfo {
        DiskInfo {
            array: 77,
            index: 1,
            level,
            disks: 3,
            block_size: 8,
            blocks: 4,
        }
    }

    #[test]
    fn blocks() {
        let mut store = DiskStore::in_memory(8, 4);
        assert_eq!(store.read_block(3).unwrap(), vec![0; 8]);
        store.write_block(2, b"abcdefgh").unwrap();
        assert_eq!(store.read_block(2).unwrap(), b"abcdefgh");
        assert!(matches!(store.read_block(4), Err(ServiceError::InvalidArguments(_))));
        assert!(matches!(store.write_block(0, b"short"), Err(ServiceError::InvalidArguments(_))));
    }

    #[test]
    fn info_and_levels() {
        let mut store = DiskStore::in_memory(8, 4);
        assert_eq!(store.info().unwrap(), None);
        assert!(store.update_level(1).is_err());

        store.set_info(&info(0)).unwrap();
        assert_eq!(store.update_level(2).unwrap(), 2);
        assert_eq!(store.info().unwrap(), Some(info(2)));
        // The info area never overlaps with the blocks
        assert_eq!(store.read_block(0).unwrap(), vec![0; 8]);
    }

    #[test]
    fn format_zeroes_blocks_only() {
        let mut store = DiskStore::in_memory(8, 4);
        store.set_info(&info(3)).unwrap();
        for block in 0..4 {
            store.write_block(block, &[0xEE; 8]).unwrap();
        }
        store.format().unwrap();
        for block in 0..4 {
            assert_eq!(store.read_block(block).unwrap(), vec![0; 8]);
        }
        assert_eq!(store.info().unwrap(), Some(info(3)));
    }

    #[test]
    fn file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk0.img");
        {
            let mut store = DiskStore::open(&path, 8, 4).unwrap();
            store.set_info(&info(5)).unwrap();
            store.write_block(3, &[7; 8]).unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), INFO_AREA_LEN as u64 + 32);

        let mut store = DiskStore::open(&path, 8, 4).unwrap();
        assert_eq!(store.info().unwrap(), Some(info(5)));
        assert_eq!(store.read_block(3).unwrap(), vec![7; 8]);
    }
}
