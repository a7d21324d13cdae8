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

//! Services of a backend block device, answering the frontend RPCs against its [`DiskStore`].

use std::io::{Read, Seek, Write};

use super::{Reply, Service, Services};
use crate::error::ServiceError;
use crate::form::{DiskInfo, Form};
use crate::store::DiskStore;
use crate::wire::{Opcode, Request, Response, FORMAT_DISK};
use crate::ResourceId;

pub struct GetBlockService;

impl<F: Read + Write + Seek> Service<DiskStore<F>> for GetBlockService {
    fn opcode(&self) -> Opcode { Opcode::GetBlock }

    fn handle(
        &self,
        store: &mut DiskStore<F>,
        _session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        let data = store.read_block(request.arg)?;
        Ok(Response::ok(data).into())
    }
}

pub struct SetBlockService;

impl<F: Read + Write + Seek> Service<DiskStore<F>> for SetBlockService {
    fn opcode(&self) -> Opcode { Opcode::SetBlock }

    fn handle(
        &self,
        store: &mut DiskStore<F>,
        _session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        store.write_block(request.arg, &request.body)?;
        Ok(Response::empty().into())
    }
}

pub struct GetDiskInfoService;

impl<F: Read + Write + Seek> Service<DiskStore<F>> for GetDiskInfoService {
    fn opcode(&self) -> Opcode { Opcode::GetDiskInfo }

    fn handle(
        &self,
        store: &mut DiskStore<F>,
        _session: ResourceId,
        _request: &Request,
    ) -> Result<Reply, ServiceError> {
        let info = store.raw_info()?;
        if info.is_empty() {
            return Err(ServiceError::InvalidArguments(s!("disk is not initialized")));
        }
        Ok(Response::ok(info).into())
    }
}

pub struct SetDiskInfoService;

impl<F: Read + Write + Seek> Service<DiskStore<F>> for SetDiskInfoService {
    fn opcode(&self) -> Opcode { Opcode::SetDiskInfo }

    fn handle(
        &self,
        store: &mut DiskStore<F>,
        _session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        let info = DiskInfo::from_form(&Form::decode(&request.body)?)?;
        if info.block_size != store.block_size() || info.blocks > store.blocks() {
            return Err(ServiceError::InvalidArguments(format!(
                "disk holds {} blocks of {} bytes, which does not fit the array",
                store.blocks(),
                store.block_size()
            )));
        }
        if request.arg == FORMAT_DISK {
            #[cfg(feature = "log")]
            log::info!(target: "backend", "Formatting {} blocks for array {}", store.blocks(), info.array);
            store.format()?;
        }
        store.set_info(&info)?;

        #[cfg(feature = "log")]
        log::info!(target: "backend", "Disk {} joined array {} at level {}", info.index, info.array, info.level);

        Ok(Response::empty().into())
    }
}

pub struct UpdateLevelService;

impl<F: Read + Write + Seek> Service<DiskStore<F>> for UpdateLevelService {
    fn opcode(&self) -> Opcode { Opcode::UpdateLevel }

    fn handle(
        &self,
        store: &mut DiskStore<F>,
        _session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        let level = store.update_level(request.arg)?;

        #[cfg(feature = "log")]
        log::debug!(target: "backend", "Disk level is now {level}");

        Ok(Response::ok(level.to_be_bytes().to_vec()).into())
    }
}

/// Services a backend provides to the frontend.
pub fn services<F: Read + Write + Seek + 'static>() -> Services<DiskStore<F>> {
    Services::new()
        .with(GetBlockService)
        .with(SetBlockService)
        .with(GetDiskInfoService)
        .with(SetDiskInfoService)
        .with(UpdateLevelService)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::wire::Status;

    fn respond(
        services: &Services<DiskStore<Cursor<Vec<u8>>>>,
        store: &mut DiskStore<Cursor<Vec<u8>>>,
        request: Request,
    ) -> Response {
        match services.dispatch(store, ResourceId::from(1), &request) {
            Reply::Respond(response) => response,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blocks_and_info() {
        let services = services();
        let mut store = DiskStore::in_memory(4, 2);

        let response = respond(&services, &mut store, Request::with_body(Opcode::SetBlock, 1, b"wxyz".to_vec()));
        assert!(response.is_ok());
        assert_eq!(respond(&services, &mut store, Request::new(Opcode::GetBlock, 1)).body, b"wxyz");
        assert_eq!(
            respond(&services, &mut store, Request::new(Opcode::GetBlock, 2)).status,
            Status::InvalidArguments
        );

        assert_eq!(
            respond(&services, &mut store, Request::new(Opcode::GetDiskInfo, 0)).status,
            Status::InvalidArguments
        );
        let info = DiskInfo {
            array: 1,
            index: 0,
            level: 3,
            disks: 3,
            block_size: 4,
            blocks: 2,
        };
        let set = Request::with_body(Opcode::SetDiskInfo, 0, info.to_form().encode());
        assert!(respond(&services, &mut store, set).is_ok());
        let stored = respond(&services, &mut store, Request::new(Opcode::GetDiskInfo, 0));
        assert_eq!(DiskInfo::from_form(&Form::decode(&stored.body).unwrap()).unwrap(), info);

        let level = respond(&services, &mut store, Request::new(Opcode::UpdateLevel, 2));
        assert_eq!(level.body, 5u64.to_be_bytes());

        // Plain SET_DISK_INFO keeps the blocks, a formatting one wipes them
        assert_eq!(respond(&services, &mut store, Request::new(Opcode::GetBlock, 1)).body, b"wxyz");
        let format = Request::with_body(Opcode::SetDiskInfo, FORMAT_DISK, info.to_form().encode());
        assert!(respond(&services, &mut store, format).is_ok());
        assert_eq!(respond(&services, &mut store, Request::new(Opcode::GetBlock, 1)).body, vec![0; 4]);
    }

    #[test]
    fn rejects_foreign_requests() {
        let services = services();
        let mut store = DiskStore::in_memory(4, 2);
        assert_eq!(respond(&services, &mut store, Request::new(Opcode::Read, 0)).status, Status::InvalidArguments);
        let garbage = Request::with_body(Opcode::SetDiskInfo, 0, b"level".to_vec());
        assert_eq!(respond(&services, &mut store, garbage).status, Status::InvalidArguments);
    }
}
