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

//! Frontend and backend servers: a handler running inside its own reactor thread.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fs::File;
use std::io;
use std::net::SocketAddr;

use crossbeam_channel as chan;

use crate::backend::BlockDevice;
use crate::config::{BackendConfig, FrontendConfig};
use crate::disk_manager::DiskSnapshot;
use crate::error::Error;
use crate::frontend::{Command, Frontend};
use crate::poller::popol::{Poller, PopolWaker};
use crate::poller::Waker;
use crate::runtimes::{Controller, Handler};
use crate::socket::ListenerSocket;
use crate::store::DiskStore;
use crate::Reactor;

pub type ServerController<H> = Controller<<H as Handler>::Command, <PopolWaker as Waker>::Send>;

pub struct AsyncServer<H: Handler> {
    reactor: Reactor<H, Poller>,
    local_addr: Option<SocketAddr>,
}

pub type FrontendServer = AsyncServer<Frontend>;

pub type BackendServer = AsyncServer<BlockDevice<File>>;

impl<H: Handler + 'static> AsyncServer<H> {
    /// Address the server accepts connections on, if it listens at all.
    pub fn local_addr(&self) -> Option<SocketAddr> { self.local_addr }

    pub fn controller(&self) -> ServerController<H> { self.reactor.controller() }

    /// Shuts the reactor down, closing all the connections, and waits for its thread to finish.
    pub fn stop(self) -> Result<(), Error> {
        if self.reactor.controller().shutdown().is_err() {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor-controller", "Reactor is already gone");
        }
        self.reactor.join().map_err(|_| Error::Join)
    }
}

impl AsyncServer<Frontend> {
    pub fn start(config: FrontendConfig) -> Result<Self, Error> {
        config.validate()?;
        let listener =
            ListenerSocket::bind(config.listen).map_err(|err| Error::Bind(config.listen, err))?;
        let local_addr = listener.local_addr();
        let handler = Frontend::new(&config, listener);
        let reactor = Reactor::named(handler, Poller::new(), config.poll_timeout, s!("raid5-frontend"))
            .map_err(Error::Spawn)?;
        Ok(AsyncServer {
            reactor,
            local_addr: Some(local_addr),
        })
    }

    /// Current disk table, as seen by the reactor thread.
    pub fn status(&self) -> Result<Vec<DiskSnapshot>, Error> {
        let (sender, receiver) = chan::bounded(1);
        self.controller().cmd(Command::Status(sender)).map_err(Error::Control)?;
        receiver.recv().map_err(|_| Error::Control(io::ErrorKind::BrokenPipe.into()))
    }
}

impl AsyncServer<BlockDevice<File>> {
    pub fn start(config: BackendConfig) -> Result<Self, Error> {
        config.validate()?;
        let store =
            DiskStore::open(&config.disk_path, config.block_size, config.blocks).map_err(Error::Store)?;

        #[cfg(feature = "log")]
        log::info!(target: "backend", "Disk {} is backed by {}", config.index, config.disk_path.display());

        let name = format!("raid5-backend-{}", config.index);
        let poll_timeout = config.poll_timeout;
        let handler = BlockDevice::new(config, store);
        let reactor = Reactor::named(handler, Poller::new(), poll_timeout, name).map_err(Error::Spawn)?;
        Ok(AsyncServer {
            reactor,
            local_addr: None,
        })
    }
}
