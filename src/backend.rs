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

//! Reactor handler of a backend block device.
//!
//! The backend dials the frontend, identifies itself as a disk of the array and logs in. From
//! then on it only answers the frontend RPCs against its backing store. A lost connection is
//! redialed after the retry interval. Dialing never blocks the reactor: the connection is
//! registered while its handshake is still in progress and is given up if the login does not
//! complete within [`LOGIN_TIMEOUT`].

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::VecDeque;
use std::convert::Infallible;
use std::io::{Read, Seek, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::config::BackendConfig;
use crate::form::Login;
use crate::nonblock::connect_nonblocking;
use crate::runtimes::{Action, Error, Handler};
use crate::service::backend::services;
use crate::service::{Reply, Services};
use crate::socket::{ListenerSocket, ServiceSocket, SessionEvent};
use crate::state_machine::Inbound;
use crate::store::DiskStore;
use crate::wire::{Opcode, Request, Role};
use crate::{Resource, ResourceId, ResourceType, Timestamp};

/// Time the frontend has to accept the connection and answer the login.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct BlockDevice<F> {
    config: BackendConfig,
    store: DiskStore<F>,
    services: Services<DiskStore<F>>,
    dialed: Option<RawFd>,
    session: Option<ResourceId>,
    logged_in: bool,
    /// When the pending connection was dialed.
    dialed_at: Option<Timestamp>,
    actions: VecDeque<Action<ListenerSocket, ServiceSocket>>,
}

impl<F: Read + Write + Seek + Send + 'static> BlockDevice<F> {
    pub fn new(config: BackendConfig, store: DiskStore<F>) -> Self {
        BlockDevice {
            config,
            store,
            services: services(),
            dialed: None,
            session: None,
            logged_in: false,
            dialed_at: None,
            // Dial right away
            actions: VecDeque::from([Action::SetTimer(Duration::ZERO)]),
        }
    }

    pub fn is_logged_in(&self) -> bool { self.logged_in }

    fn dial(&mut self) {
        let frontend = self.config.frontend;
        let socket = connect_nonblocking(frontend).and_then(|stream| {
            let role = Role::Backend {
                index: self.config.index,
                address: self.config.advertise.clone(),
            };
            let login = Login {
                address: self.config.advertise.clone(),
                blocks: self.store.blocks(),
                block_size: self.store.block_size(),
            };
            let login =
                Request::with_body(Opcode::Login, self.config.index as u64, login.to_form().encode());
            ServiceSocket::declarer(stream, frontend, &role, &login)
        });
        match socket {
            Ok(socket) => {
                #[cfg(feature = "log")]
                log::debug!(target: "backend", "Dialing the frontend at {frontend}");
                self.dialed = Some(socket.as_raw_fd());
                self.dialed_at = Some(Timestamp::now());
                self.actions.push_back(Action::RegisterTransport(socket));
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::debug!(target: "backend", "Frontend at {frontend} is unreachable: {err}");
                self.actions.push_back(Action::SetTimer(self.config.retry));
            }
        }
    }

    fn handle_inbound(&mut self, id: ResourceId, inbound: Inbound) {
        match inbound {
            Inbound::Response(response) if !self.logged_in => {
                if response.is_ok() {
                    #[cfg(feature = "log")]
                    log::info!(target: "backend", "Logged in to the frontend as disk {}", self.config.index);
                    self.logged_in = true;
                    self.dialed_at = None;
                } else {
                    // The frontend closes the connection after a rejected login
                    #[cfg(feature = "log")]
                    log::warn!(target: "backend", "Frontend rejected the login with {}: {}", response.status, String::from_utf8_lossy(&response.body));
                }
            }
            Inbound::Request(request) => {
                match self.services.dispatch(&mut self.store, id, &request) {
                    Reply::Respond(response) => {
                        self.actions.push_back(Action::Send(id, response.encode()))
                    }
                    Reply::RespondAndClose(response) => {
                        self.actions.push_back(Action::Send(id, response.encode()));
                        self.actions.push_back(Action::Finish(id));
                    }
                    Reply::Pending => self.lost(id),
                }
            }
            unexpected => {
                #[cfg(feature = "log")]
                log::warn!(target: "backend", "Unexpected {unexpected:?} from the frontend");
                self.lost(id);
            }
        }
    }

    /// Drops the session and schedules a redial.
    fn lost(&mut self, id: ResourceId) {
        if self.session != Some(id) {
            return;
        }
        #[cfg(feature = "log")]
        log::warn!(target: "backend", "Connection to the frontend is lost; redialing in {:?}", self.config.retry);
        self.session = None;
        self.logged_in = false;
        self.dialed_at = None;
        self.actions.push_back(Action::UnregisterTransport(id));
        self.actions.push_back(Action::SetTimer(self.config.retry));
    }
}

impl<F> Iterator for BlockDevice<F> {
    type Item = Action<ListenerSocket, ServiceSocket>;

    fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
}

impl<F: Read + Write + Seek + Send + 'static> Handler for BlockDevice<F> {
    type Listener = ListenerSocket;
    type Transport = ServiceSocket;
    type Command = Infallible;

    fn tick(&mut self, time: Timestamp) {
        let Some(dialed_at) = self.dialed_at else {
            return;
        };
        if time - dialed_at < LOGIN_TIMEOUT {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "backend", "Frontend did not accept the login within {LOGIN_TIMEOUT:?}");
        self.dialed_at = None;
        if let Some(id) = self.session {
            self.lost(id);
        }
    }

    fn handle_timer(&mut self) {
        if self.session.is_none() && self.dialed.is_none() {
            self.dial();
        }
    }

    fn handle_listener_event(
        &mut self,
        id: ResourceId,
        event: <Self::Listener as Resource>::Event,
        time: Timestamp,
    ) {
    }

    fn handle_transport_event(
        &mut self,
        id: ResourceId,
        event: <Self::Transport as Resource>::Event,
        time: Timestamp,
    ) {
        match event {
            SessionEvent::Received(units) => {
                for inbound in units {
                    self.handle_inbound(id, inbound);
                }
            }
            SessionEvent::Violation { error, .. } => {
                #[cfg(feature = "log")]
                log::warn!(target: "backend", "Frontend broke the protocol: {error}");
                self.lost(id);
            }
            SessionEvent::Disconnected | SessionEvent::Finished => self.lost(id),
        }
    }

    fn handle_registered(&mut self, fd: RawFd, id: ResourceId, ty: ResourceType) {
        if ty == ResourceType::Transport && self.dialed == Some(fd) {
            self.dialed = None;
            self.session = Some(id);
        }
    }

    fn handle_command(&mut self, cmd: Self::Command) { match cmd {} }

    fn handle_error(&mut self, err: Error<Self::Listener, Self::Transport>) {
        match err {
            Error::TransportDisconnect(id, transport) => {
                let _ = transport.disconnect();
                if self.session == Some(id) {
                    self.session = None;
                    self.logged_in = false;
                    self.dialed_at = None;
                    self.actions.push_back(Action::SetTimer(self.config.retry));
                }
            }
            Error::Registration(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "backend", "Unable to register the frontend connection: {err}");
                self.dialed = None;
                self.dialed_at = None;
                self.actions.push_back(Action::SetTimer(self.config.retry));
            }
            err => {
                #[cfg(feature = "log")]
                log::error!(target: "backend", "Reactor error: {err}");
            }
        }
    }

    fn handover_listener(&mut self, id: ResourceId, listener: Self::Listener) {
        let _ = listener.disconnect();
    }

    fn handover_transport(&mut self, id: ResourceId, transport: Self::Transport) {
        if let Err(err) = transport.disconnect() {
            #[cfg(feature = "log")]
            log::debug!(target: "backend", "Unable to close the connection {id}: {err}");
        }
    }
}
