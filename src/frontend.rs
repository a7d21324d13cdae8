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

//! Reactor handler of the frontend process.
//!
//! Sessions are accepted on a single listener and identify themselves with their first line as
//! either a client or a backend. Requests of a session are served strictly one at a time in
//! arrival order: a request left pending by the RAID orchestration blocks the session backlog
//! until its completion is answered.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use crossbeam_channel as chan;

use crate::config::FrontendConfig;
use crate::disk_manager::{DiskManager, DiskSnapshot, Effect};
use crate::runtimes::{Action, Error, Handler};
use crate::service::frontend::{services, FrontendState, Peer};
use crate::service::{Reply, Services};
use crate::socket::{ListenerSocket, ServiceSocket, SessionEvent};
use crate::state_machine::Inbound;
use crate::wire::{Request, Response, Role};
use crate::{Resource, ResourceId, ResourceType, Timestamp};

/// Commands accepted by the frontend through the reactor controller.
#[derive(Debug)]
pub enum Command {
    /// Report the disk table on the channel.
    Status(chan::Sender<Vec<DiskSnapshot>>),
}

#[derive(Debug, Default)]
struct Session {
    /// A request of the session waits for the RAID orchestration.
    busy: bool,
    backlog: VecDeque<Request>,
    closing: bool,
}

pub struct Frontend {
    state: FrontendState,
    services: Services<FrontendState>,
    sessions: HashMap<ResourceId, Session>,
    /// Accepted connections waiting for the reactor to assign them an id.
    accepted: HashMap<RawFd, SocketAddr>,
    actions: VecDeque<Action<ListenerSocket, ServiceSocket>>,
}

impl Frontend {
    pub fn new(config: &FrontendConfig, listener: ListenerSocket) -> Self {
        #[cfg(feature = "log")]
        log::info!(target: "frontend", "Serving an array of {} + 1 disks on {}", config.array.data_disks, listener.local_addr());

        Frontend {
            state: FrontendState::new(DiskManager::new(config)),
            services: services(),
            sessions: empty!(),
            accepted: empty!(),
            actions: VecDeque::from([Action::RegisterListener(listener)]),
        }
    }

    pub fn manager(&self) -> &DiskManager { &self.state.manager }

    fn handle_inbound(&mut self, id: ResourceId, inbound: Inbound) {
        match inbound {
            Inbound::Identified(role) => {
                #[cfg(feature = "log")]
                log::info!(target: "frontend", "Session {id} is a {role}");
                let peer = match role {
                    Role::Client => Peer::Client { open: false },
                    Role::Backend { index, address } => Peer::Backend {
                        index,
                        address,
                        logged_in: false,
                    },
                };
                self.state.peers.insert(id, peer);
            }
            Inbound::Request(request) => {
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };
                if session.closing {
                    #[cfg(feature = "log")]
                    log::debug!(target: "frontend", "Session {id} is closing; ignoring {}", request.opcode);
                    return;
                }
                session.backlog.push_back(request);
                self.serve(id);
            }
            Inbound::Response(response) => {
                if !self.state.manager.on_reply(id, response) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "frontend", "Session {id} sent a response but is not a disk");
                    self.close_session(id);
                }
            }
        }
    }

    /// Serves the backlog of the session until a request is left pending.
    fn serve(&mut self, id: ResourceId) {
        loop {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };
            if session.busy || session.closing {
                return;
            }
            let Some(request) = session.backlog.pop_front() else {
                return;
            };

            match self.services.dispatch(&mut self.state, id, &request) {
                Reply::Respond(response) => self.respond(id, response),
                Reply::RespondAndClose(response) => {
                    self.respond(id, response);
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.closing = true;
                        session.backlog.clear();
                    }
                    self.actions.push_back(Action::Finish(id));
                }
                Reply::Pending => {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.busy = true;
                    }
                }
            }
        }
    }

    fn respond(&mut self, id: ResourceId, response: Response) {
        self.actions.push_back(Action::Send(id, response.encode()));
    }

    /// Turns the output of the disk manager into reactor actions.
    fn flush_manager(&mut self) {
        loop {
            let effects = self.state.manager.take_effects();
            let completions = self.state.manager.take_completions();
            if effects.is_empty() && completions.is_empty() {
                break;
            }
            for effect in effects {
                match effect {
                    Effect::Send(conn, frame) => self.actions.push_back(Action::Send(conn, frame)),
                    Effect::Close(conn) => self.close_session(conn),
                }
            }
            for completion in completions {
                let client = completion.client;
                let Some(session) = self.sessions.get_mut(&client) else {
                    #[cfg(feature = "log")]
                    log::debug!(target: "frontend", "Session {client} is gone; dropping its result");
                    continue;
                };
                session.busy = false;
                self.respond(client, Response::from(completion.result));
                self.serve(client);
            }
        }
    }

    /// Forgets the session, reporting a lost backend to the disk manager.
    fn drop_session(&mut self, id: ResourceId) -> bool {
        if self.sessions.remove(&id).is_none() {
            return false;
        }
        if let Some(Peer::Backend { index, .. }) = self.state.peers.remove(&id) {
            #[cfg(feature = "log")]
            log::info!(target: "frontend", "Connection of disk {index} is closed");
            self.state.manager.on_disconnect(id);
        }
        true
    }

    fn close_session(&mut self, id: ResourceId) {
        if self.drop_session(id) {
            self.actions.push_back(Action::UnregisterTransport(id));
        }
    }
}

impl Iterator for Frontend {
    type Item = Action<ListenerSocket, ServiceSocket>;

    fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
}

impl Handler for Frontend {
    type Listener = ListenerSocket;
    type Transport = ServiceSocket;
    type Command = Command;

    fn tick(&mut self, time: Timestamp) {
        self.state.manager.tick(time);
        self.flush_manager();
    }

    fn handle_timer(&mut self) {}

    fn handle_listener_event(
        &mut self,
        id: ResourceId,
        event: <Self::Listener as Resource>::Event,
        time: Timestamp,
    ) {
        let (stream, peer) = match event {
            Ok(accepted) => accepted,
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "frontend", "Unable to accept a connection: {err}");
                return;
            }
        };
        match ServiceSocket::identifier(stream, peer) {
            Ok(socket) => {
                #[cfg(feature = "log")]
                log::debug!(target: "frontend", "Accepted connection from {peer}");
                self.accepted.insert(socket.as_raw_fd(), peer);
                self.actions.push_back(Action::RegisterTransport(socket));
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "frontend", "Unable to set up connection from {peer}: {err}");
            }
        }
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
            SessionEvent::Violation { error, received } => {
                #[cfg(feature = "log")]
                log::warn!(target: "frontend", "Session {id} broke the protocol: {error}");
                // Backend replies still complete the operations waiting for them
                for inbound in received {
                    self.handle_inbound(id, inbound);
                }
                self.close_session(id);
            }
            SessionEvent::Disconnected => {
                #[cfg(feature = "log")]
                log::debug!(target: "frontend", "Session {id} has disconnected");
                self.close_session(id);
            }
            SessionEvent::Finished => self.close_session(id),
        }
        self.flush_manager();
    }

    fn handle_registered(&mut self, fd: RawFd, id: ResourceId, ty: ResourceType) {
        if ty != ResourceType::Transport {
            return;
        }
        let peer = self.accepted.remove(&fd);
        #[cfg(feature = "log")]
        log::debug!(target: "frontend", "Session {id} with {peer:?} is registered");
        self.sessions.insert(id, Session::default());
        self.state.peers.insert(id, Peer::Unidentified);
    }

    fn handle_command(&mut self, cmd: Self::Command) {
        match cmd {
            Command::Status(reply) => {
                if reply.send(self.state.manager.snapshot()).is_err() {
                    #[cfg(feature = "log")]
                    log::debug!(target: "frontend", "Status requester is gone");
                }
            }
        }
    }

    fn handle_error(&mut self, err: Error<Self::Listener, Self::Transport>) {
        match err {
            Error::TransportDisconnect(id, transport) => {
                #[cfg(feature = "log")]
                log::debug!(target: "frontend", "Session {id} got disconnected");
                self.drop_session(id);
                let _ = transport.disconnect();
                self.flush_manager();
            }
            Error::ListenerDisconnect(id, listener) => {
                #[cfg(feature = "log")]
                log::error!(target: "frontend", "Listener {id} is lost; no new sessions are accepted");
                let _ = listener.disconnect();
            }
            err => {
                #[cfg(feature = "log")]
                log::error!(target: "frontend", "Reactor error: {err}");
            }
        }
    }

    fn handover_listener(&mut self, id: ResourceId, listener: Self::Listener) {
        let _ = listener.disconnect();
    }

    fn handover_transport(&mut self, id: ResourceId, transport: Self::Transport) {
        if let Err(err) = transport.disconnect() {
            #[cfg(feature = "log")]
            log::debug!(target: "frontend", "Unable to close session {id}: {err}");
        }
    }
}
