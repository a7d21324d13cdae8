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

//! Services of the frontend: the client-facing RAID and administrative calls, and the LOGIN of
//! the backends.

use std::collections::HashMap;

use super::{Reply, Service, Services};
use crate::disk_manager::{DiskManager, Management};
use crate::error::ServiceError;
use crate::form::{Form, Login};
use crate::wire::{Opcode, Request, Response};
use crate::{ResourceId, Timestamp};

/// Role of a frontend session, as identified by its first line.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Peer {
    Unidentified,
    Client { open: bool },
    Backend { index: usize, address: String, logged_in: bool },
}

/// Context shared by all frontend services.
#[derive(Debug)]
pub struct FrontendState {
    pub manager: DiskManager,
    pub peers: HashMap<ResourceId, Peer>,
}

impl FrontendState {
    pub fn new(manager: DiskManager) -> Self {
        FrontendState {
            manager,
            peers: empty!(),
        }
    }

    fn require_open(&self, session: ResourceId) -> Result<(), ServiceError> {
        match self.peers.get(&session) {
            Some(Peer::Client { open: true }) => Ok(()),
            Some(Peer::Client { open: false }) => {
                Err(ServiceError::InvalidArguments(s!("session is not open; CONNECT first")))
            }
            _ => Err(ServiceError::InvalidArguments(s!("request is not allowed on this connection"))),
        }
    }
}

pub struct LoginService;

impl Service<FrontendState> for LoginService {
    fn opcode(&self) -> Opcode { Opcode::Login }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        let Some(Peer::Backend {
            index, logged_in, ..
        }) = state.peers.get(&session)
        else {
            return Err(ServiceError::InvalidArguments(s!("only a backend may log in")));
        };
        let index = *index;
        if *logged_in {
            return Err(ServiceError::InvalidArguments(s!("backend is already logged in")));
        }

        let login = Form::decode(&request.body)
            .and_then(|form| Login::from_form(&form))
            .map_err(ServiceError::from)
            .and_then(|login| {
                if request.arg != index as u64 {
                    return Err(ServiceError::InvalidArguments(format!(
                        "backend identified as disk {index} logs in as disk {}",
                        request.arg
                    )));
                }
                state.manager.login(session, index, &login)?;
                Ok(login)
            });
        match login {
            Ok(login) => {
                if let Some(Peer::Backend {
                    address, logged_in, ..
                }) = state.peers.get_mut(&session)
                {
                    *address = login.address;
                    *logged_in = true;
                }
                Ok(Response::empty().into())
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "frontend", "Rejected login of disk {index}: {err}");
                Ok(Reply::RespondAndClose(Response::error(&err)))
            }
        }
    }
}

pub struct ConnectService;

impl Service<FrontendState> for ConnectService {
    fn opcode(&self) -> Opcode { Opcode::Connect }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        _request: &Request,
    ) -> Result<Reply, ServiceError> {
        match state.peers.get_mut(&session) {
            Some(Peer::Client { open }) => {
                *open = true;
                Ok(Response::empty().into())
            }
            _ => Err(ServiceError::InvalidArguments(s!("only a client may connect"))),
        }
    }
}

pub struct DisconnectService;

impl Service<FrontendState> for DisconnectService {
    fn opcode(&self) -> Opcode { Opcode::Disconnect }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        _request: &Request,
    ) -> Result<Reply, ServiceError> {
        match state.peers.get_mut(&session) {
            Some(Peer::Client { open }) if *open => {
                *open = false;
                Ok(Reply::RespondAndClose(Response::empty()))
            }
            _ => Ok(Reply::RespondAndClose(Response::error(&ServiceError::Disconnect))),
        }
    }
}

pub struct ReadService;

impl Service<FrontendState> for ReadService {
    fn opcode(&self) -> Opcode { Opcode::Read }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        state.manager.start_read(session, request.arg)?;
        Ok(Reply::Pending)
    }
}

pub struct WriteService;

impl Service<FrontendState> for WriteService {
    fn opcode(&self) -> Opcode { Opcode::Write }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        state.manager.start_write(session, request.arg, request.body.clone())?;
        Ok(Reply::Pending)
    }
}

pub struct DisplayDisksService;

impl Service<FrontendState> for DisplayDisksService {
    fn opcode(&self) -> Opcode { Opcode::DisplayDisks }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        _request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        Ok(Response::ok(state.manager.display().into_bytes()).into())
    }
}

pub struct InitService;

impl Service<FrontendState> for InitService {
    fn opcode(&self) -> Opcode { Opcode::Init }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        let scratch = match request.arg {
            0 => false,
            1 => true,
            mode => {
                return Err(ServiceError::InvalidArguments(format!("unknown initialization mode {mode}")))
            }
        };
        state.manager.start_init(session, scratch)?;
        Ok(Reply::Pending)
    }
}

pub struct ManagementService;

impl Service<FrontendState> for ManagementService {
    fn opcode(&self) -> Opcode { Opcode::Management }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        let command = std::str::from_utf8(&request.body)
            .map_err(|_| ServiceError::InvalidArguments(s!("management command is not UTF-8")))?
            .parse::<Management>()?;
        let index = usize::try_from(request.arg)
            .map_err(|_| ServiceError::InvalidArguments(format!("disk index {} is invalid", request.arg)))?;
        state.manager.management(index, command)?;

        #[cfg(feature = "log")]
        log::info!(target: "frontend", "Management command `{command}` applied to disk {index}");

        Ok(Response::empty().into())
    }
}

pub struct TimeService;

impl Service<FrontendState> for TimeService {
    fn opcode(&self) -> Opcode { Opcode::Time }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        _request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        Ok(Response::ok(Timestamp::now().into_secs().to_string().into_bytes()).into())
    }
}

pub struct MulService;

impl Service<FrontendState> for MulService {
    fn opcode(&self) -> Opcode { Opcode::Mul }

    fn handle(
        &self,
        state: &mut FrontendState,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError> {
        state.require_open(session)?;
        let form = Form::decode(&request.body)?;
        let a = form.parse::<i64>("a")?;
        let b = form.parse::<i64>("b")?;
        let product = a
            .checked_mul(b)
            .ok_or_else(|| ServiceError::InvalidArguments(format!("{a} * {b} overflows")))?;
        Ok(Response::ok(product.to_string().into_bytes()).into())
    }
}

/// Services the frontend provides to clients and backends.
pub fn services() -> Services<FrontendState> {
    Services::new()
        .with(LoginService)
        .with(ConnectService)
        .with(DisconnectService)
        .with(ReadService)
        .with(WriteService)
        .with(DisplayDisksService)
        .with(InitService)
        .with(ManagementService)
        .with(TimeService)
        .with(MulService)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArrayConfig, FrontendConfig};
    use crate::wire::Status;

    fn state() -> FrontendState {
        let array = ArrayConfig {
            data_disks: 2,
            block_size: 8,
            blocks_per_disk: 4,
            backends: vec![s!("a"), s!("b"), s!("c")],
        };
        let config = FrontendConfig::new("127.0.0.1:0".parse().unwrap(), array);
        FrontendState::new(DiskManager::new(&config))
    }

    fn status(reply: Reply) -> Status {
        match reply {
            Reply::Respond(response) | Reply::RespondAndClose(response) => response.status,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn client_session_lifecycle() {
        let services = services();
        let mut state = state();
        let client = ResourceId::from(1);
        state.peers.insert(client, Peer::Client { open: false });

        let time = Request::new(Opcode::Time, 0);
        assert_eq!(status(services.dispatch(&mut state, client, &time)), Status::InvalidArguments);
        assert_eq!(status(services.dispatch(&mut state, client, &Request::new(Opcode::Connect, 0))), Status::Ok);
        assert_eq!(status(services.dispatch(&mut state, client, &time)), Status::Ok);

        let mul = Request::with_body(Opcode::Mul, 0, Form::new().with("a", 6).with("b", -7).encode());
        let Reply::Respond(product) = services.dispatch(&mut state, client, &mul) else {
            panic!("MUL must be answered");
        };
        assert_eq!(product.body, b"-42");

        // READ before INIT
        let read = Request::new(Opcode::Read, 0);
        assert_eq!(status(services.dispatch(&mut state, client, &read)), Status::InvalidArguments);

        let disconnect = Request::new(Opcode::Disconnect, 0);
        assert_eq!(
            services.dispatch(&mut state, client, &disconnect),
            Reply::RespondAndClose(Response::empty())
        );
        assert_eq!(
            services.dispatch(&mut state, client, &disconnect),
            Reply::RespondAndClose(Response::error(&ServiceError::Disconnect))
        );
    }

    #[test]
    fn backend_login() {
        let services = services();
        let mut state = state();
        let backend = ResourceId::from(2);
        state.peers.insert(backend, Peer::Backend {
            index: 1,
            address: s!("b"),
            logged_in: false,
        });
        let login = Login {
            address: s!("10.0.0.2:9000"),
            blocks: 4,
            block_size: 8,
        };

        let wrong_index = Request::with_body(Opcode::Login, 2, login.to_form().encode());
        assert!(matches!(
            services.dispatch(&mut state, backend, &wrong_index),
            Reply::RespondAndClose(Response { status: Status::InvalidArguments, .. })
        ));

        let request = Request::with_body(Opcode::Login, 1, login.to_form().encode());
        assert_eq!(status(services.dispatch(&mut state, backend, &request)), Status::Ok);
        assert_eq!(state.manager.disk(1).unwrap().connection(), Some(backend));
        assert_eq!(state.manager.disk(1).unwrap().address(), "10.0.0.2:9000");

        // A second backend claiming the same disk
        let intruder = ResourceId::from(3);
        state.peers.insert(intruder, Peer::Backend {
            index: 1,
            address: s!("x"),
            logged_in: false,
        });
        assert!(matches!(
            services.dispatch(&mut state, intruder, &request),
            Reply::RespondAndClose(Response { status: Status::InvalidArguments, .. })
        ));
        assert_eq!(state.manager.disk(1).unwrap().connection(), Some(backend));
    }
}
