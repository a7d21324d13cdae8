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

//! Request services and their per-opcode registry.
//!
//! A service is invoked by the reactor handler once a session state machine has decoded a
//! complete request. It either answers right away or leaves the request pending, in which case
//! the answer is produced later, when the backend RPCs the request depends on complete.

pub mod backend;
pub mod frontend;

use std::collections::BTreeMap;

use crate::error::ServiceError;
use crate::wire::{Opcode, Request, Response};
use crate::ResourceId;

/// What the session has to do after a request is handled.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Reply {
    /// Queue the response.
    Respond(Response),
    /// Queue the response and close the session once it is delivered.
    RespondAndClose(Response),
    /// The response is produced later by the RAID orchestration.
    Pending,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self { Reply::Respond(response) }
}

/// Handler of a single request opcode, running over the context `C` of the serving process.
pub trait Service<C>: Send {
    /// Opcode of the requests served.
    fn opcode(&self) -> Opcode;

    /// Handles a decoded request received on the `session`. An error is answered to the peer
    /// with the matching response status, keeping the session open.
    fn handle(
        &self,
        ctx: &mut C,
        session: ResourceId,
        request: &Request,
    ) -> Result<Reply, ServiceError>;
}

/// Registry of the services a process provides, keyed by opcode.
pub struct Services<C> {
    services: BTreeMap<Opcode, Box<dyn Service<C>>>,
}

impl<C> Default for Services<C> {
    fn default() -> Self { Services { services: empty!() } }
}

impl<C> Services<C> {
    pub fn new() -> Self { Services::default() }

    pub fn with(mut self, service: impl Service<C> + 'static) -> Self {
        self.register(Box::new(service));
        self
    }

    pub fn register(&mut self, service: Box<dyn Service<C>>) {
        self.services.insert(service.opcode(), service);
    }

    /// Runs the service registered for the request opcode. Opcodes nobody serves are rejected
    /// with INVALID_ARGUMENTS.
    pub fn dispatch(&self, ctx: &mut C, session: ResourceId, request: &Request) -> Reply {
        let Some(service) = self.services.get(&request.opcode) else {
            #[cfg(feature = "log")]
            log::debug!(target: "service", "Session {session} requested {}, which is not served", request.opcode);
            let err = ServiceError::InvalidArguments(format!("{} is not served here", request.opcode));
            return Reply::Respond(Response::error(&err));
        };

        #[cfg(feature = "log")]
        log::trace!(target: "service", "Session {session} requested {} {}", request.opcode, request.arg);

        match service.handle(ctx, session, request) {
            Ok(reply) => reply,
            Err(err) => {
                #[cfg(feature = "log")]
                log::debug!(target: "service", "{} {} from session {session} failed: {err}", request.opcode, request.arg);
                Reply::Respond(Response::error(&err))
            }
        }
    }
}
