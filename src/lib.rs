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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Networked RAID-5 block storage array.
//!
//! A frontend process exposes a virtual disk to clients while striping the data with rotating
//! parity across `k + 1` backend block-device processes, tolerating the loss of any single
//! backend. Every process runs a single-threaded poll [`Reactor`]: listeners and sessions are
//! resources polled by one dedicated thread, which feeds the received bytes into per-session
//! state machines and runs the request services in the context of that thread.
//!
//! The frontend side of the RAID logic lives in the [`disk_manager`], which keeps client
//! operations waiting for backend replies as explicit continuation records instead of blocking
//! the reactor thread.

#[macro_use]
extern crate amplify;

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod disk_manager;
pub mod error;
pub mod form;
pub mod frontend;
pub mod layout;
pub mod nonblock;
pub mod poller;
mod reactor;
mod resource;
pub mod runtimes;
pub mod server;
pub mod service;
pub mod socket;
pub mod state_machine;
pub mod store;
mod timeouts;
pub mod wire;

pub use resource::{Io, Resource, ResourceId, ResourceType, WriteAtomic, WriteError};
pub use timeouts::{Timer, Timestamp};

pub use self::reactor::Reactor;
pub use self::runtimes::{Action, Controller, Error, Handler};
