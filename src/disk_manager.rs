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

//! RAID-5 orchestration over the backend disks.
//!
//! The manager is a passive object driven by the frontend reactor handler. Client-facing
//! operations are kept as explicit continuation records: each operation issues a batch of backend
//! RPCs, waits for all of their replies and then advances to its next step. Replies are fed back
//! with [`DiskManager::on_reply`]; RPC frames to send and connections to close are collected as
//! [`Effect`]s, and finished client operations as [`Completion`]s, which the handler drains after
//! every call.
//!
//! Each disk has a FIFO queue of RPCs with at most one of them in flight, matching the one
//! request at a time rule of the wire protocol. Operations touching the same stripe are
//! serialized by a per-stripe FIFO lock.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::cache::{BlockCache, BlockKey};
use crate::config::{DegradedWrite, FrontendConfig, ParityPolicy};
use crate::error::ServiceError;
use crate::form::{DiskInfo, Form, Login};
use crate::layout::{xor_all, xor_into, Geometry, Location};
use crate::wire::{Opcode, Request, Response, Status, FORMAT_DISK};
use crate::{ResourceId, Timestamp};

pub type OpId = u64;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum DiskStatus {
    #[display("online")]
    Online,
    #[display("offline")]
    Offline,
    #[display("rebuilding")]
    Rebuilding,
}

/// Administrative command carried by MANAGEMENT requests.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Management {
    #[display("offline")]
    Offline,
    #[display("rebuild")]
    Rebuild,
}

impl FromStr for Management {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "offline" => Ok(Management::Offline),
            "rebuild" => Ok(Management::Rebuild),
            other => Err(ServiceError::InvalidArguments(format!("unknown management command `{other}`"))),
        }
    }
}

/// I/O the reactor handler has to perform on behalf of the manager.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Effect {
    /// Send an encoded request frame to a backend connection.
    Send(ResourceId, Vec<u8>),
    /// Close a backend connection.
    Close(ResourceId),
}

/// Result of a client-facing operation, to be answered on the client session.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Completion {
    pub client: ResourceId,
    pub result: Result<Vec<u8>, ServiceError>,
}

/// Point-in-time view of a disk, used for reporting.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DiskSnapshot {
    pub index: usize,
    pub address: String,
    pub status: DiskStatus,
    pub level: u64,
    pub dirty: usize,
    pub connected: bool,
}

impl Display for DiskSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {} {}", self.index, self.address, self.status, self.level, self.dirty)
    }
}

#[derive(Debug)]
struct Rpc {
    /// Operation awaiting the reply; `None` for notifications nobody waits for.
    op: Option<OpId>,
    request: Request,
}

#[derive(Debug)]
struct InFlight {
    rpc: Rpc,
    sent: u64,
}

#[derive(Debug)]
pub struct Disk {
    index: usize,
    address: String,
    status: DiskStatus,
    level: u64,
    conn: Option<ResourceId>,
    queue: VecDeque<Rpc>,
    in_flight: Option<InFlight>,
    /// Physical blocks which missed a write and must be rebuilt.
    dirty: BTreeSet<u64>,
    rebuild: Option<OpId>,
}

impl Disk {
    fn new(index: usize, address: String) -> Self {
        Disk {
            index,
            address,
            status: DiskStatus::Offline,
            level: 0,
            conn: None,
            queue: empty!(),
            in_flight: None,
            dirty: empty!(),
            rebuild: None,
        }
    }

    pub fn index(&self) -> usize { self.index }

    pub fn address(&self) -> &str { &self.address }

    pub fn status(&self) -> DiskStatus { self.status }

    pub fn level(&self) -> u64 { self.level }

    pub fn connection(&self) -> Option<ResourceId> { self.conn }

    pub fn dirty(&self) -> &BTreeSet<u64> { &self.dirty }

    /// Whether the disk serves client I/O.
    pub fn is_available(&self) -> bool { self.status == DiskStatus::Online }

    pub fn snapshot(&self) -> DiskSnapshot {
        DiskSnapshot {
            index: self.index,
            address: self.address.clone(),
            status: self.status,
            level: self.level,
            dirty: self.dirty.len(),
            connected: self.conn.is_some(),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ReadStep {
    Start,
    Direct,
    Reconstruct,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum WriteStep {
    Start,
    Fetch,
    Reconstruct,
    Store { data: bool, parity: bool },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum RebuildStep {
    Next,
    Locked(u64),
    Fetch(u64),
    Store(u64),
    Level,
}

#[derive(Debug)]
enum Task {
    Read { loc: Location, step: ReadStep },
    Write { loc: Location, data: Vec<u8>, step: WriteStep },
    Init { scratch: bool, array: u64, awaiting: bool },
    Rebuild { disk: usize, step: RebuildStep },
}

#[derive(Debug)]
struct Operation {
    client: Option<ResourceId>,
    /// Stripe lock held by the operation.
    stripe: Option<u64>,
    task: Task,
    /// Number of RPCs of the current batch still awaiting replies.
    pending: usize,
    replies: BTreeMap<usize, Result<Vec<u8>, ServiceError>>,
}

impl Operation {
    fn set_read(&mut self, next: ReadStep) {
        if let Task::Read { step, .. } = &mut self.task {
            *step = next;
        }
    }

    fn set_write(&mut self, next: WriteStep) {
        if let Task::Write { step, .. } = &mut self.task {
            *step = next;
        }
    }

    fn set_rebuild(&mut self, next: RebuildStep) {
        if let Task::Rebuild { step, .. } = &mut self.task {
            *step = next;
        }
    }

    fn write_data(&self) -> Vec<u8> {
        match &self.task {
            Task::Write { data, .. } => data.clone(),
            _ => vec![],
        }
    }
}

enum Flow {
    /// Waiting for the replies of the issued batch.
    Wait,
    /// Waiting for the stripe lock.
    Lock(u64),
    Done(Result<Vec<u8>, ServiceError>),
}

/// How a disk going offline treats its connection.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Link {
    /// Connection stays open, the disk is only taken out of the array.
    Keep,
    /// Connection is already gone.
    Drop,
    /// Connection must be closed.
    Close,
}

fn refused(reason: impl Into<String>) -> ServiceError { ServiceError::DiskRefused(reason.into()) }

fn invalid(reason: impl Into<String>) -> ServiceError {
    ServiceError::InvalidArguments(reason.into())
}

#[derive(Debug)]
pub struct DiskManager {
    geometry: Geometry,
    disks: Vec<Disk>,
    cache: BlockCache,
    parity_policy: ParityPolicy,
    degraded_writes: DegradedWrite,
    rpc_timeout: u64,

    initialized: bool,
    array: Option<u64>,
    level: u64,

    ticks: u64,
    now: Timestamp,

    last_op: OpId,
    ops: HashMap<OpId, Operation>,
    ready: VecDeque<OpId>,
    locks: HashMap<u64, VecDeque<OpId>>,

    effects: Vec<Effect>,
    completions: Vec<Completion>,
}

impl DiskManager {
    pub fn new(config: &FrontendConfig) -> Self {
        let geometry = config.array.geometry();
        let disks = (0..geometry.disks())
            .map(|index| {
                let address = config.array.backends.get(index).cloned().unwrap_or_default();
                Disk::new(index, address)
            })
            .collect();
        DiskManager {
            geometry,
            disks,
            cache: BlockCache::new(config.cache_capacity),
            parity_policy: config.parity_policy,
            degraded_writes: config.degraded_writes,
            rpc_timeout: config.rpc_timeout_ticks,
            initialized: false,
            array: None,
            level: 0,
            ticks: 0,
            now: Timestamp::default(),
            last_op: 0,
            ops: empty!(),
            ready: empty!(),
            locks: empty!(),
            effects: vec![],
            completions: vec![],
        }
    }

    pub fn geometry(&self) -> &Geometry { &self.geometry }

    pub fn disks(&self) -> &[Disk] { &self.disks }

    pub fn disk(&self, index: usize) -> Option<&Disk> { self.disks.get(index) }

    pub fn cache(&self) -> &BlockCache { &self.cache }

    pub fn is_initialized(&self) -> bool { self.initialized }

    /// Identifier of the array, once initialized.
    pub fn array(&self) -> Option<u64> { self.array }

    /// Generation level of the array.
    pub fn level(&self) -> u64 { self.level }

    /// Disk holding data slot `slot` of the stripe.
    pub fn disk_for(&self, stripe: u64, slot: usize) -> &Disk {
        &self.disks[self.geometry.data_disk(stripe, slot)]
    }

    pub fn parity_disk_for(&self, stripe: u64) -> &Disk {
        &self.disks[self.geometry.parity_disk(stripe)]
    }

    pub fn disk_by_conn(&self, conn: ResourceId) -> Option<usize> {
        self.disks.iter().position(|disk| disk.conn == Some(conn))
    }

    pub fn snapshot(&self) -> Vec<DiskSnapshot> { self.disks.iter().map(Disk::snapshot).collect() }

    /// Disk table, one line per disk: `<index> <address> <status> <level> <dirty-blocks>`.
    pub fn display(&self) -> String {
        self.disks.iter().map(|disk| format!("{}\n", disk.snapshot())).collect()
    }

    pub fn take_effects(&mut self) -> Vec<Effect> { std::mem::take(&mut self.effects) }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Accounts a reactor iteration, failing backends which did not answer in time.
    pub fn tick(&mut self, now: Timestamp) {
        self.now = now;
        self.ticks += 1;

        let expired = self
            .disks
            .iter()
            .filter(|disk| {
                disk.in_flight
                    .as_ref()
                    .map(|in_flight| self.ticks.saturating_sub(in_flight.sent) >= self.rpc_timeout)
                    .unwrap_or_default()
            })
            .map(|disk| disk.index)
            .collect::<Vec<_>>();
        for index in expired {
            #[cfg(feature = "log")]
            log::warn!(target: "disk-manager", "Disk {index} did not answer within {} reactor iterations", self.rpc_timeout);
            self.set_offline(index, Link::Close);
        }
        self.run_ready();
    }

    /// Handles the LOGIN of a backend which has identified itself as the disk `index`.
    pub fn login(
        &mut self,
        conn: ResourceId,
        index: usize,
        login: &Login,
    ) -> Result<(), ServiceError> {
        if index >= self.disks.len() {
            return Err(invalid(format!("disk index {index} is out of the array of {}", self.disks.len())));
        }
        if login.block_size != self.geometry.block_size() {
            return Err(invalid(format!(
                "disk {index} uses blocks of {} bytes, while the array uses {}",
                login.block_size,
                self.geometry.block_size()
            )));
        }
        if login.blocks < self.geometry.stripes() {
            return Err(invalid(format!(
                "disk {index} holds {} blocks, while the array needs {}",
                login.blocks,
                self.geometry.stripes()
            )));
        }
        self.mark_online(index, conn)?;
        self.disks[index].address = login.address.clone();
        Ok(())
    }

    /// Attaches the connection to the disk and brings it back into the array. A disk which has
    /// missed writes or level updates is rebuilt first.
    pub fn mark_online(&mut self, index: usize, conn: ResourceId) -> Result<(), ServiceError> {
        let level = self.level;
        let initialized = self.initialized;
        let disk = self
            .disks
            .get_mut(index)
            .ok_or_else(|| invalid(format!("disk index {index} is out of the array")))?;
        if disk.conn.is_some() {
            return Err(invalid(format!("disk {index} is already logged in")));
        }
        disk.conn = Some(conn);
        disk.queue.clear();
        disk.in_flight = None;
        let stale = initialized && (!disk.dirty.is_empty() || disk.level < level);
        disk.status = if stale { DiskStatus::Rebuilding } else { DiskStatus::Online };

        #[cfg(feature = "log")]
        log::info!(target: "disk-manager", "Disk {index} is {} on connection {conn}", disk.status);

        self.resume_rebuilds();
        self.run_ready();
        Ok(())
    }

    /// Takes the disk out of the array and closes its connection. Idempotent.
    pub fn mark_offline(&mut self, index: usize) {
        if index < self.disks.len() {
            self.set_offline(index, Link::Close);
            self.run_ready();
        }
    }

    /// Reports that a backend connection was closed.
    pub fn on_disconnect(&mut self, conn: ResourceId) {
        if let Some(index) = self.disk_by_conn(conn) {
            self.set_offline(index, Link::Drop);
            self.run_ready();
        }
    }

    /// Routes a backend reply to the operation waiting for it.
    ///
    /// # Returns
    ///
    /// `false` if the connection does not belong to any disk.
    pub fn on_reply(&mut self, conn: ResourceId, response: Response) -> bool {
        let Some(index) = self.disk_by_conn(conn) else {
            return false;
        };
        let Some(InFlight { rpc, .. }) = self.disks[index].in_flight.take() else {
            #[cfg(feature = "log")]
            log::warn!(target: "disk-manager", "Disk {index} sent a response nobody asked for");
            self.set_offline(index, Link::Close);
            self.run_ready();
            return true;
        };

        let status = response.status;
        let mut result = response.into_result();
        let Rpc { op, request } = rpc;

        #[cfg(feature = "log")]
        log::trace!(target: "disk-manager", "Disk {index} answered {} {} with {status}", request.opcode, request.arg);

        let block_size = self.geometry.block_size();
        if let (Opcode::GetBlock, Ok(body)) = (request.opcode, &result) {
            if body.len() != block_size {
                result = Err(invalid(format!("disk {index} returned a block of {} bytes", body.len())));
            }
        }

        // Late replies of a disk taken out of the array must not populate the cache
        let cacheable = self.disks[index].status != DiskStatus::Offline;
        let key = BlockKey::new(index, request.arg);
        match (request.opcode, &result) {
            (Opcode::GetBlock, Ok(body)) if cacheable => self.cache.put(key, body.clone()),
            (Opcode::SetBlock, Ok(_)) if cacheable => self.cache.put(key, request.body),
            (Opcode::SetBlock, Err(_)) => {
                self.cache.invalidate(&key);
            }
            (Opcode::UpdateLevel, Ok(body)) => match <[u8; 8]>::try_from(body.as_slice()) {
                Ok(level) => self.disks[index].level = u64::from_be_bytes(level),
                Err(_) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "disk-manager", "Disk {index} answered UPDATE_LEVEL with a malformed level");
                }
            },
            _ => {}
        }

        if let Some(op) = op {
            self.deliver(op, index, result);
        }
        self.send_next(index);

        if status == Status::DiskRefused {
            #[cfg(feature = "log")]
            log::warn!(target: "disk-manager", "Disk {index} refused a request; taking it offline");
            self.set_offline(index, Link::Close);
        }
        self.run_ready();
        true
    }

    pub fn start_read(&mut self, client: ResourceId, block: u64) -> Result<(), ServiceError> {
        let loc = self.locate(block)?;
        #[cfg(feature = "log")]
        log::debug!(target: "disk-manager", "Reading {loc}");
        self.spawn(Some(client), Some(loc.stripe), Task::Read {
            loc,
            step: ReadStep::Start,
        });
        self.run_ready();
        Ok(())
    }

    /// Starts a write of a logical block. Data shorter than a block is zero-padded.
    pub fn start_write(
        &mut self,
        client: ResourceId,
        block: u64,
        mut data: Vec<u8>,
    ) -> Result<(), ServiceError> {
        let block_size = self.geometry.block_size();
        if data.len() > block_size {
            return Err(invalid(format!(
                "{} bytes do not fit into a block of {block_size} bytes",
                data.len()
            )));
        }
        let loc = self.locate(block)?;
        data.resize(block_size, 0);
        #[cfg(feature = "log")]
        log::debug!(target: "disk-manager", "Writing {loc}");
        self.spawn(Some(client), Some(loc.stripe), Task::Write {
            loc,
            data,
            step: WriteStep::Start,
        });
        self.run_ready();
        Ok(())
    }

    /// Starts volume initialization: `scratch` formats every disk and writes fresh disk info to
    /// it, otherwise the disk info already stored on the disks is validated and adopted.
    pub fn start_init(&mut self, client: ResourceId, scratch: bool) -> Result<(), ServiceError> {
        let array = self.now.into_millis().max(1);
        #[cfg(feature = "log")]
        log::info!(target: "disk-manager", "Initializing the array ({})", if scratch { "scratch" } else { "existing" });
        self.spawn(Some(client), None, Task::Init {
            scratch,
            array,
            awaiting: false,
        });
        self.run_ready();
        Ok(())
    }

    /// Rebuilds every block of the disk from the rest of the array.
    pub fn start_rebuild(&mut self, index: usize) -> Result<(), ServiceError> {
        self.check_index(index)?;
        if !self.initialized {
            return Err(invalid("array is not initialized"));
        }
        let disk = &self.disks[index];
        if disk.conn.is_none() {
            return Err(refused(format!("disk {index} is not connected")));
        }
        if disk.rebuild.is_some() {
            return Err(invalid(format!("disk {index} is already being rebuilt")));
        }
        if let Some(other) = self.unavailable().into_iter().find(|other| *other != index) {
            return Err(refused(format!("disk {other} is unavailable")));
        }

        let stripes = self.geometry.stripes();
        let disk = &mut self.disks[index];
        disk.dirty = (0..stripes).collect();
        disk.status = DiskStatus::Rebuilding;
        self.start_rebuild_task(index);
        self.run_ready();
        Ok(())
    }

    pub fn management(&mut self, index: usize, command: Management) -> Result<(), ServiceError> {
        self.check_index(index)?;
        match command {
            Management::Offline => {
                if self.disks[index].status == DiskStatus::Offline {
                    return Ok(());
                }
                if let Some(other) = self.unavailable().into_iter().find(|other| *other != index) {
                    return Err(refused(format!(
                        "disk {other} is already unavailable; taking disk {index} offline would lose data"
                    )));
                }
                self.set_offline(index, Link::Keep);
                self.run_ready();
                Ok(())
            }
            Management::Rebuild => self.start_rebuild(index),
        }
    }

    fn check_index(&self, index: usize) -> Result<(), ServiceError> {
        if index >= self.disks.len() {
            return Err(invalid(format!("disk index {index} is out of the array of {}", self.disks.len())));
        }
        Ok(())
    }

    fn locate(&self, block: u64) -> Result<Location, ServiceError> {
        if !self.initialized {
            return Err(invalid("array is not initialized"));
        }
        self.geometry.locate(block).ok_or_else(|| {
            invalid(format!("block {block} is beyond the array capacity of {}", self.geometry.capacity()))
        })
    }

    fn unavailable(&self) -> Vec<usize> {
        self.disks.iter().filter(|disk| !disk.is_available()).map(|disk| disk.index).collect()
    }

    fn is_available(&self, index: usize) -> bool { self.disks[index].is_available() }

    fn set_offline(&mut self, index: usize, link: Link) {
        let disk = &mut self.disks[index];
        let was_offline = disk.status == DiskStatus::Offline;
        disk.status = DiskStatus::Offline;

        let mut failed = disk.queue.drain(..).filter_map(|rpc| rpc.op).collect::<Vec<_>>();
        if let Some(op) = disk.in_flight.as_mut().and_then(|in_flight| in_flight.rpc.op.take()) {
            failed.push(op);
        }
        let closed = match link {
            // The reply to the request in flight still comes and must be consumed
            Link::Keep => None,
            Link::Drop => {
                disk.in_flight = None;
                disk.conn.take();
                None
            }
            Link::Close => {
                disk.in_flight = None;
                disk.conn.take()
            }
        };

        for op in failed {
            self.deliver(op, index, Err(refused(format!("disk {index} went offline"))));
        }
        self.cache.invalidate_disk(index);
        if let Some(conn) = closed {
            self.effects.push(Effect::Close(conn));
        }

        if was_offline {
            return;
        }
        #[cfg(feature = "log")]
        log::warn!(target: "disk-manager", "Disk {index} is offline");

        if self.initialized {
            // Survivors move to the next generation, so the lagging disk is recognized later
            self.level += 1;
            let survivors = self
                .disks
                .iter()
                .filter(|disk| disk.conn.is_some() && disk.status != DiskStatus::Offline)
                .map(|disk| disk.index)
                .collect::<Vec<_>>();
            for survivor in survivors {
                self.notify(survivor, Request::new(Opcode::UpdateLevel, 1));
            }
        }
    }

    fn resume_rebuilds(&mut self) {
        let waiting = self
            .disks
            .iter()
            .filter(|disk| {
                disk.status == DiskStatus::Rebuilding && disk.rebuild.is_none() && disk.conn.is_some()
            })
            .map(|disk| disk.index)
            .collect::<Vec<_>>();
        for index in waiting {
            self.start_rebuild_task(index);
        }
    }

    fn start_rebuild_task(&mut self, index: usize) {
        if self.disks[index].rebuild.is_some() {
            return;
        }
        #[cfg(feature = "log")]
        log::info!(target: "disk-manager", "Rebuilding disk {index} ({} dirty blocks)", self.disks[index].dirty.len());
        let id = self.spawn(None, None, Task::Rebuild {
            disk: index,
            step: RebuildStep::Next,
        });
        self.disks[index].rebuild = Some(id);
    }

    fn spawn(&mut self, client: Option<ResourceId>, stripe: Option<u64>, task: Task) -> OpId {
        self.last_op += 1;
        let id = self.last_op;
        self.ops.insert(id, Operation {
            client,
            stripe,
            task,
            pending: 0,
            replies: empty!(),
        });
        match stripe {
            Some(stripe) => self.acquire(id, stripe),
            None => self.ready.push_back(id),
        }
        id
    }

    fn acquire(&mut self, id: OpId, stripe: u64) {
        let queue = self.locks.entry(stripe).or_default();
        queue.push_back(id);
        if queue.len() == 1 {
            self.ready.push_back(id);
        }
    }

    fn release(&mut self, stripe: u64) {
        let Some(queue) = self.locks.get_mut(&stripe) else {
            return;
        };
        queue.pop_front();
        match queue.front() {
            Some(next) => self.ready.push_back(*next),
            None => {
                self.locks.remove(&stripe);
            }
        }
    }

    fn run_ready(&mut self) {
        while let Some(id) = self.ready.pop_front() {
            self.advance(id);
        }
    }

    fn deliver(&mut self, id: OpId, disk: usize, result: Result<Vec<u8>, ServiceError>) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.replies.insert(disk, result);
        op.pending = op.pending.saturating_sub(1);
        if op.pending == 0 {
            self.ready.push_back(id);
        }
    }

    fn send_next(&mut self, index: usize) {
        let disk = &mut self.disks[index];
        if disk.in_flight.is_some() {
            return;
        }
        let Some(conn) = disk.conn else {
            return;
        };
        let Some(rpc) = disk.queue.pop_front() else {
            return;
        };

        #[cfg(feature = "log")]
        log::debug!(target: "disk-manager", "Sending {} {} to disk {index}", rpc.request.opcode, rpc.request.arg);

        self.effects.push(Effect::Send(conn, rpc.request.encode()));
        disk.in_flight = Some(InFlight {
            rpc,
            sent: self.ticks,
        });
    }

    /// Issues an RPC whose reply is delivered to the operation.
    fn call(&mut self, id: OpId, op: &mut Operation, index: usize, request: Request) {
        let disk = &mut self.disks[index];
        if disk.conn.is_none() {
            op.replies.insert(index, Err(refused(format!("disk {index} is not connected"))));
            return;
        }
        disk.queue.push_back(Rpc {
            op: Some(id),
            request,
        });
        op.pending += 1;
        self.send_next(index);
    }

    /// Issues an RPC nobody waits for.
    fn notify(&mut self, index: usize, request: Request) {
        self.disks[index].queue.push_back(Rpc { op: None, request });
        self.send_next(index);
    }

    fn fetch(&mut self, id: OpId, op: &mut Operation, index: usize, block: u64) {
        if let Some(data) = self.cache.get(&BlockKey::new(index, block)) {
            op.replies.insert(index, Ok(data.to_vec()));
            return;
        }
        self.call(id, op, index, Request::new(Opcode::GetBlock, block));
    }

    /// Fetches the stripe block of every disk except `except`.
    fn fetch_others(&mut self, id: OpId, op: &mut Operation, except: usize, stripe: u64) {
        for index in 0..self.disks.len() {
            if index == except {
                continue;
            }
            if self.is_available(index) {
                self.fetch(id, op, index, stripe);
            } else {
                op.replies.insert(index, Err(refused(format!("disk {index} is unavailable"))));
            }
        }
    }

    fn store(&mut self, id: OpId, op: &mut Operation, index: usize, block: u64, data: Vec<u8>) {
        self.call(id, op, index, Request::with_body(Opcode::SetBlock, block, data));
    }

    /// Takes all the replies of the batch, except the one of the disk `except`.
    fn collect(op: &mut Operation, except: usize) -> Result<Vec<Vec<u8>>, ServiceError> {
        std::mem::take(&mut op.replies)
            .into_iter()
            .filter(|(index, _)| *index != except)
            .map(|(index, reply)| reply.map_err(|err| refused(format!("disk {index}: {err}"))))
            .collect()
    }

    fn mark_dirty(&mut self, index: usize, block: u64) {
        self.disks[index].dirty.insert(block);
        self.cache.invalidate(&BlockKey::new(index, block));
    }

    fn advance(&mut self, id: OpId) {
        let Some(mut op) = self.ops.remove(&id) else {
            return;
        };
        let flow = match op.task {
            Task::Read { loc, step } => self.advance_read(id, &mut op, loc, step),
            Task::Write { loc, step, .. } => self.advance_write(id, &mut op, loc, step),
            Task::Init {
                scratch,
                array,
                awaiting,
            } => self.advance_init(id, &mut op, scratch, array, awaiting),
            Task::Rebuild { disk, step } => self.advance_rebuild(id, &mut op, disk, step),
        };
        match flow {
            Flow::Wait => {
                if op.pending == 0 {
                    self.ready.push_back(id);
                }
                self.ops.insert(id, op);
            }
            Flow::Lock(stripe) => {
                op.stripe = Some(stripe);
                self.ops.insert(id, op);
                self.acquire(id, stripe);
            }
            Flow::Done(result) => self.finish(id, op, result),
        }
    }

    fn finish(&mut self, id: OpId, op: Operation, result: Result<Vec<u8>, ServiceError>) {
        if let Some(stripe) = op.stripe {
            self.release(stripe);
        }
        if let Task::Rebuild { disk, .. } = op.task {
            if self.disks[disk].rebuild == Some(id) {
                self.disks[disk].rebuild = None;
            }
            if let Err(err) = &result {
                #[cfg(feature = "log")]
                log::warn!(target: "disk-manager", "Rebuild of disk {disk} is aborted: {err}");
            }
        }
        if let Some(client) = op.client {
            self.completions.push(Completion { client, result });
        }
    }

    fn advance_read(&mut self, id: OpId, op: &mut Operation, loc: Location, step: ReadStep) -> Flow {
        match step {
            ReadStep::Start => {
                let unavailable = self.unavailable();
                if unavailable.len() >= 2 {
                    return Flow::Done(Err(refused(format!(
                        "{} disks are unavailable",
                        unavailable.len()
                    ))));
                }
                if self.is_available(loc.disk) {
                    self.fetch(id, op, loc.disk, loc.stripe);
                    op.set_read(ReadStep::Direct);
                } else {
                    self.fetch_others(id, op, loc.disk, loc.stripe);
                    op.set_read(ReadStep::Reconstruct);
                }
                Flow::Wait
            }
            ReadStep::Direct => match op.replies.remove(&loc.disk) {
                Some(Ok(data)) => Flow::Done(Ok(data)),
                _ => {
                    if let Some(other) = self.unavailable().into_iter().find(|other| *other != loc.disk) {
                        return Flow::Done(Err(refused(format!(
                            "reading disk {} failed while disk {other} is unavailable",
                            loc.disk
                        ))));
                    }
                    #[cfg(feature = "log")]
                    log::debug!(target: "disk-manager", "Direct read of {loc} failed; reconstructing");
                    self.fetch_others(id, op, loc.disk, loc.stripe);
                    op.set_read(ReadStep::Reconstruct);
                    Flow::Wait
                }
            },
            ReadStep::Reconstruct => {
                let blocks = match Self::collect(op, loc.disk) {
                    Ok(blocks) => blocks,
                    Err(err) => return Flow::Done(Err(err)),
                };
                let data = xor_all(blocks.iter().map(Vec::as_slice), self.geometry.block_size());
                Flow::Done(Ok(data))
            }
        }
    }

    fn advance_write(
        &mut self,
        id: OpId,
        op: &mut Operation,
        loc: Location,
        step: WriteStep,
    ) -> Flow {
        match step {
            WriteStep::Start => {
                let unavailable = self.unavailable();
                if unavailable.len() >= 2 {
                    return Flow::Done(Err(refused(format!(
                        "{} disks are unavailable",
                        unavailable.len()
                    ))));
                }
                if !self.is_available(loc.disk) {
                    match self.degraded_writes {
                        DegradedWrite::Refuse => {
                            return Flow::Done(Err(refused(format!(
                                "data disk {} is unavailable",
                                loc.disk
                            ))))
                        }
                        DegradedWrite::Reconstruct => {
                            for slot in 0..self.geometry.data_disks() {
                                let index = self.geometry.data_disk(loc.stripe, slot);
                                if index != loc.disk {
                                    self.fetch(id, op, index, loc.stripe);
                                }
                            }
                            op.set_write(WriteStep::Reconstruct);
                        }
                    }
                } else if !self.is_available(loc.parity) {
                    match self.parity_policy {
                        ParityPolicy::Abort => {
                            return Flow::Done(Err(refused(format!(
                                "parity disk {} is unavailable",
                                loc.parity
                            ))))
                        }
                        ParityPolicy::Defer => {
                            self.mark_dirty(loc.parity, loc.stripe);
                            let data = op.write_data();
                            self.store(id, op, loc.disk, loc.stripe, data);
                            op.set_write(WriteStep::Store {
                                data: true,
                                parity: false,
                            });
                        }
                    }
                } else {
                    self.fetch(id, op, loc.disk, loc.stripe);
                    self.fetch(id, op, loc.parity, loc.stripe);
                    op.set_write(WriteStep::Fetch);
                }
                Flow::Wait
            }
            WriteStep::Fetch => {
                let old_data = op.replies.remove(&loc.disk);
                let old_parity = op.replies.remove(&loc.parity);
                let (Some(Ok(old_data)), Some(Ok(mut parity))) = (old_data, old_parity) else {
                    return Flow::Done(Err(refused(format!(
                        "unable to read stripe {} for the parity update",
                        loc.stripe
                    ))));
                };
                let data = op.write_data();
                xor_into(&mut parity, &old_data);
                xor_into(&mut parity, &data);
                self.store(id, op, loc.disk, loc.stripe, data);
                self.store(id, op, loc.parity, loc.stripe, parity);
                op.set_write(WriteStep::Store {
                    data: true,
                    parity: true,
                });
                Flow::Wait
            }
            WriteStep::Reconstruct => {
                let others = match Self::collect(op, loc.disk) {
                    Ok(others) => others,
                    Err(err) => return Flow::Done(Err(err)),
                };
                let data = op.write_data();
                let mut parity =
                    xor_all(others.iter().map(Vec::as_slice), self.geometry.block_size());
                xor_into(&mut parity, &data);
                self.mark_dirty(loc.disk, loc.stripe);
                self.store(id, op, loc.parity, loc.stripe, parity);
                op.set_write(WriteStep::Store {
                    data: false,
                    parity: true,
                });
                Flow::Wait
            }
            WriteStep::Store { data, parity } => {
                let data_failed = data && !matches!(op.replies.remove(&loc.disk), Some(Ok(_)));
                let parity_failed =
                    parity && !matches!(op.replies.remove(&loc.parity), Some(Ok(_)));
                if data_failed {
                    self.mark_dirty(loc.disk, loc.stripe);
                }
                if parity_failed {
                    self.mark_dirty(loc.parity, loc.stripe);
                }

                if data_failed {
                    return Flow::Done(Err(refused(format!(
                        "writing block {} to disk {} failed",
                        loc.block, loc.disk
                    ))));
                }
                if parity_failed {
                    // Without the data write, the parity block was the only copy of the new data
                    if !data || self.parity_policy == ParityPolicy::Abort {
                        return Flow::Done(Err(refused(format!(
                            "writing parity of stripe {} to disk {} failed",
                            loc.stripe, loc.parity
                        ))));
                    }
                    #[cfg(feature = "log")]
                    log::warn!(target: "disk-manager", "Parity of stripe {} is deferred to a rebuild of disk {}", loc.stripe, loc.parity);
                }
                Flow::Done(Ok(vec![]))
            }
        }
    }

    fn advance_init(
        &mut self,
        id: OpId,
        op: &mut Operation,
        scratch: bool,
        array: u64,
        awaiting: bool,
    ) -> Flow {
        if !awaiting {
            if let Task::Init { awaiting, .. } = &mut op.task {
                *awaiting = true;
            }
            for index in 0..self.disks.len() {
                if scratch {
                    if self.disks[index].conn.is_none() {
                        return Flow::Done(Err(refused(format!(
                            "disk {index} is not connected; scratch initialization needs every disk"
                        ))));
                    }
                } else if self.disks[index].conn.is_none() {
                    op.replies.insert(index, Err(refused(format!("disk {index} is not connected"))));
                }
            }
            for index in 0..self.disks.len() {
                if scratch {
                    let info = DiskInfo {
                        array,
                        index,
                        level: 0,
                        disks: self.geometry.disks(),
                        block_size: self.geometry.block_size(),
                        blocks: self.geometry.stripes(),
                    };
                    let request =
                        Request::with_body(Opcode::SetDiskInfo, FORMAT_DISK, info.to_form().encode());
                    self.call(id, op, index, request);
                } else if self.disks[index].conn.is_some() {
                    self.call(id, op, index, Request::new(Opcode::GetDiskInfo, 0));
                }
            }
            return Flow::Wait;
        }

        let replies = std::mem::take(&mut op.replies);
        if scratch {
            if let Some((index, Err(err))) = replies.iter().find(|(_, reply)| reply.is_err()) {
                return Flow::Done(Err(refused(format!("disk {index} refused the disk info: {err}"))));
            }
            self.initialized = true;
            self.array = Some(array);
            self.level = 0;
            for disk in &mut self.disks {
                disk.level = 0;
                disk.dirty.clear();
                if disk.conn.is_some() {
                    disk.status = DiskStatus::Online;
                }
            }
            self.cache.clear();
            #[cfg(feature = "log")]
            log::info!(target: "disk-manager", "Array {array} is initialized from scratch");
            return Flow::Done(Ok(vec![]));
        }

        let mut infos = BTreeMap::new();
        for (index, reply) in replies {
            let Ok(body) = reply else {
                continue;
            };
            match Form::decode(&body).and_then(|form| DiskInfo::from_form(&form)) {
                Ok(info) => {
                    infos.insert(index, info);
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "disk-manager", "Disk {index} holds no valid disk info: {err}");
                }
            }
        }
        self.adopt(infos)
    }

    /// Adopts the disk info read from the disks by an existing-mode initialization.
    fn adopt(&mut self, infos: BTreeMap<usize, DiskInfo>) -> Flow {
        let arrays = infos.values().map(|info| info.array).collect::<BTreeSet<_>>();
        if arrays.len() > 1 {
            return Flow::Done(Err(invalid("disks belong to different arrays")));
        }
        let Some(array) = arrays.first().copied() else {
            return Flow::Done(Err(refused("no disk holds array information")));
        };
        for (index, info) in &infos {
            if info.index != *index
                || info.disks != self.geometry.disks()
                || info.block_size != self.geometry.block_size()
            {
                return Flow::Done(Err(invalid(format!(
                    "disk {index} info does not match the array layout"
                ))));
            }
        }

        let top = infos.values().map(|info| info.level).max().unwrap_or_default();
        let stale = (0..self.disks.len())
            .filter(|index| infos.get(index).map(|info| info.level < top).unwrap_or(true))
            .collect::<Vec<_>>();
        if stale.len() >= 2 {
            return Flow::Done(Err(refused(format!("{} disks are stale or offline", stale.len()))));
        }

        self.initialized = true;
        self.array = Some(array);
        self.level = top;
        for (index, info) in infos {
            self.disks[index].level = info.level;
        }
        let stripes = self.geometry.stripes();
        for index in stale {
            let disk = &mut self.disks[index];
            disk.dirty = (0..stripes).collect();
            if disk.conn.is_some() {
                disk.status = DiskStatus::Rebuilding;
                self.cache.invalidate_disk(index);
                self.start_rebuild_task(index);
            } else {
                disk.status = DiskStatus::Offline;
            }
        }
        #[cfg(feature = "log")]
        log::info!(target: "disk-manager", "Array {array} is initialized at level {top}");
        Flow::Done(Ok(vec![]))
    }

    fn advance_rebuild(
        &mut self,
        id: OpId,
        op: &mut Operation,
        target: usize,
        step: RebuildStep,
    ) -> Flow {
        match step {
            RebuildStep::Next => {
                let disk = &self.disks[target];
                if disk.conn.is_none() || disk.status == DiskStatus::Offline {
                    return Flow::Done(Err(refused(format!("disk {target} left the array"))));
                }
                if let Some(stripe) = disk.dirty.first().copied() {
                    op.set_rebuild(RebuildStep::Locked(stripe));
                    return Flow::Lock(stripe);
                }
                let lag = self.level.saturating_sub(disk.level);
                if lag > 0 {
                    self.call(id, op, target, Request::new(Opcode::UpdateLevel, lag));
                    op.set_rebuild(RebuildStep::Level);
                    return Flow::Wait;
                }
                self.complete_rebuild(target);
                Flow::Done(Ok(vec![]))
            }
            RebuildStep::Locked(stripe) => {
                if let Some(other) = self.unavailable().into_iter().find(|other| *other != target) {
                    return Flow::Done(Err(refused(format!("disk {other} is unavailable"))));
                }
                self.fetch_others(id, op, target, stripe);
                op.set_rebuild(RebuildStep::Fetch(stripe));
                Flow::Wait
            }
            RebuildStep::Fetch(stripe) => {
                let blocks = match Self::collect(op, target) {
                    Ok(blocks) => blocks,
                    Err(err) => return Flow::Done(Err(err)),
                };
                let data = xor_all(blocks.iter().map(Vec::as_slice), self.geometry.block_size());
                self.store(id, op, target, stripe, data);
                op.set_rebuild(RebuildStep::Store(stripe));
                Flow::Wait
            }
            RebuildStep::Store(stripe) => match op.replies.remove(&target) {
                Some(Ok(_)) => {
                    self.disks[target].dirty.remove(&stripe);
                    if let Some(locked) = op.stripe.take() {
                        self.release(locked);
                    }
                    op.set_rebuild(RebuildStep::Next);
                    Flow::Wait
                }
                _ => Flow::Done(Err(refused(format!(
                    "writing stripe {stripe} to disk {target} failed"
                )))),
            },
            RebuildStep::Level => match op.replies.remove(&target) {
                Some(Ok(_)) => {
                    self.complete_rebuild(target);
                    Flow::Done(Ok(vec![]))
                }
                _ => Flow::Done(Err(refused(format!("disk {target} refused the level update")))),
            },
        }
    }

    fn complete_rebuild(&mut self, index: usize) {
        let disk = &mut self.disks[index];
        disk.status = DiskStatus::Online;
        #[cfg(feature = "log")]
        log::info!(target: "disk-manager", "Disk {index} is rebuilt and back online at level {}", disk.level);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::config::ArrayConfig;
    use crate::service::{backend, Reply, Services};
    use crate::state_machine::{Expect, Inbound, StateMachine};
    use crate::store::DiskStore;

    const BS: usize = 16;
    const BLOCKS: u64 = 8;

    type Store = DiskStore<Cursor<Vec<u8>>>;

    fn client() -> ResourceId { ResourceId::from(1000) }

    fn conn(disk: usize) -> ResourceId { ResourceId::from(100 + disk as u64) }

    fn config(data_disks: usize) -> FrontendConfig {
        let array = ArrayConfig {
            data_disks,
            block_size: BS,
            blocks_per_disk: BLOCKS,
            backends: (0..=data_disks).map(|i| format!("disk-{i}")).collect(),
        };
        let mut config = FrontendConfig::new("127.0.0.1:0".parse().unwrap(), array);
        config.cache_capacity = 16;
        config.rpc_timeout_ticks = 4;
        config
    }

    /// Frontend manager wired to in-memory backends answering synchronously.
    struct Array {
        manager: DiskManager,
        stores: Vec<Store>,
        services: Services<Store>,
        silent: BTreeSet<usize>,
        /// Disks swallowing SET_BLOCK requests while still answering everything else.
        silent_writes: BTreeSet<usize>,
        closed: Vec<ResourceId>,
    }

    impl Array {
        fn uninitialized(config: FrontendConfig) -> Self {
            let stores = (0..=config.array.data_disks).map(|_| DiskStore::in_memory(BS, BLOCKS)).collect();
            Array::with_stores(config, stores)
        }

        fn with_stores(config: FrontendConfig, stores: Vec<Store>) -> Self {
            let mut array = Array {
                manager: DiskManager::new(&config),
                stores,
                services: backend::services(),
                silent: empty!(),
                silent_writes: empty!(),
                closed: vec![],
            };
            for disk in 0..array.stores.len() {
                array.login(disk).unwrap();
            }
            array.pump();
            array
        }

        fn new(config: FrontendConfig) -> Self {
            let mut array = Array::uninitialized(config);
            array.manager.start_init(client(), true).unwrap();
            array.complete().unwrap();
            array
        }

        fn login(&mut self, disk: usize) -> Result<(), ServiceError> {
            let login = Login {
                address: format!("disk-{disk}"),
                blocks: BLOCKS,
                block_size: BS,
            };
            self.manager.login(conn(disk), disk, &login)
        }

        fn pump(&mut self) -> Vec<Completion> {
            loop {
                let effects = self.manager.take_effects();
                if effects.is_empty() {
                    break;
                }
                for effect in effects {
                    match effect {
                        Effect::Send(to, bytes) => {
                            let disk = (0..self.stores.len()).find(|disk| conn(*disk) == to).unwrap();
                            if self.silent.contains(&disk) {
                                continue;
                            }
                            let mut machine = StateMachine::new(Expect::Requests);
                            let Inbound::Request(request) = machine.feed(&bytes).remove(0) else {
                                panic!("not a request");
                            };
                            if request.opcode == Opcode::SetBlock && self.silent_writes.contains(&disk) {
                                continue;
                            }
                            let Reply::Respond(response) =
                                self.services.dispatch(&mut self.stores[disk], to, &request)
                            else {
                                panic!("backend must respond");
                            };
                            self.manager.on_reply(to, response);
                        }
                        Effect::Close(to) => self.closed.push(to),
                    }
                }
            }
            self.manager.take_completions()
        }

        fn complete(&mut self) -> Result<Vec<u8>, ServiceError> {
            let mut completions = self.pump();
            assert_eq!(completions.len(), 1);
            let completion = completions.remove(0);
            assert_eq!(completion.client, client());
            completion.result
        }

        fn read(&mut self, block: u64) -> Result<Vec<u8>, ServiceError> {
            self.manager.start_read(client(), block)?;
            self.complete()
        }

        fn write(&mut self, block: u64, data: &[u8]) -> Result<(), ServiceError> {
            self.manager.start_write(client(), block, data.to_vec())?;
            self.complete().map(|_| ())
        }

        fn fail(&mut self, disk: usize) {
            self.manager.on_disconnect(conn(disk));
            self.pump();
        }

        fn status(&self, disk: usize) -> DiskStatus { self.manager.disk(disk).unwrap().status() }

        fn assert_parity(&mut self) {
            for stripe in 0..BLOCKS {
                let blocks = self
                    .stores
                    .iter_mut()
                    .map(|store| store.read_block(stripe).unwrap())
                    .collect::<Vec<_>>();
                let sum = xor_all(blocks.iter().map(Vec::as_slice), BS);
                assert!(sum.iter().all(|byte| *byte == 0), "parity of stripe {stripe} is broken");
            }
        }
    }

    fn pattern(block: u64, round: u8) -> Vec<u8> {
        (0..BS).map(|i| (block as u8).wrapping_mul(31) ^ (i as u8) ^ round).collect()
    }

    #[test]
    fn parity_holds_after_writes() {
        let mut array = Array::new(config(3));
        let capacity = array.manager.geometry().capacity();
        for block in 0..capacity {
            array.write(block, &pattern(block, 1)).unwrap();
        }
        for block in (0..capacity).step_by(3) {
            array.write(block, &pattern(block, 2)).unwrap();
        }
        array.assert_parity();
        for block in 0..capacity {
            let round = if block % 3 == 0 { 2 } else { 1 };
            assert_eq!(array.read(block).unwrap(), pattern(block, round));
        }
    }

    #[test]
    fn short_writes_are_padded() {
        let mut array = Array::new(config(2));
        array.write(1, b"abc").unwrap();
        let mut expected = b"abc".to_vec();
        expected.resize(BS, 0);
        assert_eq!(array.read(1).unwrap(), expected);
        assert!(matches!(
            array.write(1, &[0u8; BS + 1]),
            Err(ServiceError::InvalidArguments(_))
        ));
    }

    #[test]
    fn degraded_read_reconstructs_block_5() {
        let mut array = Array::new(config(3));
        array.write(5, &[0xAA; BS]).unwrap();

        let loc = array.manager.geometry().locate(5).unwrap();
        array.fail(loc.disk);
        assert_eq!(array.status(loc.disk), DiskStatus::Offline);
        assert!(!array.manager.cache().contains(&BlockKey::new(loc.disk, loc.stripe)));

        assert_eq!(array.read(5).unwrap(), vec![0xAA; BS]);
    }

    #[test]
    fn reconstruction_matches_online_reads() {
        let mut array = Array::new(config(3));
        let capacity = array.manager.geometry().capacity();
        for block in 0..capacity {
            array.write(block, &pattern(block, 7)).unwrap();
        }
        array.fail(2);
        for block in 0..capacity {
            assert_eq!(array.read(block).unwrap(), pattern(block, 7), "block {block}");
        }
    }

    #[test]
    fn two_failures_refuse() {
        let mut array = Array::new(config(3));
        array.write(0, &[1; BS]).unwrap();
        array.fail(0);
        array.fail(3);
        assert!(matches!(array.read(0), Err(ServiceError::DiskRefused(_))));
        assert!(matches!(array.read(4), Err(ServiceError::DiskRefused(_))));
        assert!(matches!(array.write(4, &[2; BS]), Err(ServiceError::DiskRefused(_))));
    }

    #[test]
    fn write_refused_without_data_and_parity_disks() {
        let mut array = Array::new(config(3));
        array.write(5, &[0x11; BS]).unwrap();
        array.read(4).unwrap();

        let loc = array.manager.geometry().locate(5).unwrap();
        array.fail(loc.disk);
        array.fail(loc.parity);

        let cache = array.manager.cache();
        let before = cache
            .keys()
            .into_iter()
            .map(|key| (key, cache.peek(&key).map(<[u8]>::to_vec)))
            .collect::<Vec<_>>();

        assert!(matches!(array.write(5, &[0x22; BS]), Err(ServiceError::DiskRefused(_))));

        let cache = array.manager.cache();
        let after = cache
            .keys()
            .into_iter()
            .map(|key| (key, cache.peek(&key).map(<[u8]>::to_vec)))
            .collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn duplicate_login_rejected() {
        let mut array = Array::new(config(3));
        let before = array.manager.snapshot();
        let login = Login {
            address: s!("elsewhere"),
            blocks: BLOCKS,
            block_size: BS,
        };
        let err = array.manager.login(ResourceId::from(999), 1, &login).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArguments(_)));
        assert_eq!(array.manager.snapshot(), before);
        assert_eq!(array.manager.disk(1).unwrap().connection(), Some(conn(1)));
    }

    #[test]
    fn login_validation() {
        let mut array = Array::new(config(2));
        array.fail(0);
        let login = Login {
            address: s!("disk-0"),
            blocks: BLOCKS,
            block_size: BS * 2,
        };
        assert!(matches!(
            array.manager.login(conn(0), 0, &login),
            Err(ServiceError::InvalidArguments(_))
        ));
        assert!(matches!(
            array.manager.login(conn(7), 7, &login),
            Err(ServiceError::InvalidArguments(_))
        ));
        assert_eq!(array.status(0), DiskStatus::Offline);
    }

    #[test]
    fn parity_write_deferred() {
        let mut array = Array::new(config(3));
        let loc = array.manager.geometry().locate(5).unwrap();
        array.fail(loc.parity);

        array.write(5, &[0x33; BS]).unwrap();
        assert!(array.manager.disk(loc.parity).unwrap().dirty().contains(&loc.stripe));
        assert_eq!(array.read(5).unwrap(), vec![0x33; BS]);

        // The parity disk returns and gets its deferred block rebuilt
        array.login(loc.parity).unwrap();
        array.pump();
        assert_eq!(array.status(loc.parity), DiskStatus::Online);
        assert!(array.manager.disk(loc.parity).unwrap().dirty().is_empty());
        array.assert_parity();
    }

    #[test]
    fn parity_write_aborted() {
        let mut config = config(3);
        config.parity_policy = ParityPolicy::Abort;
        let mut array = Array::new(config);
        let loc = array.manager.geometry().locate(5).unwrap();
        array.fail(loc.parity);
        assert!(matches!(array.write(5, &[0x33; BS]), Err(ServiceError::DiskRefused(_))));
        assert!(array.manager.disk(loc.parity).unwrap().dirty().is_empty());
    }

    /// Writes block 5 while its parity disk drops the SET_BLOCK request, so the parity write
    /// fails only after the data block has been stored.
    fn write_losing_parity(policy: ParityPolicy) -> (Array, Location, Result<Vec<u8>, ServiceError>) {
        let mut config = config(3);
        config.parity_policy = policy;
        let mut array = Array::new(config);
        let loc = array.manager.geometry().locate(5).unwrap();
        array.silent_writes.insert(loc.parity);

        array.manager.start_write(client(), 5, vec![0x77; BS]).unwrap();
        assert!(array.pump().is_empty());
        for _ in 0..4 {
            array.manager.tick(Timestamp::now());
        }
        let mut completions = array.pump();
        assert_eq!(completions.len(), 1);
        let result = completions.remove(0).result;

        assert_eq!(array.stores[loc.disk].read_block(loc.stripe).unwrap(), vec![0x77; BS]);
        assert_eq!(array.status(loc.parity), DiskStatus::Offline);
        assert!(array.manager.disk(loc.parity).unwrap().dirty().contains(&loc.stripe));
        assert!(!array.manager.cache().contains(&BlockKey::new(loc.parity, loc.stripe)));
        (array, loc, result)
    }

    #[test]
    fn parity_write_lost_midway_is_deferred() {
        let (mut array, loc, result) = write_losing_parity(ParityPolicy::Defer);
        assert_eq!(result, Ok(vec![]));
        assert_eq!(array.read(5).unwrap(), vec![0x77; BS]);

        // The timed out disk was closed; it comes back and gets the parity rebuilt
        array.silent_writes.clear();
        array.login(loc.parity).unwrap();
        array.pump();
        assert_eq!(array.status(loc.parity), DiskStatus::Online);
        array.assert_parity();
    }

    #[test]
    fn parity_write_lost_midway_is_refused() {
        let (_, _, result) = write_losing_parity(ParityPolicy::Abort);
        assert!(matches!(result, Err(ServiceError::DiskRefused(_))));
    }

    #[test]
    fn degraded_write_refused_by_default() {
        let mut array = Array::new(config(3));
        let loc = array.manager.geometry().locate(5).unwrap();
        array.fail(loc.disk);
        assert!(matches!(array.write(5, &[0x44; BS]), Err(ServiceError::DiskRefused(_))));
    }

    #[test]
    fn degraded_write_reconstructs_and_rebuilds() {
        let mut config = config(3);
        config.degraded_writes = DegradedWrite::Reconstruct;
        let mut array = Array::new(config);
        array.write(5, &[0x01; BS]).unwrap();
        array.write(4, &[0x02; BS]).unwrap();

        let loc = array.manager.geometry().locate(5).unwrap();
        array.fail(loc.disk);
        array.write(5, &[0x55; BS]).unwrap();
        assert_eq!(array.read(5).unwrap(), vec![0x55; BS]);
        assert_eq!(array.read(4).unwrap(), vec![0x02; BS]);
        assert!(array.manager.disk(loc.disk).unwrap().dirty().contains(&loc.stripe));

        array.login(loc.disk).unwrap();
        assert_eq!(array.status(loc.disk), DiskStatus::Rebuilding);
        array.pump();
        assert_eq!(array.status(loc.disk), DiskStatus::Online);
        assert_eq!(array.stores[loc.disk].read_block(loc.stripe).unwrap(), vec![0x55; BS]);
        assert_eq!(
            array.manager.disk(loc.disk).unwrap().level(),
            array.manager.level(),
            "rebuilt disk catches up with the array generation"
        );
        array.assert_parity();
    }

    #[test]
    fn unanswered_rpc_times_out() {
        let mut array = Array::new(config(3));
        array.write(5, &[0x66; BS]).unwrap();
        let loc = array.manager.geometry().locate(5).unwrap();

        // Keep the block out of the cache, so the read has to ask the silent disk
        array.manager.cache.invalidate(&BlockKey::new(loc.disk, loc.stripe));
        array.silent.insert(loc.disk);
        array.manager.start_read(client(), 5).unwrap();
        assert!(array.pump().is_empty());

        for _ in 0..4 {
            array.manager.tick(Timestamp::now());
        }
        let completions = array.pump();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Ok(vec![0x66; BS]));
        assert_eq!(array.status(loc.disk), DiskStatus::Offline);
        assert_eq!(array.closed, vec![conn(loc.disk)]);
    }

    #[test]
    fn stripe_operations_are_serialized() {
        let mut array = Array::new(config(3));
        // Blocks 3, 4 and 5 share stripe 1
        array.manager.start_write(client(), 3, vec![0x0F; BS]).unwrap();
        array.manager.start_write(client(), 4, vec![0xF0; BS]).unwrap();
        array.manager.start_write(client(), 5, vec![0x3C; BS]).unwrap();
        let completions = array.pump();
        assert_eq!(completions.len(), 3);
        assert!(completions.iter().all(|completion| completion.result.is_ok()));
        array.assert_parity();
        assert_eq!(array.read(4).unwrap(), vec![0xF0; BS]);
    }

    #[test]
    fn cache_serves_latest_write() {
        let mut array = Array::new(config(2));
        array.write(3, &[1; BS]).unwrap();
        assert_eq!(array.read(3).unwrap(), vec![1; BS]);
        array.write(3, &[2; BS]).unwrap();

        let loc = array.manager.geometry().locate(3).unwrap();
        assert_eq!(array.manager.cache().peek(&BlockKey::new(loc.disk, loc.stripe)), Some(&[2u8; BS][..]));
        assert_eq!(array.read(3).unwrap(), vec![2; BS]);
    }

    #[test]
    fn requests_before_init_rejected() {
        let mut array = Array::uninitialized(config(3));
        assert!(matches!(
            array.manager.start_read(client(), 0),
            Err(ServiceError::InvalidArguments(_))
        ));
        array.manager.start_init(client(), true).unwrap();
        array.complete().unwrap();
        assert!(matches!(
            array.manager.start_read(client(), 24),
            Err(ServiceError::InvalidArguments(_))
        ));
    }

    #[test]
    fn scratch_init_requires_all_disks() {
        let mut array = Array::uninitialized(config(3));
        array.fail(2);
        array.manager.start_init(client(), true).unwrap();
        assert!(matches!(array.complete(), Err(ServiceError::DiskRefused(_))));
        assert!(!array.manager.is_initialized());
    }

    #[test]
    fn scratch_init_wipes_reused_disks() {
        let mut first = Array::new(config(3));
        first.fail(2);
        let capacity = first.manager.geometry().capacity();
        for block in 0..capacity {
            let _ = first.write(block, &pattern(block, 4));
        }

        // Disk 2 missed the writes above, so its stripes disagree with their parity
        let stores = std::mem::take(&mut first.stores);
        let mut second = Array::with_stores(config(3), stores);
        second.manager.start_init(client(), true).unwrap();
        second.complete().unwrap();
        second.assert_parity();

        second.write(6, &[0x5A; BS]).unwrap();
        let disk = second.manager.geometry().locate(6).unwrap().disk;
        second.fail(disk);
        assert_eq!(second.read(6).unwrap(), vec![0x5A; BS]);
    }

    #[test]
    fn existing_init_rebuilds_stale_disk() {
        let mut first = Array::new(config(3));
        first.fail(2);
        let capacity = first.manager.geometry().capacity();
        let mut written = BTreeMap::new();
        for block in 0..capacity {
            if first.write(block, &pattern(block, 9)).is_ok() {
                written.insert(block, pattern(block, 9));
            }
        }
        assert!(!written.is_empty());

        // A restarted frontend over the same disks
        let stores = std::mem::take(&mut first.stores);
        let mut second = Array::with_stores(config(3), stores);
        second.manager.start_init(client(), false).unwrap();
        second.complete().unwrap();
        assert_eq!(second.manager.level(), 1);
        second.pump();

        assert_eq!(second.status(2), DiskStatus::Online);
        assert_eq!(second.manager.disk(2).unwrap().level(), 1);
        second.assert_parity();
        for (block, data) in written {
            assert_eq!(second.read(block).unwrap(), data);
        }
    }

    #[test]
    fn existing_init_refuses_two_stale_disks() {
        let mut first = Array::new(config(3));
        first.fail(1);
        first.fail(2);
        let stores = std::mem::take(&mut first.stores);
        let mut second = Array::with_stores(config(3), stores);
        second.manager.start_init(client(), false).unwrap();
        assert!(matches!(second.complete(), Err(ServiceError::DiskRefused(_))));
    }

    #[test]
    fn management_offline_and_rebuild() {
        let mut array = Array::new(config(3));
        array.write(2, &[9; BS]).unwrap();

        array.manager.management(1, Management::Offline).unwrap();
        array.pump();
        assert_eq!(array.status(1), DiskStatus::Offline);
        assert!(array.closed.is_empty(), "administrative offline keeps the connection");
        assert_eq!(array.read(2).unwrap(), vec![9; BS]);
        assert!(matches!(
            array.manager.management(2, Management::Offline),
            Err(ServiceError::DiskRefused(_))
        ));

        array.manager.management(1, Management::Rebuild).unwrap();
        array.pump();
        assert_eq!(array.status(1), DiskStatus::Online);
        array.assert_parity();
        assert_eq!(array.read(2).unwrap(), vec![9; BS]);
    }

    #[test]
    fn display_table() {
        let mut array = Array::new(config(2));
        array.fail(1);
        let table = array.manager.display();
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines, vec!["0 disk-0 online 1 0", "1 disk-1 offline 0 0", "2 disk-2 online 1 0"]);
    }
}
