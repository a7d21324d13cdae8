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

use std::thread::JoinHandle;
use std::time::Duration;
use std::{io, thread};

use crate::poller::{Poll, Waker};
use crate::runtimes::{Controller, Handler, Runtime};

/// High-level reactor API wrapping reactor [`Runtime`] into a thread and providing basic thread
/// management for it.
///
/// Apps running the [`Reactor`] can interface it and a [`Handler`] via use of the [`Controller`]
/// API.
pub struct Reactor<H: Handler, P: Poll> {
    thread: JoinHandle<()>,
    controller: Controller<H::Command, <P::Waker as Waker>::Send>,
}

impl<H: Handler + 'static, P: Poll + 'static> Reactor<H, P> {
    /// Creates new reactor using provided [`Poll`] engine and a service exposing [`Handler`] API to
    /// the reactor. The poll call never blocks for longer than `wait`.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to spawn a thread.
    pub fn new(service: H, poller: P, wait: Duration) -> Result<Self, io::Error> {
        Reactor::with(service, poller, wait, thread::Builder::new())
    }

    /// Similar to the [`Reactor::new`], but allows to specify the name for the reactor thread.
    pub fn named(
        service: H,
        poller: P,
        wait: Duration,
        thread_name: String,
    ) -> Result<Self, io::Error> {
        Reactor::with(service, poller, wait, thread::Builder::new().name(thread_name))
    }

    /// Similar to the [`Reactor::new`], but allows to fully customize how the reactor thread is
    /// constructed.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the waker or to spawn a thread.
    pub fn with(
        service: H,
        mut poller: P,
        wait: Duration,
        builder: thread::Builder,
    ) -> Result<Self, io::Error> {
        let (ctl_send, ctl_recv) = crossbeam_channel::unbounded();

        let (waker_writer, waker_reader) = P::Waker::pair()?;
        poller.register_waker(&waker_reader)?;

        let controller = Controller::new(ctl_send, waker_writer);

        #[cfg(feature = "log")]
        log::debug!(target: "reactor-controller", "Initializing reactor thread...");

        let thread = builder.spawn(move || {
            let runtime = Runtime::new(service, poller, ctl_recv, waker_reader, wait);

            #[cfg(feature = "log")]
            log::info!(target: "reactor", "Entering reactor event loop");

            runtime.run();
        })?;

        Ok(Self { thread, controller })
    }

    /// Provides a copy of a [`Controller`] object which exposes an API to the reactor and a service
    /// running inside its thread.
    pub fn controller(&self) -> Controller<H::Command, <P::Waker as Waker>::Send> {
        self.controller.clone()
    }

    /// Joins the reactor thread.
    pub fn join(self) -> thread::Result<()> { self.thread.join() }
}
