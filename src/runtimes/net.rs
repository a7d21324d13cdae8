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

//! Networking reactor runtime.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crossbeam_channel as chan;

use crate::poller::{IoType, Poll, Waker, WakerRecv};
use crate::resource::WriteError;
use crate::runtimes::{Action, Ctl, Error, Handler};
use crate::{Resource, ResourceId, ResourceType, Timer, Timestamp, WriteAtomic};

/// Reactor runtime which is run in a dedicated thread by [`crate::Reactor`].
///
/// Use this structure directly only if you'd like to have the full control over the reactor
/// thread: the runtime **does not** spawn a thread and [`Runtime::run`] is **blocking**.
pub struct Runtime<H: Handler, P: Poll> {
    service: H,
    poller: P,
    ctl_recv: chan::Receiver<Ctl<H::Command>>,
    listeners: HashMap<ResourceId, H::Listener>,
    transports: HashMap<ResourceId, H::Transport>,
    waker: <P::Waker as Waker>::Recv,
    timeouts: Timer,
    last_id: ResourceId,
    wait: Duration,
}

impl<H: Handler, P: Poll> Runtime<H, P> {
    /// Constructs the runtime. The waker receiving end must be already registered with the
    /// `poller`. No single poll call blocks for longer than `wait`.
    pub fn new(
        service: H,
        poller: P,
        ctl_recv: chan::Receiver<Ctl<H::Command>>,
        waker: <P::Waker as Waker>::Recv,
        wait: Duration,
    ) -> Self {
        Runtime {
            service,
            poller,
            ctl_recv,
            listeners: empty!(),
            transports: empty!(),
            waker,
            timeouts: Timer::new(),
            last_id: ResourceId::WAKER,
            wait,
        }
    }

    /// Executes the reactor event loop until a shutdown command or [`Action::Terminate`].
    pub fn run(mut self) {
        // Actions provided by the handler on construction
        if !self.handle_actions(Timestamp::now()) {
            return self.handle_shutdown();
        }

        loop {
            let before_poll = Timestamp::now();
            let timeout = self
                .timeouts
                .next_expiring_from(before_poll)
                .map(|next| next.min(self.wait))
                .unwrap_or(self.wait);

            for (id, res) in &self.listeners {
                self.poller.set_interest(*id, res.interests());
            }
            for (id, res) in &self.transports {
                self.poller.set_interest(*id, res.interests());
            }

            // Blocking
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Polling with timeout {timeout:?}");

            let res = self.poller.poll(Some(timeout));
            let now = Timestamp::now();
            self.service.tick(now);

            // Which of the timers has fired is not tracked: the handler is woken once per batch
            let timers_fired = self.timeouts.remove_expired_by(now);
            if timers_fired > 0 {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Timer has fired");
                self.service.handle_timer();
            }

            match res {
                Ok(0) if timers_fired == 0 => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Poll timeout; no I/O events had happened");
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error during polling: {err}");
                    self.service.handle_error(Error::Poll(err));
                }
                _ => {}
            }

            let awoken = self.handle_events(now);

            // Process the commands only if we awaken by the waker
            if awoken {
                loop {
                    match self.ctl_recv.try_recv() {
                        Err(chan::TryRecvError::Empty) => break,
                        Err(chan::TryRecvError::Disconnected) => {
                            #[cfg(feature = "log")]
                            log::warn!(target: "reactor", "Control channel is broken");
                            return self.handle_shutdown();
                        }
                        Ok(Ctl::Shutdown) => return self.handle_shutdown(),
                        Ok(Ctl::Cmd(cmd)) => self.service.handle_command(cmd),
                    }
                }
            }

            if !self.handle_actions(now) {
                return self.handle_shutdown();
            }
        }
    }

    /// # Returns
    ///
    /// Whether it was awakened by a waker
    fn handle_events(&mut self, time: Timestamp) -> bool {
        let mut awoken = false;

        while let Some((id, res)) = self.poller.next() {
            if id == ResourceId::WAKER {
                if let Err(err) = res {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Polling waker has failed: {err}");
                    continue;
                };

                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Awoken by the controller");

                self.waker.reset();
                awoken = true;
            } else if let Some(listener) = self.listeners.get_mut(&id) {
                match res {
                    Ok(io) => {
                        #[cfg(feature = "log")]
                        log::trace!(target: "reactor", "Got `{io}` event from listener {id}");

                        for io in io {
                            if let Some(event) = listener.handle_io(io) {
                                self.service.handle_listener_event(id, event, time);
                            }
                        }
                    }
                    Err(err) => {
                        #[cfg(feature = "log")]
                        log::trace!(target: "reactor", "Listener {id} {err}");
                        if let Some(listener) = self.unregister_listener(id) {
                            self.service.handle_error(Error::ListenerDisconnect(id, listener));
                        }
                    }
                }
            } else if let Some(transport) = self.transports.get_mut(&id) {
                match res {
                    Ok(io) => {
                        #[cfg(feature = "log")]
                        log::trace!(target: "reactor", "Got `{io}` event from transport {id}");

                        for io in io {
                            if let Some(event) = transport.handle_io(io) {
                                self.service.handle_transport_event(id, event, time);
                            }
                        }
                    }
                    Err(err) => {
                        #[cfg(feature = "log")]
                        log::trace!(target: "reactor", "Transport {id} {err}");
                        if let Some(transport) = self.unregister_transport(id) {
                            self.service.handle_error(Error::TransportDisconnect(id, transport));
                        }
                    }
                }
            } else {
                // The resource was unregistered by an action after the poll has reported it
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Skipping event for unknown resource {id}");
            }
        }

        awoken
    }

    /// Handles the actions from the queue.
    ///
    /// # Return
    ///
    /// Return value indicates whether the reactor must proceed operating (`true`) or should
    /// terminate (`false`).
    fn handle_actions(&mut self, time: Timestamp) -> bool {
        let mut proceed = true;
        while let Some(action) = self.service.next() {
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Handling action {action} from the service");

            // NB: Deadlock may happen here if the service will generate events over and over
            // in the handle_* calls we may never get out of this loop
            match self.handle_action(action, time) {
                Ok(ret) => proceed &= ret,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error: {err}");
                    self.service.handle_error(err);
                }
            }
        }
        proceed
    }

    fn handle_action(
        &mut self,
        action: Action<H::Listener, H::Transport>,
        time: Timestamp,
    ) -> Result<bool, Error<H::Listener, H::Transport>> {
        match action {
            Action::RegisterListener(listener) => {
                let fd = listener.as_raw_fd();
                let id = self.next_id();

                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Registering listener {id} with fd={fd}");

                if let Err(err) = self.poller.register(id, &listener, IoType::read_only()) {
                    let _ = listener.disconnect();
                    return Err(Error::Registration(err));
                }
                self.listeners.insert(id, listener);
                self.service.handle_registered(fd, id, ResourceType::Listener);
            }
            Action::RegisterTransport(transport) => {
                let fd = transport.as_raw_fd();
                let id = self.next_id();

                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Registering transport {id} with fd={fd}");

                if let Err(err) = self.poller.register(id, &transport, transport.interests()) {
                    let _ = transport.disconnect();
                    return Err(Error::Registration(err));
                }
                self.transports.insert(id, transport);
                self.service.handle_registered(fd, id, ResourceType::Transport);
            }
            Action::UnregisterListener(id) => {
                let Some(listener) = self.unregister_listener(id) else {
                    return Ok(true);
                };
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Handing over listener {id}");
                self.service.handover_listener(id, listener);
            }
            Action::UnregisterTransport(id) => {
                let Some(transport) = self.unregister_transport(id) else {
                    return Ok(true);
                };
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Handing over transport {id}");
                self.service.handover_transport(id, transport);
            }
            Action::Send(id, data) => {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Sending {} bytes to {id}", data.len());

                let Some(transport) = self.transports.get_mut(&id) else {
                    #[cfg(feature = "log")]
                    log::warn!(target: "reactor", "Transport {id} is not in the reactor; dropping data");
                    return Ok(true);
                };
                match transport.write_atomic(&data) {
                    Err(WriteError::NotReady) => {
                        // The session is already closing; its handler learns about it from the
                        // transport events
                        #[cfg(feature = "log")]
                        log::warn!(target: "reactor", "Transport {id} is not ready for writing; dropping data");
                    }
                    Err(WriteError::Io(e)) => {
                        #[cfg(feature = "log")]
                        log::error!(target: "reactor", "Fatal error writing to transport {id}, disconnecting. Error details: {e:?}");
                        if let Some(transport) = self.unregister_transport(id) {
                            return Err(Error::TransportDisconnect(id, transport));
                        }
                    }
                    Ok(_) => {}
                }
            }
            Action::Finish(id) => {
                if let Some(transport) = self.transports.get_mut(&id) {
                    #[cfg(feature = "log")]
                    log::debug!(target: "reactor", "Finishing transport {id}");
                    transport.finish();
                }
            }
            Action::SetTimer(duration) => {
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Adding timer {duration:?} from now");

                self.timeouts.set_timeout(duration, time);
            }
            Action::Terminate => return Ok(false),
        }
        Ok(true)
    }

    fn handle_shutdown(mut self) {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Shutdown: closing {} transport(s)", self.transports.len());

        let ids = self.transports.keys().copied().collect::<Vec<_>>();
        for id in ids {
            if let Some(transport) = self.unregister_transport(id) {
                if let Err(err) = transport.disconnect() {
                    #[cfg(feature = "log")]
                    log::debug!(target: "reactor", "Unable to close transport {id}: {err}");
                }
            }
        }
        let ids = self.listeners.keys().copied().collect::<Vec<_>>();
        for id in ids {
            if let Some(listener) = self.unregister_listener(id) {
                let _ = listener.disconnect();
            }
        }
    }

    fn next_id(&mut self) -> ResourceId {
        self.last_id = self.last_id.next();
        self.last_id
    }

    fn unregister_listener(&mut self, id: ResourceId) -> Option<H::Listener> {
        let Some(listener) = self.listeners.remove(&id) else {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "Unregistering non-registered listener {id}");
            return None;
        };

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Unregistering listener {id} (fd={})", listener.as_raw_fd());

        self.poller.unregister(id);

        Some(listener)
    }

    fn unregister_transport(&mut self, id: ResourceId) -> Option<H::Transport> {
        let Some(transport) = self.transports.remove(&id) else {
            #[cfg(feature = "log")]
            log::debug!(target: "reactor", "Unregistering non-registered transport {id}");
            return None;
        };

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Unregistering transport {id} (fd={})", transport.as_raw_fd());

        self.poller.unregister(id);

        Some(transport)
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::os::unix::io::RawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};
    use std::thread::sleep;

    use super::*;
    use crate::poller::popol::Poller;
    use crate::{Io, Reactor};

    // Both ends are kept so the resource never reports a hangup
    pub struct DumbRes(UnixStream, #[allow(dead_code)] UnixStream);
    impl DumbRes {
        pub fn new() -> DumbRes {
            let (one, two) = UnixStream::pair().unwrap();
            DumbRes(one, two)
        }
    }
    impl AsRawFd for DumbRes {
        fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
    }
    impl io::Write for DumbRes {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> { Ok(buf.len()) }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }
    impl WriteAtomic for DumbRes {
        fn is_ready_to_write(&self) -> bool { true }
        fn empty_write_buf(&mut self) -> io::Result<bool> { Ok(true) }
        fn write_or_buf(&mut self, _buf: &[u8]) -> io::Result<()> { Ok(()) }
    }
    impl Resource for DumbRes {
        type Event = ();
        fn interests(&self) -> IoType { IoType::none() }
        fn handle_io(&mut self, _io: Io) -> Option<Self::Event> { None }
        fn disconnect(self) -> io::Result<()> { Ok(()) }
    }

    #[derive(Clone, Eq, PartialEq, Debug)]
    enum Cmd {
        Init,
        Stop,
    }

    #[derive(Default)]
    struct DumbService {
        add_resource: bool,
        set_timer: bool,
        terminate: bool,
        timers: Arc<Mutex<usize>>,
        registered: Arc<Mutex<Vec<ResourceId>>>,
    }
    impl Iterator for DumbService {
        type Item = Action<DumbRes, DumbRes>;
        fn next(&mut self) -> Option<Self::Item> {
            if self.add_resource {
                self.add_resource = false;
                Some(Action::RegisterTransport(DumbRes::new()))
            } else if self.set_timer {
                self.set_timer = false;
                Some(Action::SetTimer(Duration::from_millis(3)))
            } else if self.terminate {
                self.terminate = false;
                Some(Action::Terminate)
            } else {
                None
            }
        }
    }
    impl Handler for DumbService {
        type Listener = DumbRes;
        type Transport = DumbRes;
        type Command = Cmd;

        fn tick(&mut self, _time: Timestamp) {}
        fn handle_timer(&mut self) {
            *self.timers.lock().unwrap() += 1;
            self.set_timer = true;
        }
        fn handle_listener_event(&mut self, _id: ResourceId, _event: (), _time: Timestamp) {
            unreachable!()
        }
        fn handle_transport_event(&mut self, _id: ResourceId, _event: (), _time: Timestamp) {
            unreachable!()
        }
        fn handle_registered(&mut self, _fd: RawFd, id: ResourceId, _ty: ResourceType) {
            self.registered.lock().unwrap().push(id);
        }
        fn handle_command(&mut self, cmd: Self::Command) {
            match cmd {
                Cmd::Init => {
                    self.add_resource = true;
                    self.set_timer = true;
                }
                Cmd::Stop => self.terminate = true,
            }
        }
        fn handle_error(&mut self, err: Error<Self::Listener, Self::Transport>) {
            panic!("{err}")
        }
        fn handover_listener(&mut self, _id: ResourceId, _listener: Self::Listener) {
            unreachable!()
        }
        fn handover_transport(&mut self, _id: ResourceId, _transport: Self::Transport) {
            unreachable!()
        }
    }

    #[test]
    fn timer_and_terminate() {
        let service = DumbService::default();
        let timers = service.timers.clone();
        let registered = service.registered.clone();

        let reactor = Reactor::new(service, Poller::new(), Duration::from_millis(50)).unwrap();
        reactor.controller().cmd(Cmd::Init).unwrap();
        sleep(Duration::from_millis(500));
        assert!(*timers.lock().unwrap() >= 5, "timer re-armed on each firing");
        assert_eq!(*registered.lock().unwrap(), vec![ResourceId::from(1)]);

        reactor.controller().cmd(Cmd::Stop).unwrap();
        reactor.join().unwrap();
    }
}
