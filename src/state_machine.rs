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

//! Per-connection protocol state machine.
//!
//! The machine owns the input buffer and the output queue of a single connection. Bytes are fed
//! as they arrive from the socket; the machine consumes as much of them as forms complete units
//! (the identification line, a frame header, a frame body) and keeps the rest until more bytes
//! arrive. Already consumed bytes are never parsed again.

use std::collections::VecDeque;

use crate::wire::{
    ProtocolError, Request, RequestHeader, Response, ResponseHeader, Role, MAX_IDENT_LEN,
    REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN,
};

/// Kind of frames the machine decodes from the peer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Expect {
    Requests,
    Responses,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Header {
    Request(RequestHeader),
    Response(ResponseHeader),
}

impl Header {
    fn body_len(&self) -> usize {
        match self {
            Header::Request(header) => header.body_len as usize,
            Header::Response(header) => header.body_len as usize,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    /// Waiting for the newline-terminated identification line.
    AwaitingIdentify,
    /// Waiting for a fixed-size frame header.
    AwaitingHeader,
    /// Waiting for the body sized by the header.
    AwaitingBody(Header),
    /// Terminal state, reached on a protocol violation or when the session is dropped.
    Closed,
}

/// Unit decoded from the peer input.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Inbound {
    Identified(Role),
    Request(Request),
    Response(Response),
}

enum Progress {
    NeedMore,
    Advanced,
    Decoded(Inbound),
}

#[derive(Debug)]
pub struct StateMachine {
    state: State,
    expect: Expect,
    /// Direction switch applied after the next decoded frame.
    then_expect: Option<Expect>,
    input: Vec<u8>,
    /// Length of the input prefix already searched for the end of the identification line.
    scanned: usize,
    output: VecDeque<u8>,
    closing: bool,
    error: Option<ProtocolError>,
}

impl StateMachine {
    /// Machine decoding frames of the given kind right away, without an identification line.
    pub fn new(expect: Expect) -> Self {
        StateMachine {
            state: State::AwaitingHeader,
            expect,
            then_expect: None,
            input: vec![],
            scanned: 0,
            output: empty!(),
            closing: false,
            error: None,
        }
    }

    /// Machine of the accepting side: decodes the identification line first. A client sends
    /// requests only; a backend sends its login request and afterwards only answers requests.
    pub fn identifier() -> Self {
        StateMachine {
            state: State::AwaitingIdentify,
            ..StateMachine::new(Expect::Requests)
        }
    }

    /// Machine of a backend dialing the frontend: awaits the login response and afterwards serves
    /// requests.
    pub fn declarer() -> Self {
        StateMachine {
            then_expect: Some(Expect::Requests),
            ..StateMachine::new(Expect::Responses)
        }
    }

    pub fn state(&self) -> State { self.state }

    pub fn expect(&self) -> Expect { self.expect }

    /// Appends the bytes to the input buffer and decodes every complete unit from it.
    ///
    /// A violation closes the machine; units decoded before the violation are still returned.
    /// Once the machine is closed, or finishing, feeding is a no-op.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Inbound> {
        if self.state == State::Closed || self.closing {
            return vec![];
        }
        self.input.extend_from_slice(bytes);

        let mut decoded = vec![];
        loop {
            match self.step() {
                Ok(Progress::NeedMore) => break,
                Ok(Progress::Advanced) => {}
                Ok(Progress::Decoded(inbound)) => decoded.push(inbound),
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
        decoded
    }

    fn step(&mut self) -> Result<Progress, ProtocolError> {
        match self.state {
            State::Closed => Ok(Progress::NeedMore),

            State::AwaitingIdentify => {
                let Some(pos) = self.input[self.scanned..].iter().position(|b| *b == b'\n') else {
                    self.scanned = self.input.len();
                    if self.scanned >= MAX_IDENT_LEN {
                        return Err(ProtocolError::IdentTooLong);
                    }
                    return Ok(Progress::NeedMore);
                };
                let end = self.scanned + pos;
                if end + 1 > MAX_IDENT_LEN {
                    return Err(ProtocolError::IdentTooLong);
                }
                let line = self.input.drain(..=end).collect::<Vec<_>>();
                self.scanned = 0;
                let line = String::from_utf8_lossy(&line);
                let role = Role::parse(line.trim_end_matches(&['\n', '\r'][..]))?;
                if let Role::Backend { .. } = role {
                    // Exactly one login request, then only responses
                    self.then_expect = Some(Expect::Responses);
                }
                self.state = State::AwaitingHeader;
                Ok(Progress::Decoded(Inbound::Identified(role)))
            }

            State::AwaitingHeader => {
                let header = match self.expect {
                    Expect::Requests => {
                        let Some(bytes) = self.input.get(..REQUEST_HEADER_LEN) else {
                            return Ok(Progress::NeedMore);
                        };
                        let mut buf = [0u8; REQUEST_HEADER_LEN];
                        buf.copy_from_slice(bytes);
                        Header::Request(RequestHeader::decode(&buf)?)
                    }
                    Expect::Responses => {
                        let Some(bytes) = self.input.get(..RESPONSE_HEADER_LEN) else {
                            return Ok(Progress::NeedMore);
                        };
                        let mut buf = [0u8; RESPONSE_HEADER_LEN];
                        buf.copy_from_slice(bytes);
                        Header::Response(ResponseHeader::decode(&buf)?)
                    }
                };
                let len = match header {
                    Header::Request(_) => REQUEST_HEADER_LEN,
                    Header::Response(_) => RESPONSE_HEADER_LEN,
                };
                self.input.drain(..len);
                self.state = State::AwaitingBody(header);
                Ok(Progress::Advanced)
            }

            State::AwaitingBody(header) => {
                let len = header.body_len();
                if self.input.len() < len {
                    return Ok(Progress::NeedMore);
                }
                let body = self.input.drain(..len).collect::<Vec<_>>();
                self.state = State::AwaitingHeader;
                if let Some(expect) = self.then_expect.take() {
                    self.expect = expect;
                }
                Ok(Progress::Decoded(match header {
                    Header::Request(header) => Inbound::Request(Request {
                        opcode: header.opcode,
                        arg: header.arg,
                        body,
                    }),
                    Header::Response(header) => Inbound::Response(Response {
                        status: header.status,
                        body,
                    }),
                }))
            }
        }
    }

    fn fail(&mut self, err: ProtocolError) {
        #[cfg(feature = "log")]
        log::debug!(target: "service", "Protocol violation: {err}");
        self.error = Some(err);
        self.close();
    }

    /// Moves the machine into the terminal state, discarding all buffered input and output.
    pub fn close(&mut self) {
        self.state = State::Closed;
        self.input.clear();
        self.output.clear();
    }

    /// Reports that the peer has closed the connection. Returns a violation if it happened in the
    /// middle of a frame.
    pub fn end_of_input(&mut self) -> Option<ProtocolError> {
        let truncated = match self.state {
            State::AwaitingBody(_) => true,
            State::AwaitingHeader | State::AwaitingIdentify => !self.input.is_empty(),
            State::Closed => false,
        };
        self.close();
        truncated.then_some(ProtocolError::Truncated)
    }

    /// Violation which has closed the machine, if any.
    pub fn error(&self) -> Option<&ProtocolError> { self.error.as_ref() }

    pub fn take_error(&mut self) -> Option<ProtocolError> { self.error.take() }

    /// Queues bytes for sending to the peer. Returns `false` if the machine is already closed.
    pub fn enqueue(&mut self, bytes: &[u8]) -> bool {
        if self.state == State::Closed {
            return false;
        }
        self.output.extend(bytes);
        true
    }

    /// Removes up to `max` bytes from the front of the output queue. An empty result means nothing
    /// is pending.
    pub fn drain(&mut self, max: usize) -> Vec<u8> {
        let len = max.min(self.output.len());
        self.output.drain(..len).collect()
    }

    /// Returns the part of drained output the socket was unable to write back to the front of the
    /// output queue.
    pub fn requeue(&mut self, bytes: &[u8]) {
        for byte in bytes.iter().rev() {
            self.output.push_front(*byte);
        }
    }

    /// Stops decoding input; the session ends once the output queue is drained.
    pub fn close_after_flush(&mut self) { self.closing = true; }

    pub fn wants_write(&self) -> bool { self.state != State::Closed && !self.output.is_empty() }

    pub fn is_closed(&self) -> bool { self.state == State::Closed }

    pub fn is_closing(&self) -> bool { self.closing }

    /// Whether the session was asked to close after flushing and has nothing left to send.
    pub fn is_finished(&self) -> bool {
        self.closing && self.output.is_empty() && self.state != State::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Opcode, Status};

    fn client_stream() -> Vec<u8> {
        let mut bytes = Role::Client.to_line();
        bytes.extend(Request::new(Opcode::Connect, 0).encode());
        bytes.extend(Request::with_body(Opcode::Write, 5, vec![0xAA; 300]).encode());
        bytes.extend(Request::new(Opcode::Read, 5).encode());
        bytes
    }

    #[test]
    fn fragmentation_does_not_matter() {
        let bytes = client_stream();

        let mut whole = StateMachine::identifier();
        let expected = whole.feed(&bytes);
        assert_eq!(expected.len(), 4);
        assert_eq!(expected[0], Inbound::Identified(Role::Client));
        assert_eq!(
            expected[2],
            Inbound::Request(Request::with_body(Opcode::Write, 5, vec![0xAA; 300]))
        );

        for chunk in [1, 2, 7, 13, 64] {
            let mut machine = StateMachine::identifier();
            let mut decoded = vec![];
            for part in bytes.chunks(chunk) {
                decoded.extend(machine.feed(part));
            }
            assert_eq!(decoded, expected, "chunk size {chunk}");
            assert_eq!(machine.state(), State::AwaitingHeader);
        }
    }

    #[test]
    fn resumes_mid_frame() {
        let frame = Request::with_body(Opcode::SetBlock, 3, vec![7; 10]).encode();
        let mut machine = StateMachine::new(Expect::Requests);
        assert!(machine.feed(&frame[..5]).is_empty());
        assert_eq!(machine.state(), State::AwaitingHeader);
        assert!(machine.feed(&frame[5..15]).is_empty());
        assert!(matches!(machine.state(), State::AwaitingBody(_)));
        let decoded = machine.feed(&frame[15..]);
        assert_eq!(decoded, vec![Inbound::Request(Request::with_body(
            Opcode::SetBlock,
            3,
            vec![7; 10]
        ))]);
    }

    #[test]
    fn backend_direction_switch() {
        let mut bytes = Role::Backend {
            index: 1,
            address: s!("127.0.0.1:9001"),
        }
        .to_line();
        bytes.extend(Request::new(Opcode::Login, 1).encode());
        bytes.extend(Response::ok(vec![1, 2, 3]).encode());

        let mut machine = StateMachine::identifier();
        let decoded = machine.feed(&bytes);
        assert_eq!(decoded.len(), 3);
        assert!(matches!(decoded[1], Inbound::Request(Request { opcode: Opcode::Login, .. })));
        assert_eq!(decoded[2], Inbound::Response(Response::ok(vec![1, 2, 3])));
        assert_eq!(machine.expect(), Expect::Responses);

        let mut declarer = StateMachine::declarer();
        let mut bytes = Response::empty().encode();
        bytes.extend(Request::new(Opcode::GetBlock, 9).encode());
        let decoded = declarer.feed(&bytes);
        assert_eq!(decoded, vec![
            Inbound::Response(Response::empty()),
            Inbound::Request(Request::new(Opcode::GetBlock, 9))
        ]);
    }

    #[test]
    fn violation_closes() {
        let mut machine = StateMachine::identifier();
        let mut bytes = Role::Client.to_line();
        bytes.extend(Request::new(Opcode::Connect, 0).encode());
        bytes.push(0xEE);
        bytes.extend([0u8; 12]);

        let decoded = machine.feed(&bytes);
        assert_eq!(decoded.len(), 2, "units before the violation are kept");
        assert!(machine.is_closed());
        assert_eq!(machine.error(), Some(&ProtocolError::UnknownOpcode(0xEE)));
        assert!(machine.feed(&Request::new(Opcode::Time, 0).encode()).is_empty());
        assert!(!machine.enqueue(b"late"));
    }

    #[test]
    fn identification_limits() {
        let mut machine = StateMachine::identifier();
        assert!(machine.feed(&[b'x'; 200]).is_empty());
        assert!(!machine.is_closed());
        assert!(machine.feed(&[b'x'; 100]).is_empty());
        assert_eq!(machine.error(), Some(&ProtocolError::IdentTooLong));

        let mut machine = StateMachine::identifier();
        machine.feed(b"HELLO\n");
        assert_eq!(machine.error(), Some(&ProtocolError::InvalidIdent(s!("HELLO"))));
    }

    #[test]
    fn output_queue() {
        let mut machine = StateMachine::new(Expect::Requests);
        assert!(!machine.wants_write());
        assert!(machine.enqueue(&Response::empty().encode()));
        assert!(machine.enqueue(&[Status::Ok as u8]));
        let first = machine.drain(3);
        assert_eq!(first.len(), 3);
        machine.requeue(&first[1..]);
        assert_eq!(machine.drain(100), vec![0, 0, 0, 0, Status::Ok as u8]);
        assert!(machine.drain(100).is_empty());

        machine.enqueue(b"bye");
        machine.close_after_flush();
        assert!(machine.feed(&Request::new(Opcode::Time, 0).encode()).is_empty());
        assert!(!machine.is_finished());
        machine.drain(3);
        assert!(machine.is_finished());
    }

    #[test]
    fn truncated_frame() {
        let mut machine = StateMachine::new(Expect::Responses);
        machine.feed(&Response::ok(vec![1; 8]).encode()[..7]);
        assert_eq!(machine.end_of_input(), Some(ProtocolError::Truncated));

        let mut machine = StateMachine::new(Expect::Responses);
        machine.feed(&Response::ok(vec![1; 8]).encode());
        assert_eq!(machine.end_of_input(), None);
    }
}
