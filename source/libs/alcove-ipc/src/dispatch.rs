// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Framed receive loop, callback dispatch, duplex correlation.
//!
//! Not only the helper thread receives messages; any thread holding a port
//! may run the receive routine for a specific sequence number. The routine
//! is serialized per handle by the port's receive lock. Automatic `RESP`
//! replies are sent only from the helper's dispatch path.

use std::sync::Arc;

use alcove_pal::{PalError, Stream as _};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::message::{Message, MsgHeader, CODE_COUNT, CODE_RESP, HEADER_LEN, READ_AHEAD};
use crate::port::Port;
use crate::registry::IpcFabric;
use crate::{errno, IpcError, ProcessId, Result};

/// What a message callback asks the fabric to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Handled; negative values are errors and trigger an automatic `RESP`
    /// when the message carried a sequence number.
    Value(i32),
    /// Ask the helper to send a success `RESP` for this request.
    ReplyRequested,
}

/// Handler invoked for one incoming message on its originating port.
pub type Callback = Arc<dyn Fn(&Message, &Arc<Port>) -> CallbackOutcome + Send + Sync>;

/// Fixed-size handler table indexed by message code. Slot 0 (`RESP`) is
/// built in and cannot be replaced.
pub(crate) struct CallbackTable {
    slots: Mutex<Vec<Option<Callback>>>,
}

impl CallbackTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(vec![None; CODE_COUNT]),
        }
    }

    fn get(&self, code: u16) -> Option<Callback> {
        self.slots.lock().get(code as usize).and_then(Clone::clone)
    }

    fn set(&self, code: u16, callback: Callback) -> Result<()> {
        if code == CODE_RESP {
            return Err(IpcError::Pal(PalError::Invalid));
        }
        let mut slots = self.slots.lock();
        match slots.get_mut(code as usize) {
            Some(slot) => {
                *slot = Some(callback);
                Ok(())
            }
            None => Err(IpcError::UnknownCode),
        }
    }
}

/// How the receive routine consumes frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvMode {
    /// Drain every available frame, dispatching each to its callback.
    Dispatch,
    /// Return the frame whose sequence number matches (any frame for 0),
    /// dispatching the frames skipped over along the way.
    Match(u64),
}

impl IpcFabric {
    /// Registers `callback` for `code`. `RESP` is reserved.
    pub fn register_callback(&self, code: u16, callback: Callback) -> Result<()> {
        self.callbacks.set(code, callback)
    }

    /// Receives framed messages from `port`.
    ///
    /// In [`RecvMode::Dispatch`] the routine drains the stream, invoking
    /// callbacks, and returns `None`. In [`RecvMode::Match`] it blocks
    /// until the matching frame arrives and returns it. A dead stream
    /// tears the port down with connection-reset.
    pub fn receive_on_port(
        self: &Arc<Self>,
        port: &Arc<Port>,
        mode: RecvMode,
    ) -> Result<Option<Message>> {
        let _recv = port.recv_lock.lock();

        // Match mode reads exactly what each frame needs, so nothing is
        // buffered past the frame handed back to the caller.
        let read_ahead = match mode {
            RecvMode::Dispatch => READ_AHEAD,
            RecvMode::Match(_) => 0,
        };

        let mut buf = vec![0u8; HEADER_LEN + read_ahead];
        let mut filled = 0usize;

        loop {
            let mut expected = HEADER_LEN;
            let mut header: Option<MsgHeader> = None;

            loop {
                if header.is_none() && filled >= HEADER_LEN {
                    match MsgHeader::decode(&buf[..HEADER_LEN]) {
                        Ok(parsed) => {
                            expected = parsed.size as usize;
                            header = Some(parsed);
                        }
                        Err(_) => {
                            warn!("malformed frame header; resetting port");
                            self.teardown_port(port, -errno::ECONNRESET);
                            return Err(IpcError::Malformed);
                        }
                    }
                }
                if header.is_some() && filled >= expected {
                    break;
                }

                if expected + read_ahead > buf.len() {
                    let mut grown = buf.len().max(1);
                    while expected + read_ahead > grown {
                        grown *= 2;
                    }
                    buf.resize(grown, 0);
                }

                let want = expected - filled + read_ahead;
                let end = (filled + want).min(buf.len());
                let handle = match port.handle() {
                    Ok(handle) => handle,
                    Err(_) => return Err(IpcError::ConnectionReset),
                };
                match handle.read(&mut buf[filled..end]) {
                    Ok(bytes) => filled += bytes,
                    Err(PalError::Interrupted) => continue,
                    Err(PalError::WouldBlock) => {
                        if filled == 0 && mode == RecvMode::Dispatch {
                            return Ok(None);
                        }
                        continue;
                    }
                    Err(err) => {
                        debug!("port removed at reading ({err})");
                        self.teardown_port(port, -errno::ECONNRESET);
                        return Err(IpcError::ConnectionReset);
                    }
                }
            }

            let Some(header) = header else {
                return Err(IpcError::Malformed);
            };
            let payload = buf[HEADER_LEN..expected].to_vec();
            buf.copy_within(expected..filled, 0);
            filled -= expected;
            let msg = Message { header, payload };

            debug!(
                "received message: code={} size={} src={} dst={} seq={:#x}",
                msg.header.code, msg.header.size, msg.header.src, msg.header.dst, msg.header.seq
            );

            if let RecvMode::Match(seq) = mode {
                if seq == 0 || msg.header.seq == seq {
                    return Ok(Some(msg));
                }
            }

            if msg.header.src == self.self_id() {
                // Echo of our own send through the broadcast channel.
                debug!("dropping echoed message (seq={:#x})", msg.header.seq);
            } else {
                self.dispatch(&msg, port, mode);
            }

            if filled == 0 && mode == RecvMode::Dispatch {
                return Ok(None);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, msg: &Message, port: &Arc<Port>, mode: RecvMode) {
        if msg.header.code == CODE_RESP {
            self.handle_resp(msg, port);
            return;
        }

        let Some(callback) = self.callbacks.get(msg.header.code) else {
            debug!("no callback for code {}", msg.header.code);
            return;
        };

        let outcome = (*callback)(msg, port);
        if mode != RecvMode::Dispatch || msg.header.seq == 0 {
            return;
        }
        let retval = match outcome {
            CallbackOutcome::Value(value) if value < 0 => value,
            CallbackOutcome::ReplyRequested => 0,
            CallbackOutcome::Value(_) => return,
        };
        self.respond(port, msg.header.src, retval, msg.header.seq);
    }

    /// Built-in `RESP` handling: complete the matching pending request.
    fn handle_resp(&self, msg: &Message, port: &Arc<Port>) {
        let Some(retval) = msg.retval() else {
            warn!("RESP with short payload from {}", msg.header.src);
            return;
        };
        debug!("RESP({retval}) from {}", msg.header.src);
        if msg.header.seq == 0 {
            return;
        }
        match port.detach_pending(msg.header.seq) {
            Some(slot) => slot.complete(retval),
            None => debug!("orphan RESP for seq {:#x}", msg.header.seq),
        }
    }

    /// Sends an `RESP` frame answering `seq` on `port`.
    fn respond(&self, port: &Arc<Port>, dst: ProcessId, retval: i32, seq: u64) {
        debug!("sending RESP({retval}) to {dst}");
        let resp = Message::resp(retval, self.self_id(), dst, seq);
        if let Err(err) = port.send(&resp) {
            warn!("failed to send RESP to {dst}: {err}");
        }
    }

    /// Sends a duplex request and parks until its `RESP` or port teardown.
    ///
    /// A zero sequence number is replaced with a freshly allocated one.
    pub fn send_request(self: &Arc<Self>, port: &Arc<Port>, mut msg: Message) -> Result<i32> {
        if msg.header.seq == 0 {
            msg.header.seq = self.next_seq();
        }
        let slot = port.attach_pending(msg.header.seq);
        if let Err(err) = port.send(&msg) {
            port.detach_pending(msg.header.seq);
            return Err(err);
        }
        Ok(slot.wait())
    }
}
