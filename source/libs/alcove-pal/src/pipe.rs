// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory host byte streams (socketless, deterministic tests).
//!
//! The host backend mirrors the `pipe:` URI scheme of the native PAL: a
//! process-wide namespace maps pipe names to listeners, `connect` hands the
//! listener one end of a fresh duplex pair, and either end going away marks
//! the survivor disconnected while buffered bytes stay readable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::poll::{Ready, Signal};
use crate::{Handle, PalError, Result, Stream, StreamAttr};

/// URI prefix accepted by [`open`] for client connections.
pub const URI_PIPE: &str = "pipe:";
/// URI prefix accepted by [`open`] for server streams.
pub const URI_PIPE_SRV: &str = "pipe.srv:";

/// Process-wide pipe namespace: name -> live listener.
static NAMESPACE: Lazy<Mutex<HashMap<String, Weak<ListenerStream>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Opens a stream from a URI: `pipe.srv:<name>` listens, `pipe:<name>`
/// connects.
pub fn open(uri: &str) -> Result<Handle> {
    if let Some(name) = uri.strip_prefix(URI_PIPE_SRV) {
        return listen(name);
    }
    if let Some(name) = uri.strip_prefix(URI_PIPE) {
        return connect(name);
    }
    Err(PalError::Invalid)
}

/// Registers a named listener. Fails with `Denied` when the name is taken.
pub fn listen(name: &str) -> Result<Handle> {
    let listener = Arc::new(ListenerStream::new(name.to_string()));
    let previous = {
        let mut namespace = NAMESPACE.lock();
        let previous = namespace.get(name).and_then(Weak::upgrade);
        match &previous {
            Some(live) if !live.is_closed() => return Err(PalError::Denied),
            _ => namespace.insert(name.to_string(), Arc::downgrade(&listener)),
        };
        previous
    };
    // Dropped outside the namespace lock; a stale entry may be the last ref.
    drop(previous);
    debug!("pipe listener registered: {name}");
    Ok(listener)
}

/// Connects to a named listener, queueing the server end for `accept`.
pub fn connect(name: &str) -> Result<Handle> {
    let listener = {
        let namespace = NAMESPACE.lock();
        namespace.get(name).and_then(Weak::upgrade)
    };
    let listener = listener.ok_or(PalError::NotConnection)?;
    let (client, server) = pipe_pair();
    listener.enqueue(server)?;
    debug!("pipe client connected: {name}");
    Ok(client)
}

/// Creates an anonymous connected duplex pair.
pub fn pipe_pair() -> (Handle, Handle) {
    let a_to_b = Arc::new(Channel::default());
    let b_to_a = Arc::new(Channel::default());
    let signal_a = Arc::new(Signal::new());
    let signal_b = Arc::new(Signal::new());

    let a = Arc::new(PipeEnd {
        rx: Arc::clone(&b_to_a),
        tx: Arc::clone(&a_to_b),
        signal: signal_a,
        peer_signal: Arc::clone(&signal_b),
        closed: AtomicBool::new(false),
    });
    let b = Arc::new(PipeEnd {
        rx: a_to_b,
        tx: b_to_a,
        signal: signal_b,
        peer_signal: Arc::clone(&a.signal),
        closed: AtomicBool::new(false),
    });
    (a, b)
}

/// One direction of a duplex pipe.
#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

#[derive(Default)]
struct ChannelState {
    buf: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

/// One endpoint of an in-memory duplex stream.
struct PipeEnd {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    signal: Arc<Signal>,
    peer_signal: Arc<Signal>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd").finish_non_exhaustive()
    }
}

impl PipeEnd {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PalError::BadHandle)
        } else {
            Ok(())
        }
    }
}

impl Stream for PipeEnd {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Err(PalError::Invalid);
        }
        let mut state = self.rx.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for byte in buf.iter_mut().take(n) {
                    *byte = state.buf.pop_front().unwrap_or_default();
                }
                if state.buf.is_empty() && !state.writer_closed {
                    self.signal.lower(Ready::READABLE);
                }
                return Ok(n);
            }
            if state.writer_closed {
                return Err(PalError::Disconnected);
            }
            self.rx.cond.wait(&mut state);
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        let mut state = self.tx.state.lock();
        if state.reader_closed {
            return Err(PalError::Disconnected);
        }
        state.buf.extend(buf.iter().copied());
        // Raised under the channel lock so readiness tracks the buffer.
        self.peer_signal.raise(Ready::READABLE);
        drop(state);
        self.tx.cond.notify_all();
        Ok(buf.len())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rx.state.lock().reader_closed = true;
        {
            let mut state = self.tx.state.lock();
            state.writer_closed = true;
        }
        // Wake a peer blocked in read and flag the hangup for its pollers.
        self.tx.cond.notify_all();
        self.peer_signal.raise(Ready::HUP);
    }

    fn attr(&self) -> Result<StreamAttr> {
        self.check_open()?;
        let (readable, disconnected, pending_size) = {
            let state = self.rx.state.lock();
            (!state.buf.is_empty(), state.writer_closed, state.buf.len())
        };
        let writable = !self.tx.state.lock().reader_closed;
        Ok(StreamAttr { readable, writable, disconnected, pending_size })
    }

    fn signal(&self) -> &Signal {
        &self.signal
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        self.close();
    }
}

/// Server stream: a queue of connected-but-unaccepted client ends.
struct ListenerStream {
    name: String,
    state: Mutex<ListenerState>,
    cond: Condvar,
    signal: Signal,
}

impl std::fmt::Debug for ListenerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerStream").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ListenerState {
    queue: VecDeque<Handle>,
    closed: bool,
}

impl ListenerStream {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(ListenerState::default()),
            cond: Condvar::new(),
            signal: Signal::new(),
        }
    }

    fn enqueue(&self, server_end: Handle) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PalError::NotConnection);
        }
        state.queue.push_back(server_end);
        self.signal.raise(Ready::READABLE);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Stream for ListenerStream {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(PalError::NotConnection)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(PalError::NotConnection)
    }

    fn close(&self) {
        // The namespace entry is a Weak and is pruned lazily by `listen`;
        // touching it here would re-enter the namespace lock from drops.
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.cond.notify_all();
        debug!("pipe listener closed: {}", self.name);
    }

    fn attr(&self) -> Result<StreamAttr> {
        let state = self.state.lock();
        if state.closed {
            return Err(PalError::BadHandle);
        }
        Ok(StreamAttr {
            readable: !state.queue.is_empty(),
            writable: false,
            disconnected: false,
            pending_size: state.queue.len(),
        })
    }

    fn accept(&self) -> Result<Handle> {
        let mut state = self.state.lock();
        loop {
            if let Some(client) = state.queue.pop_front() {
                if state.queue.is_empty() {
                    self.signal.lower(Ready::READABLE);
                }
                return Ok(client);
            }
            if state.closed {
                return Err(PalError::BadHandle);
            }
            self.cond.wait(&mut state);
        }
    }

    fn signal(&self) -> &Signal {
        &self.signal
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        self.close();
    }
}
