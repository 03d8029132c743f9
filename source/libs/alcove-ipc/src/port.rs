// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The port object: one stream plus routing metadata.
//!
//! A port binds exactly one stream handle for its lifetime and is shared
//! through `Arc`; every registry membership holds one clone, so the strong
//! count mirrors the reference-counting contract of the registry. Routing
//! metadata lives behind the `meta` lock, which is only taken for mutation
//! while the registry lock is held (lock order: registry, then meta). The
//! pending-request list has its own lock and may be taken without the
//! registry lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alcove_pal::{Handle, PalError, Stream as _};
use log::warn;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::message::Message;
use crate::{IpcError, ProcessId, Result};

/// Upper bound on on-close hooks per port.
pub const MAX_FINI: usize = 3;

bitflags::bitflags! {
    /// Role bits describing how a port participates in the fabric.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RoleSet: u16 {
        /// Our own server stream; the helper accepts clients on it.
        const SERVER = 1 << 0;
        /// Established connection the helper reads messages from.
        const LISTEN = 1 << 1;
        /// Direct connection to a child process.
        const DIRCLD = 1 << 2;
        /// Direct connection to the parent process.
        const DIRPRT = 1 << 3;
        /// Connection to the PID-namespace leader.
        const PIDLDR = 1 << 4;
        /// Connection to the SYSV-namespace leader.
        const SYSVLDR = 1 << 5;

        /// Ports the helper loop watches.
        const IFPOLL = Self::SERVER.bits() | Self::LISTEN.bits();
        /// Ports whose existence keeps the process alive through handover.
        const KEEPALIVE = Self::DIRCLD.bits() | Self::DIRPRT.bits();
    }
}

/// On-close hook: `(port, peer, exit_code)`.
pub type FiniCallback = Arc<dyn Fn(&Arc<Port>, ProcessId, i32) + Send + Sync>;

/// Routing metadata; the pending view observed by the registry.
///
/// Mutated only while the registry lock is held. Reads from other contexts
/// take the meta lock briefly on its own, which is safe because the lock
/// order is always registry before meta.
pub struct PortMeta {
    pub peer: ProcessId,
    pub roles: RoleSet,
    pub fini: Vec<FiniCallback>,
    /// Present in the peer-id hash index.
    pub in_index: bool,
    /// Present in the insertion-order list.
    pub in_list: bool,
    /// Newly pollable; the helper picks these up from the list head.
    pub recent: bool,
    /// Pending view diverged from the helper's observed view.
    pub dirty: bool,
}

/// Reference-counted record wrapping one stream plus routing metadata.
pub struct Port {
    handle: Mutex<Option<Handle>>,
    pub(crate) meta: Mutex<PortMeta>,
    pending: Mutex<Vec<PendingRequest>>,
    /// Set by teardown; requests attached afterwards complete immediately
    /// with connection-reset instead of waiting forever.
    reset: AtomicBool,
    /// Serializes framed reads; the receive routine is reentrant per handle
    /// but never concurrent on the same handle.
    pub(crate) recv_lock: Mutex<()>,
}

impl Port {
    /// Wraps a stream handle into a fresh, unregistered port.
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(Some(handle)),
            meta: Mutex::new(PortMeta {
                peer: ProcessId::UNKNOWN,
                roles: RoleSet::empty(),
                fini: Vec::new(),
                in_index: false,
                in_list: false,
                recent: false,
                dirty: true,
            }),
            pending: Mutex::new(Vec::new()),
            reset: AtomicBool::new(false),
            recv_lock: Mutex::new(()),
        })
    }

    /// The stream handle, while the port is still live.
    pub fn handle(&self) -> Result<Handle> {
        self.handle
            .lock()
            .clone()
            .ok_or(IpcError::Pal(PalError::BadHandle))
    }

    /// True when two ports wrap the same stream.
    pub(crate) fn wraps(&self, other: &Handle) -> bool {
        match self.handle.lock().as_ref() {
            Some(handle) => Arc::ptr_eq(handle, other),
            None => false,
        }
    }

    /// Closes the stream; runs exactly once.
    fn close_handle(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.close();
        }
    }

    /// Peer process id snapshot.
    pub fn peer(&self) -> ProcessId {
        self.meta.lock().peer
    }

    /// Role snapshot.
    pub fn roles(&self) -> RoleSet {
        self.meta.lock().roles
    }

    /// True while the port sits in the peer-id index.
    pub fn in_peer_index(&self) -> bool {
        self.meta.lock().in_index
    }

    /// True while the port sits in the insertion-order list.
    pub fn in_insertion_list(&self) -> bool {
        self.meta.lock().in_list
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, PortMeta> {
        self.meta.lock()
    }

    /// Writes a whole frame to the stream.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.encode();
        let handle = self.handle()?;
        let mut written = 0;
        while written < bytes.len() {
            written += handle.write(&bytes[written..])?;
        }
        Ok(())
    }

    /// Registers an outstanding duplex request and returns its result slot.
    pub fn attach_pending(&self, seq: u64) -> Arc<ResultSlot> {
        let slot = Arc::new(ResultSlot::default());
        self.pending.lock().push(PendingRequest {
            seq,
            slot: Arc::clone(&slot),
        });
        if self.reset.load(Ordering::Acquire) {
            if let Some(stale) = self.detach_pending(seq) {
                stale.complete(-crate::errno::ECONNRESET);
            }
        }
        slot
    }

    /// Removes the pending record for `seq`, if any.
    pub fn detach_pending(&self, seq: u64) -> Option<Arc<ResultSlot>> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|req| req.seq == seq)?;
        Some(pending.swap_remove(index).slot)
    }

    /// Number of outstanding duplex requests.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Marks the port torn down for late [`Self::attach_pending`] callers.
    pub(crate) fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Completes every outstanding request with `retval` (port teardown).
    pub fn complete_all_pending(&self, retval: i32) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain(..).collect();
        for req in drained {
            req.slot.complete(retval);
        }
    }

    /// Appends a fini hook under the registry lock; idempotent, capped.
    pub(crate) fn install_fini_locked(meta: &mut PortMeta, fini: &FiniCallback) {
        if meta.fini.iter().any(|cb| Arc::ptr_eq(cb, fini)) {
            return;
        }
        if meta.fini.len() >= MAX_FINI {
            warn!("port fini list full; dropping extra hook");
            return;
        }
        meta.fini.push(Arc::clone(fini));
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // Final release: memberships are gone, close the stream.
        self.close_handle();
    }
}

/// One outstanding duplex request awaiting its `RESP`.
struct PendingRequest {
    seq: u64,
    slot: Arc<ResultSlot>,
}

/// Result cell a requesting thread parks on.
#[derive(Default)]
pub struct ResultSlot {
    state: Mutex<Option<i32>>,
    cond: Condvar,
}

impl ResultSlot {
    /// Stores the return value and wakes the waiter. First writer wins.
    pub fn complete(&self, retval: i32) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(retval);
            self.cond.notify_all();
        }
    }

    /// Blocks until the slot is completed.
    pub fn wait(&self) -> i32 {
        let mut state = self.state.lock();
        loop {
            if let Some(retval) = *state {
                return retval;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Non-blocking read of the result.
    pub fn peek(&self) -> Option<i32> {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alcove_pal::{pipe_pair, Stream as _};
    use std::thread;

    #[test]
    fn ifpoll_covers_server_and_listen() {
        assert!(RoleSet::SERVER.intersects(RoleSet::IFPOLL));
        assert!(RoleSet::LISTEN.intersects(RoleSet::IFPOLL));
        assert!(!RoleSet::PIDLDR.intersects(RoleSet::IFPOLL));
        assert!(RoleSet::DIRPRT.intersects(RoleSet::KEEPALIVE));
    }

    #[test]
    fn pending_attach_detach() {
        let (a, _b) = pipe_pair();
        let port = Port::new(a);
        let slot = port.attach_pending(42);
        assert_eq!(port.pending_len(), 1);

        let detached = port.detach_pending(42).expect("pending present");
        assert!(Arc::ptr_eq(&slot, &detached));
        assert_eq!(port.pending_len(), 0);
        assert!(port.detach_pending(42).is_none());
    }

    #[test]
    fn complete_all_wakes_waiters() {
        let (a, _b) = pipe_pair();
        let port = Port::new(a);
        let slot = port.attach_pending(7);

        let waiter = thread::spawn(move || slot.wait());
        port.complete_all_pending(-104);
        assert_eq!(waiter.join().unwrap(), -104);
        assert_eq!(port.pending_len(), 0);
    }

    #[test]
    fn result_slot_first_completion_wins() {
        let slot = ResultSlot::default();
        slot.complete(1);
        slot.complete(2);
        assert_eq!(slot.wait(), 1);
    }

    #[test]
    fn handle_cleared_after_drop_side_effects() {
        let (a, b) = pipe_pair();
        let port = Port::new(a);
        assert!(port.handle().is_ok());
        drop(port);
        // The peer observes the hangup exactly once.
        assert!(b.attr().unwrap().disconnected);
    }
}
