// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Readiness signals and the multi-wait primitive.
//!
//! Every handle owns a [`Signal`] that the backend raises when the stream
//! becomes consumable (data buffered, client queued, peer hung up). A
//! multi-wait attaches one shared [`WaitSlot`] to every signal in the set
//! (firing immediately for signals that are already ready, which closes the
//! attach/raise race), then parks until a signal fires or the timeout
//! expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Handle, PalError, Result, Timeout};

bitflags::bitflags! {
    /// Readiness bits tracked per handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Ready: u8 {
        /// A read or accept would make progress.
        const READABLE = 1 << 0;
        /// A write would make progress.
        const WRITABLE = 1 << 1;
        /// The peer endpoint is gone.
        const HUP = 1 << 2;
    }
}

impl Ready {
    /// Bits that wake a multi-wait. Write interest is intentionally not part
    /// of the wake set; writers on this PAL never block.
    fn wakes(self) -> bool {
        self.intersects(Ready::READABLE | Ready::HUP)
    }
}

impl Default for Ready {
    fn default() -> Self {
        Ready::empty()
    }
}

/// Parking slot shared between one waiter and every signal it is attached to.
#[derive(Default)]
pub struct WaitSlot {
    fired: Mutex<SlotState>,
    cond: Condvar,
}

#[derive(Default)]
struct SlotState {
    slot: Option<usize>,
    interrupted: bool,
}

impl WaitSlot {
    fn fire(&self, index: usize) {
        let mut state = self.fired.lock();
        if state.slot.is_none() {
            state.slot = Some(index);
            self.cond.notify_all();
        }
    }

    /// Wakes the waiter with [`PalError::Interrupted`] instead of a slot.
    pub fn interrupt(&self) {
        let mut state = self.fired.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Timeout) -> Result<usize> {
        let mut state = self.fired.lock();
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Zero => {
                return match state.slot {
                    Some(index) => Ok(index),
                    None => Err(PalError::WouldBlock),
                };
            }
            Timeout::After(duration) => Some(Instant::now() + duration),
        };

        loop {
            if state.interrupted {
                return Err(PalError::Interrupted);
            }
            if let Some(index) = state.slot {
                return Ok(index);
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PalError::WouldBlock);
                    }
                    let timed_out = self
                        .cond
                        .wait_for(&mut state, deadline - now)
                        .timed_out();
                    if timed_out && state.slot.is_none() && !state.interrupted {
                        return Err(PalError::WouldBlock);
                    }
                }
            }
        }
    }
}

/// Per-handle readiness state plus the waiters currently attached to it.
#[derive(Default)]
pub struct Signal {
    inner: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    ready: Ready,
    watchers: Vec<(Arc<WaitSlot>, usize)>,
}

impl Signal {
    /// Creates a signal with no readiness asserted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts readiness bits and wakes attached waiters when the wake set
    /// becomes non-empty.
    pub fn raise(&self, bits: Ready) {
        let mut inner = self.inner.lock();
        inner.ready |= bits;
        if bits.wakes() {
            for (slot, index) in &inner.watchers {
                slot.fire(*index);
            }
        }
    }

    /// Clears readiness bits (buffer drained, event consumed).
    pub fn lower(&self, bits: Ready) {
        self.inner.lock().ready -= bits;
    }

    /// Current wake-relevant readiness.
    pub fn is_signaled(&self) -> bool {
        self.inner.lock().ready.wakes()
    }

    fn attach(&self, slot: &Arc<WaitSlot>, index: usize) {
        let mut inner = self.inner.lock();
        inner.watchers.push((Arc::clone(slot), index));
        if inner.ready.wakes() {
            slot.fire(index);
        }
    }

    fn detach(&self, slot: &Arc<WaitSlot>) {
        self.inner
            .lock()
            .watchers
            .retain(|(watcher, _)| !Arc::ptr_eq(watcher, slot));
    }
}

/// Waits for any handle in `handles` to become consumable.
///
/// Returns the index of one signaled handle. An empty set or an expired
/// timeout reports [`PalError::WouldBlock`]; a wakeup with no ready handle
/// reports [`PalError::Interrupted`]. Duplicate handles are permitted; the
/// first occurrence wins.
pub fn wait_any(handles: &[Handle], timeout: Timeout) -> Result<usize> {
    if handles.is_empty() {
        return Err(PalError::WouldBlock);
    }

    let slot = Arc::new(WaitSlot::default());
    for (index, handle) in handles.iter().enumerate() {
        handle.signal().attach(&slot, index);
    }

    let outcome = slot.wait(timeout);

    for handle in handles {
        handle.signal().detach(&slot);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe_pair;
    use crate::Stream as _;
    use std::thread;

    #[test]
    fn empty_set_is_try_again() {
        assert_eq!(wait_any(&[], Timeout::Zero), Err(PalError::WouldBlock));
    }

    #[test]
    fn zero_timeout_poll_reports_ready_handle() {
        let (a, b) = pipe_pair();
        assert_eq!(wait_any(&[a.clone()], Timeout::Zero), Err(PalError::WouldBlock));
        b.write(b"x").unwrap();
        assert_eq!(wait_any(&[a], Timeout::Zero), Ok(0));
    }

    #[test]
    fn wait_wakes_on_write_from_other_thread() {
        let (a, b) = pipe_pair();
        let writer = thread::spawn(move || {
            b.write(b"ping").unwrap();
        });
        let index = wait_any(&[a], Timeout::Infinite).unwrap();
        assert_eq!(index, 0);
        writer.join().unwrap();
    }

    #[test]
    fn hup_wakes_the_waiter() {
        let (a, b) = pipe_pair();
        let closer = thread::spawn(move || b.close());
        assert_eq!(wait_any(&[a.clone()], Timeout::Infinite), Ok(0));
        assert!(a.attr().unwrap().disconnected);
        closer.join().unwrap();
    }

    #[test]
    fn timeout_expires_without_traffic() {
        let (a, _b) = pipe_pair();
        let err = wait_any(&[a], Timeout::After(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err, PalError::WouldBlock);
    }
}
