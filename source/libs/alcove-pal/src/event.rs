// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Event objects with eventfd-like semantics.
//!
//! An event wraps a counter behind a stream handle so it can sit in the same
//! multi-wait set as ordinary byte streams. The handle is readable iff the
//! event is set; reading drains the counter and clears readiness.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::poll::{Ready, Signal};
use crate::{Handle, PalError, Result, Stream, StreamAttr, Timeout};

/// Set/clear/wait object whose handle participates in [`crate::wait_any`].
pub struct Event {
    stream: Arc<EventStream>,
}

impl Event {
    /// Creates an unset event.
    pub fn new() -> Self {
        Self { stream: Arc::new(EventStream::default()) }
    }

    /// Sets the event, waking any waiter polling its handle.
    pub fn set(&self) {
        let mut count = self.stream.count.lock();
        *count = count.saturating_add(1);
        self.stream.signal.raise(Ready::READABLE);
    }

    /// Clears the event.
    pub fn clear(&self) {
        let mut count = self.stream.count.lock();
        *count = 0;
        self.stream.signal.lower(Ready::READABLE);
    }

    /// Blocks until the event is set (or the timeout expires).
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        crate::wait_any(&[self.handle()], timeout).map(|_| ())
    }

    /// The pollable handle backing this event.
    pub fn handle(&self) -> Handle {
        Arc::clone(&self.stream) as Handle
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct EventStream {
    count: Mutex<u64>,
    signal: Signal,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl Stream for EventStream {
    /// Drains the counter into an 8-byte little-endian value.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 8 {
            return Err(PalError::Invalid);
        }
        let mut count = self.count.lock();
        if *count == 0 {
            return Err(PalError::WouldBlock);
        }
        buf[..8].copy_from_slice(&count.to_le_bytes());
        *count = 0;
        self.signal.lower(Ready::READABLE);
        Ok(8)
    }

    /// Adds an 8-byte little-endian value to the counter.
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() < 8 {
            return Err(PalError::Invalid);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        let mut count = self.count.lock();
        *count = count.saturating_add(u64::from_le_bytes(bytes));
        if *count > 0 {
            self.signal.raise(Ready::READABLE);
        }
        Ok(8)
    }

    fn close(&self) {}

    fn attr(&self) -> Result<StreamAttr> {
        let count = self.count.lock();
        Ok(StreamAttr {
            readable: *count > 0,
            writable: true,
            disconnected: false,
            pending_size: if *count > 0 { 8 } else { 0 },
        })
    }

    fn signal(&self) -> &Signal {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_makes_handle_readable() {
        let event = Event::new();
        assert!(!event.handle().attr().unwrap().readable);
        event.set();
        assert!(event.handle().attr().unwrap().readable);
        assert_eq!(crate::wait_any(&[event.handle()], Timeout::Zero), Ok(0));
    }

    #[test]
    fn clear_removes_readiness() {
        let event = Event::new();
        event.set();
        event.clear();
        assert_eq!(
            crate::wait_any(&[event.handle()], Timeout::Zero),
            Err(PalError::WouldBlock)
        );
    }

    #[test]
    fn read_drains_the_counter() {
        let event = Event::new();
        event.set();
        event.set();
        let handle = event.handle();
        let mut buf = [0u8; 8];
        assert_eq!(handle.read(&mut buf), Ok(8));
        assert_eq!(u64::from_le_bytes(buf), 2);
        assert_eq!(handle.read(&mut buf), Err(PalError::WouldBlock));
    }
}
