// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Platform abstraction layer consumed by the library OS runtime.
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + `tests/streams.rs`
//!
//! PUBLIC API:
//!   - `Stream` trait: polymorphic byte-stream handle (read/write/close/attr/accept)
//!   - `wait_any`: multi-wait over a set of handles with optional timeout
//!   - `Event`: set/clear/wait object whose handle participates in multi-wait
//!   - `open`/`listen`/`connect`/`pipe_pair`: URI-based host byte streams
//!   - `PalError`: error kinds every backend must distinguish

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use std::sync::Arc;
use std::time::Duration;

pub mod event;
pub mod pipe;
pub mod poll;

pub use event::Event;
pub use pipe::{connect, listen, open, pipe_pair};
pub use poll::{wait_any, Ready, Signal};

/// Result type returned by PAL operations.
pub type Result<T> = core::result::Result<T, PalError>;

/// Errors surfaced by the stream provider.
///
/// Callers depend on four distinctions: `WouldBlock` (no data yet on a
/// non-blocking handle, or an empty/timed-out poll), `Interrupted`
/// (signal-like wakeup), `Disconnected` (peer gone), and everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PalError {
    /// Operation could not progress without blocking, or a wait timed out.
    #[error("operation would block")]
    WouldBlock,
    /// A wait was interrupted before any handle became ready.
    #[error("wait interrupted")]
    Interrupted,
    /// The peer side of the stream is gone.
    #[error("stream disconnected")]
    Disconnected,
    /// The handle was already closed.
    #[error("bad handle")]
    BadHandle,
    /// No stream is listening at the target address.
    #[error("not a connection")]
    NotConnection,
    /// The operation is not supported by this stream type.
    #[error("operation not supported")]
    Unsupported,
    /// Malformed argument (bad URI, zero-length buffer where data is required).
    #[error("invalid argument")]
    Invalid,
    /// The address is owned by another listener.
    #[error("access denied")]
    Denied,
    /// Allocation failed.
    #[error("out of memory")]
    NoMem,
    /// Generic I/O failure with an errno-like code.
    #[error("i/o error ({0})")]
    Io(i32),
}

/// Snapshot of a stream's externally observable state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamAttr {
    /// At least one byte (or one queued client) can be consumed without blocking.
    pub readable: bool,
    /// The peer still accepts writes.
    pub writable: bool,
    /// The peer endpoint is gone; buffered bytes may still be readable.
    pub disconnected: bool,
    /// Bytes currently buffered for reading.
    pub pending_size: usize,
}

/// Owning reference to a polymorphic stream.
pub type Handle = Arc<dyn Stream>;

/// A bidirectional byte channel identified by an opaque handle.
///
/// `read` may suspend; every other operation is non-suspending except
/// `accept`, which blocks for the next queued client. All operations on a
/// closed handle report [`PalError::BadHandle`]; `close` itself is
/// idempotent.
pub trait Stream: Send + Sync + std::fmt::Debug {
    /// Reads up to `buf.len()` bytes, blocking until at least one byte is
    /// available or the peer disconnects with the buffer drained.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole buffer, failing with `Disconnected` once the peer
    /// closed its reading side.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Releases the underlying channel. Subsequent calls are no-ops.
    fn close(&self);

    /// Queries the stream's current attributes.
    fn attr(&self) -> Result<StreamAttr>;

    /// Accepts the next queued client on a server stream.
    fn accept(&self) -> Result<Handle> {
        Err(PalError::Unsupported)
    }

    /// Readiness signal consumed by [`wait_any`].
    fn signal(&self) -> &Signal;
}

/// Wait bound accepted by [`wait_any`] and [`Event::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Block until a handle is ready.
    Infinite,
    /// Poll once and return immediately.
    Zero,
    /// Block for at most this long.
    After(Duration),
}
