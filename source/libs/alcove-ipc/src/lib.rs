// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: IPC port manager and helper loop of the library OS runtime.
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + `tests/fabric.rs` + `tests/properties.rs`
//!
//! Every process owns one [`IpcFabric`]: the set of live ports (one per
//! byte stream to a parent, child, or namespace leader), a single helper
//! thread multiplexing reads over all pollable ports, framed-message
//! dispatch to registered callbacks, request/response correlation, and
//! broadcast routing.
//!
//! PUBLIC API:
//!   - `IpcFabric`: registry + helper + callback table + broadcast router
//!   - `Port`: reference-counted binding of one stream plus routing metadata
//!   - `Message`/`MsgHeader`: framed wire records
//!   - `ProcessLinks`: seed description consumed by `init_ports`

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use std::fmt;

use alcove_pal::PalError;

pub mod dispatch;
pub mod helper;
pub mod message;
pub mod port;
pub mod registry;

pub use dispatch::{Callback, CallbackOutcome, RecvMode};
pub use helper::HelperState;
pub use message::{Message, MsgHeader, CODE_COUNT, HEADER_LEN};
pub use port::{FiniCallback, Port, ResultSlot, RoleSet, MAX_FINI};
pub use registry::{IpcFabric, ProcessLink, ProcessLinks};

/// Result type returned by IPC operations.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors surfaced by the port manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    /// The port was torn down while the operation was in flight.
    #[error("connection reset")]
    ConnectionReset,
    /// No port is registered for the requested peer.
    #[error("no such process")]
    NoSuchProcess,
    /// An incoming frame violated the header invariants.
    #[error("malformed frame")]
    Malformed,
    /// Callback code outside the fixed table.
    #[error("unknown message code")]
    UnknownCode,
    /// Error reported by the stream provider.
    #[error(transparent)]
    Pal(#[from] PalError),
}

/// 32-bit identifier of a process participating in the IPC fabric.
///
/// Zero means "unknown or broadcast" and never appears in the peer index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The unknown/broadcast id.
    pub const UNKNOWN: ProcessId = ProcessId(0);

    /// Wraps a raw id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// True for the zero id.
    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errno-like codes carried in teardown exit codes and `RESP` payloads.
pub mod errno {
    use alcove_pal::PalError;

    pub const EINTR: i32 = 4;
    pub const EBADF: i32 = 9;
    pub const ECHILD: i32 = 10;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTCONN: i32 = 107;

    /// Maps a PAL error to the errno carried in exit codes.
    pub fn from_pal(err: PalError) -> i32 {
        match err {
            PalError::WouldBlock => EAGAIN,
            PalError::Interrupted => EINTR,
            PalError::Disconnected => ECONNRESET,
            PalError::BadHandle => EBADF,
            PalError::NotConnection => ENOTCONN,
            PalError::Unsupported => ENOSYS,
            PalError::Invalid => EINVAL,
            PalError::Denied => EACCES,
            PalError::NoMem => ENOMEM,
            PalError::Io(code) => code,
        }
    }
}
