// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: IPC wire frames (fixed header, opaque payload).
//!
//! Every frame starts with a 22-byte little-endian header:
//! `code: u16 | size: u32 | src: u32 | dst: u32 | seq: u64`, where `size`
//! covers header plus payload and `seq` is non-zero only for
//! request/response exchanges. Payload layouts beyond `RESP` belong to the
//! individual protocols and are opaque here.

use crate::{IpcError, ProcessId, Result};

/// Bytes in the fixed frame header.
pub const HEADER_LEN: usize = 22;

/// Extra bytes requested per stream read so back-to-back frames drain in
/// few calls.
pub const READ_AHEAD: usize = 4096;

/// Number of entries in the callback table.
pub const CODE_COUNT: usize = 8;

/// Built-in response code: payload is a 4-byte signed return value.
pub const CODE_RESP: u16 = 0;
/// Namespace URI query.
pub const CODE_FINDURI: u16 = 1;
/// Namespace URI answer.
pub const CODE_TELLURI: u16 = 2;
/// Checkpoint hand-off notification.
pub const CODE_CHECKPOINT: u16 = 3;
/// Child exit notification.
pub const CODE_CLD_EXIT: u16 = 4;
/// Child join request.
pub const CODE_CLD_JOIN: u16 = 5;
/// PID-namespace envelope.
pub const CODE_PID_OP: u16 = 6;
/// SYSV-namespace envelope.
pub const CODE_SYSV_OP: u16 = 7;

/// Fixed header of every IPC frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub code: u16,
    pub size: u32,
    pub src: ProcessId,
    pub dst: ProcessId,
    pub seq: u64,
}

impl MsgHeader {
    /// Appends the `HEADER_LEN` header bytes to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.src.value().to_le_bytes());
        out.extend_from_slice(&self.dst.value().to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
    }

    /// Parses a header from the first `HEADER_LEN` bytes of `bytes`.
    ///
    /// Rejects frames whose declared size cannot even hold the header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(IpcError::Malformed);
        }
        let code = u16::from_le_bytes([bytes[0], bytes[1]]);
        let size = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let src = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let dst = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        let seq = u64::from_le_bytes([
            bytes[14], bytes[15], bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21],
        ]);
        if (size as usize) < HEADER_LEN {
            return Err(IpcError::Malformed);
        }
        Ok(Self {
            code,
            size,
            src: ProcessId::new(src),
            dst: ProcessId::new(dst),
            seq,
        })
    }
}

/// A framed message: fixed header plus owned payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// One-way message (`seq = 0`).
    pub fn new(code: u16, src: ProcessId, dst: ProcessId, payload: Vec<u8>) -> Self {
        Self::request(code, src, dst, 0, payload)
    }

    /// Request message carrying an explicit sequence number.
    pub fn request(code: u16, src: ProcessId, dst: ProcessId, seq: u64, payload: Vec<u8>) -> Self {
        let size = (HEADER_LEN + payload.len()) as u32;
        Self {
            header: MsgHeader { code, size, src, dst, seq },
            payload,
        }
    }

    /// Built-in `RESP` message answering sequence `seq` with `retval`.
    pub fn resp(retval: i32, src: ProcessId, dst: ProcessId, seq: u64) -> Self {
        Self::request(CODE_RESP, src, dst, seq, retval.to_le_bytes().to_vec())
    }

    /// Return value of a `RESP` frame, when this is one.
    pub fn retval(&self) -> Option<i32> {
        if self.header.code != CODE_RESP || self.payload.len() < 4 {
            return None;
        }
        Some(i32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Serializes header plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.size as usize);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}
