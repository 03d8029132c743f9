// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for the port registry invariants.
//! TEST_SCOPE:
//!   - Strong references mirror registry memberships across op sequences
//!   - Outstanding requests complete exactly once (response or teardown)
//!   - Self-originated frames never reach callbacks
//!   - Broadcast never delivers to excluded or off-role ports
//!
//! The helper thread stays out of these tests: operations run on the
//! calling thread so reference counts are deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alcove_ipc::message::{CODE_CLD_EXIT, CODE_FINDURI};
use alcove_ipc::{
    errno, CallbackOutcome, IpcFabric, Message, MsgHeader, Port, ProcessId, RecvMode, RoleSet,
};
use alcove_pal::{pipe_pair, Handle, Stream as _};
use proptest::prelude::*;

fn role_bits() -> impl Strategy<Value = RoleSet> {
    (0u16..64).prop_map(RoleSet::from_bits_truncate)
}

proptest! {
    /// Strong references equal caller-held references plus one per
    /// registry membership, for any admit/evict sequence.
    #[test]
    fn refcount_matches_memberships(
        ops in proptest::collection::vec((any::<bool>(), role_bits()), 0..24)
    ) {
        let fabric = IpcFabric::new(ProcessId::new(1));
        let (ours, _peer) = pipe_pair();
        let port = fabric.admit_by_handle(ProcessId::new(7), ours, RoleSet::LISTEN, None);

        for (is_admit, roles) in ops {
            if is_admit {
                fabric.admit(&port, ProcessId::new(7), roles, None);
            } else {
                fabric.evict(&port, roles);
            }
            let memberships =
                usize::from(port.in_peer_index()) + usize::from(port.in_insertion_list());
            prop_assert_eq!(Arc::strong_count(&port), 1 + memberships);
        }
    }

    /// Exactly one of {response arrival, port teardown} completes a
    /// pending request, in either order.
    #[test]
    fn request_completes_exactly_once(
        resp_first in any::<bool>(),
        retval in -1000i32..1000,
        seq in 1u64..u64::MAX,
    ) {
        let fabric = IpcFabric::new(ProcessId::new(1));
        let (ours, theirs) = pipe_pair();
        let port = fabric.admit_by_handle(ProcessId::new(9), ours, RoleSet::LISTEN, None);

        let slot = port.attach_pending(seq);
        let resp = Message::resp(retval, ProcessId::new(9), ProcessId::new(1), seq);

        if resp_first {
            theirs.write(&resp.encode()).unwrap();
            fabric.receive_on_port(&port, RecvMode::Dispatch).unwrap();
            prop_assert_eq!(slot.peek(), Some(retval));

            // A later teardown must not overwrite the result.
            fabric.teardown_port(&port, -errno::ECONNRESET);
            prop_assert_eq!(slot.peek(), Some(retval));
        } else {
            fabric.teardown_port(&port, -errno::ECONNRESET);
            prop_assert_eq!(slot.peek(), Some(-errno::ECONNRESET));

            // The late response is an orphan and changes nothing.
            theirs.write(&resp.encode()).unwrap();
            fabric.receive_on_port(&port, RecvMode::Dispatch).unwrap();
            prop_assert_eq!(slot.peek(), Some(-errno::ECONNRESET));
        }
        prop_assert_eq!(port.pending_len(), 0);
    }

    /// Frames whose source is the local process are broadcast echoes and
    /// never reach a callback.
    #[test]
    fn self_echoes_never_dispatch(srcs in proptest::collection::vec(0u32..4, 1..10)) {
        let fabric = IpcFabric::new(ProcessId::new(1));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        fabric
            .register_callback(
                CODE_FINDURI,
                Arc::new(move |_msg, _port| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    CallbackOutcome::Value(0)
                }),
            )
            .unwrap();

        let (ours, theirs) = pipe_pair();
        let port = fabric.admit_by_handle(ProcessId::new(7), ours, RoleSet::LISTEN, None);

        let mut bytes = Vec::new();
        for src in &srcs {
            let msg = Message::new(
                CODE_FINDURI,
                ProcessId::new(*src),
                ProcessId::new(1),
                Vec::new(),
            );
            bytes.extend_from_slice(&msg.encode());
        }
        theirs.write(&bytes).unwrap();
        fabric.receive_on_port(&port, RecvMode::Dispatch).unwrap();

        let expected = srcs.iter().filter(|src| **src != 1).count();
        prop_assert_eq!(hits.load(Ordering::SeqCst), expected);
    }

    /// Broadcast with an exclusion list delivers exactly one copy to every
    /// matching port except the excluded ones, and none elsewhere.
    #[test]
    fn broadcast_never_hits_excluded(
        excluded in proptest::collection::vec(any::<bool>(), 3),
    ) {
        let fabric = IpcFabric::new(ProcessId::new(1));

        let mut ports: Vec<Arc<Port>> = Vec::new();
        let mut peers: Vec<(u32, Handle)> = Vec::new();
        for id in [51u32, 52, 53] {
            let (ours, theirs) = pipe_pair();
            let port = fabric.admit_by_handle(ProcessId::new(id), ours, RoleSet::DIRPRT, None);
            ports.push(port);
            peers.push((id, theirs));
        }
        let (off_role_ours, off_role_theirs) = pipe_pair();
        fabric.admit_by_handle(ProcessId::new(60), off_role_ours, RoleSet::PIDLDR, None);

        let exclude: Vec<Arc<Port>> = ports
            .iter()
            .zip(&excluded)
            .filter(|(_, ex)| **ex)
            .map(|(port, _)| Arc::clone(port))
            .collect();

        let mut msg = Message::new(
            CODE_CLD_EXIT,
            ProcessId::new(1),
            ProcessId::UNKNOWN,
            vec![1, 2, 3],
        );
        fabric.broadcast(&mut msg, &exclude, RoleSet::DIRPRT).unwrap();

        for ((id, theirs), was_excluded) in peers.iter().zip(&excluded) {
            let pending = theirs.attr().unwrap().pending_size;
            if *was_excluded {
                prop_assert_eq!(pending, 0);
            } else {
                let mut raw = vec![0u8; 64];
                let n = theirs.read(&mut raw).unwrap();
                let header = MsgHeader::decode(&raw[..n]).unwrap();
                prop_assert_eq!(header.dst, ProcessId::new(*id));
                prop_assert_eq!(theirs.attr().unwrap().pending_size, 0);
            }
        }
        prop_assert_eq!(off_role_theirs.attr().unwrap().pending_size, 0);
    }
}

#[test]
fn sequence_numbers_are_unique_and_non_zero() {
    let fabric = IpcFabric::new(ProcessId::new(1));
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        let seq = fabric.next_seq();
        assert_ne!(seq, 0);
        assert!(seen.insert(seq));
    }
}
