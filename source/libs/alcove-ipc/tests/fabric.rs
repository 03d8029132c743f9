// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end tests for the port manager and helper loop.
//! TEST_SCOPE:
//!   - Helper pickup and callback dispatch for admitted ports
//!   - Duplex request/response correlation and teardown completion
//!   - Server accept, broadcast fan-out, and handover shutdown
//!
//! All scenarios run over the in-memory host streams of `alcove-pal`; the
//! helper thread is real, so assertions that depend on it poll with a
//! bounded retry loop instead of sleeping blindly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use alcove_ipc::message::{CODE_CLD_EXIT, CODE_FINDURI};
use alcove_ipc::{
    errno, CallbackOutcome, HelperState, IpcFabric, Message, MsgHeader, Port, ProcessId, RoleSet,
};
use alcove_pal::{listen, open, pipe_pair, Stream as _};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `pred` every few milliseconds for up to two seconds.
fn eventually(mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn helper_dispatches_message_on_admitted_port() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

    let (tx, rx) = mpsc::channel();
    fabric
        .register_callback(
            CODE_FINDURI,
            Arc::new(move |msg, _port| {
                tx.send(msg.header.src).unwrap();
                CallbackOutcome::Value(0)
            }),
        )
        .unwrap();

    let (ours, theirs) = pipe_pair();
    fabric.admit_by_handle(ProcessId::new(7), ours, RoleSet::LISTEN, None);

    // A 32-byte frame: fixed header plus ten payload bytes.
    let msg = Message::new(
        CODE_FINDURI,
        ProcessId::new(7),
        ProcessId::new(1),
        vec![0xAB; 10],
    );
    assert_eq!(msg.encode().len(), 32);
    theirs.write(&msg.encode()).unwrap();

    let src = rx.recv_timeout(Duration::from_secs(2)).expect("dispatch");
    assert_eq!(src, ProcessId::new(7));
}

#[test]
fn duplex_request_completes_with_peer_retval() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

    let (ours, theirs) = pipe_pair();
    let port = fabric.admit_by_handle(ProcessId::new(9), ours, RoleSet::LISTEN, None);

    // The peer answers our request with IPC_RESP(retval = -2).
    let peer = thread::spawn(move || {
        let mut raw = vec![0u8; 256];
        let n = theirs.read(&mut raw).unwrap();
        let header = MsgHeader::decode(&raw[..n]).unwrap();
        assert_eq!(header.seq, 0x1234);
        let resp = Message::resp(-2, ProcessId::new(9), ProcessId::new(1), header.seq);
        theirs.write(&resp.encode()).unwrap();
    });

    let request = Message::request(
        CODE_FINDURI,
        ProcessId::new(1),
        ProcessId::new(9),
        0x1234,
        b"where".to_vec(),
    );
    let retval = fabric.send_request(&port, request).unwrap();
    assert_eq!(retval, -2);
    assert_eq!(port.pending_len(), 0);
    peer.join().unwrap();
}

#[test]
fn disconnect_completes_pending_and_releases_port() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

    let (ours, theirs) = pipe_pair();
    let port = fabric.admit_by_handle(ProcessId::new(5), ours, RoleSet::LISTEN, None);
    let weak = Arc::downgrade(&port);

    let waiter = {
        let fabric = Arc::clone(&fabric);
        let port = Arc::clone(&port);
        thread::spawn(move || {
            let request = Message::request(
                CODE_FINDURI,
                ProcessId::new(1),
                ProcessId::new(5),
                0xABCD,
                Vec::new(),
            );
            fabric.send_request(&port, request)
        })
    };

    // Wait for the request to land, then vanish without replying.
    let mut raw = vec![0u8; 256];
    theirs.read(&mut raw).unwrap();
    theirs.close();

    assert_eq!(waiter.join().unwrap().unwrap(), -errno::ECONNRESET);
    assert_eq!(port.pending_len(), 0);

    // Registry and helper drop their references; ours is the last one.
    drop(port);
    assert!(eventually(|| weak.upgrade().is_none()));
}

#[test]
fn server_port_accepts_clients_with_listen_role() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    fabric
        .register_callback(
            CODE_FINDURI,
            Arc::new(move |_msg, port| {
                assert!(port.roles().contains(RoleSet::LISTEN));
                counter.fetch_add(1, Ordering::SeqCst);
                CallbackOutcome::Value(0)
            }),
        )
        .unwrap();

    let server = listen("fabric_accept_two").unwrap();
    fabric.admit_by_handle(ProcessId::UNKNOWN, server, RoleSet::SERVER, None);

    let mut clients = Vec::new();
    for peer in [21u32, 22] {
        let client = open("pipe:fabric_accept_two").unwrap();
        let msg = Message::new(
            CODE_FINDURI,
            ProcessId::new(peer),
            ProcessId::new(1),
            Vec::new(),
        );
        client.write(&msg.encode()).unwrap();
        clients.push(client);
    }

    assert!(eventually(|| hits.load(Ordering::SeqCst) == 2));

    // Server plus two accepted LISTEN ports.
    let mut ports = 0;
    fabric.for_each(&[], RoleSet::empty(), |_port| ports += 1);
    assert_eq!(ports, 3);
}

#[test]
fn broadcast_honors_roles_and_exclusion() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));

    let mut peers = Vec::new();
    let mut ports: Vec<Arc<Port>> = Vec::new();
    for id in [31u32, 32, 33] {
        let (ours, theirs) = pipe_pair();
        let port = fabric.admit_by_handle(ProcessId::new(id), ours, RoleSet::DIRPRT, None);
        peers.push((id, theirs));
        ports.push(port);
    }
    // A port outside the target role must never receive a copy.
    let (pid_ours, pid_theirs) = pipe_pair();
    fabric.admit_by_handle(ProcessId::new(34), pid_ours, RoleSet::PIDLDR, None);

    let excluded = ports[2].clone();
    let mut msg = Message::new(
        CODE_CLD_EXIT,
        ProcessId::new(1),
        ProcessId::UNKNOWN,
        vec![7, 7],
    );
    fabric
        .broadcast(&mut msg, &[excluded], RoleSet::DIRPRT)
        .unwrap();

    for (id, theirs) in &peers[..2] {
        let mut raw = vec![0u8; 64];
        let n = theirs.read(&mut raw).unwrap();
        let header = MsgHeader::decode(&raw[..n]).unwrap();
        assert_eq!(header.dst, ProcessId::new(*id));
        assert_eq!(header.size as usize, n);
        // Exactly one copy each.
        assert_eq!(theirs.attr().unwrap().pending_size, 0);
    }
    assert_eq!(peers[2].1.attr().unwrap().pending_size, 0);
    assert_eq!(pid_theirs.attr().unwrap().pending_size, 0);
}

#[test]
fn handover_runs_shutdown_exactly_once() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

    let (tx, rx) = mpsc::channel();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    fabric.set_shutdown_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.send(()).unwrap();
    });

    let (ours, theirs) = pipe_pair();
    let port = fabric.admit_by_handle(
        ProcessId::new(40),
        ours,
        RoleSet::DIRPRT | RoleSet::LISTEN,
        None,
    );
    assert!(port.roles().intersects(RoleSet::KEEPALIVE));
    assert!(eventually(|| fabric.helper_state() == HelperState::Alive));

    assert!(fabric.exit_with_helper(true));
    assert_eq!(fabric.helper_state(), HelperState::HandedOver);

    // The keepalive peer goes away; the helper finalizes and shuts down.
    theirs.close();
    rx.recv_timeout(Duration::from_secs(2)).expect("shutdown");
    fabric.join_helper();
    assert_eq!(fabric.helper_state(), HelperState::NotAlive);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn helper_watched_set_follows_registry() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

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
    let port = fabric.admit_by_handle(ProcessId::new(9), ours, RoleSet::LISTEN, None);

    let msg = Message::new(
        CODE_FINDURI,
        ProcessId::new(9),
        ProcessId::new(1),
        Vec::new(),
    );
    theirs.write(&msg.encode()).unwrap();
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));

    // Evicting the only role removes the port; the helper lets go of its
    // reference at the next reconfiguration.
    fabric.evict(&port, RoleSet::LISTEN);
    assert!(eventually(|| Arc::strong_count(&port) == 1));

    theirs.write(&msg.encode()).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn exit_without_keepalive_ports_stops_the_helper() {
    init_logging();
    let fabric = IpcFabric::new(ProcessId::new(1));
    fabric.init_helper().unwrap();

    let (ours, _theirs) = pipe_pair();
    fabric.admit_by_handle(ProcessId::new(2), ours, RoleSet::LISTEN, None);
    assert!(eventually(|| fabric.helper_state() == HelperState::Alive));

    assert!(!fabric.exit_with_helper(true));
    fabric.join_helper();
    assert_eq!(fabric.helper_state(), HelperState::NotAlive);
}
