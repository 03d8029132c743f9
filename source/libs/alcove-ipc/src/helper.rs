// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The IPC helper: one thread multiplexing reads over all ports.
//!
//! The helper owns a local array of watched ports (one strong reference
//! each) mirrored by the handle array passed to the multi-wait; slot 0 is
//! the wakeup event. Registry changes become visible either through the
//! event or, when the helper itself mutates the registry, through the
//! dirty flag read after each dispatch, so every change is observed before
//! the next multi-wait. Each watched entry carries the observed view of
//! the port's roles and peer, refreshed from the port's pending view only
//! during reconfiguration under the registry lock.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use alcove_pal::{wait_any, Event, Handle, PalError, Stream as _, Timeout};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::dispatch::RecvMode;
use crate::port::{Port, RoleSet};
use crate::registry::IpcFabric;
use crate::{errno, IpcError, ProcessId, Result};

/// Lifecycle of the helper thread (process-wide atomic).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperState {
    /// Fabric exists; `init_helper` has not run yet.
    Uninitialized = 0,
    /// A restart was requested before init; creation is deferred.
    Delayed = 1,
    /// No helper thread is running.
    NotAlive = 2,
    /// The helper thread is multiplexing.
    Alive = 3,
    /// The process wants to exit but keepalive ports remain.
    HandedOver = 4,
}

impl HelperState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Delayed,
            2 => Self::NotAlive,
            3 => Self::Alive,
            _ => Self::HandedOver,
        }
    }
}

/// Helper-side shared state hanging off the fabric.
pub(crate) struct HelperShared {
    state: AtomicU8,
    /// Pending watched-set change noticed by the helper itself.
    pub(crate) dirty: AtomicBool,
    /// Wakeup event occupying slot 0 of the helper's wait set.
    pub(crate) event: Event,
    thread: Mutex<Option<JoinHandle<()>>>,
    tid: Mutex<Option<ThreadId>>,
}

impl HelperShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(HelperState::Uninitialized as u8),
            dirty: AtomicBool::new(false),
            event: Event::new(),
            thread: Mutex::new(None),
            tid: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> HelperState {
        HelperState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: HelperState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn swap_state(&self, state: HelperState) -> HelperState {
        HelperState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    fn in_helper(&self) -> bool {
        self.tid
            .lock()
            .as_ref()
            .is_some_and(|tid| *tid == thread::current().id())
    }
}

/// A watched port plus the helper's observed view of it.
struct WatchedPort {
    port: Arc<Port>,
    view: PortView,
}

/// Snapshot of (roles, peer) the helper works from between reconfigures.
#[derive(Clone, Copy)]
struct PortView {
    roles: RoleSet,
    peer: ProcessId,
}

impl IpcFabric {
    /// Current helper state.
    pub fn helper_state(&self) -> HelperState {
        self.helper.state()
    }

    /// Requests that the helper pick up a changed watched set, creating the
    /// thread when `need_create` and none is running.
    pub fn request_restart(self: &Arc<Self>, need_create: bool) {
        match self.helper.state() {
            HelperState::Uninitialized => self.helper.set_state(HelperState::Delayed),
            HelperState::Delayed => {}
            HelperState::NotAlive => {
                if need_create {
                    if let Err(err) = self.create_helper() {
                        warn!("helper restart failed: {err}");
                    }
                }
            }
            HelperState::Alive => {
                if self.helper.in_helper() {
                    self.helper.dirty.store(true, Ordering::Release);
                } else {
                    debug!("signaling ipc helper restart");
                    self.helper.event.set();
                }
            }
            HelperState::HandedOver => self.helper.dirty.store(true, Ordering::Release),
        }
    }

    /// Finishes deferred initialization and honors a `Delayed` request.
    pub fn init_helper(self: &Arc<Self>) -> Result<()> {
        let deferred = self.helper.state() == HelperState::Delayed;
        self.helper.set_state(HelperState::NotAlive);
        if deferred {
            self.create_helper()?;
        }
        Ok(())
    }

    /// Starts the helper thread; a second caller observes `Alive` and
    /// returns without spawning.
    pub fn create_helper(self: &Arc<Self>) -> Result<()> {
        if self.helper.state() == HelperState::Alive {
            return Ok(());
        }
        {
            let _reg = self.registry.lock();
            if self.helper.state() == HelperState::Alive {
                return Ok(());
            }
            self.helper.set_state(HelperState::Alive);
        }

        let fabric = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("ipc-helper".into())
            .spawn(move || helper_main(fabric));
        match spawned {
            Ok(handle) => {
                *self.helper.thread.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                warn!("failed to start ipc helper: {err}");
                self.helper.set_state(HelperState::NotAlive);
                Err(IpcError::Pal(PalError::NoMem))
            }
        }
    }

    /// Process-exit hook: hands the process over to the helper when any
    /// keepalive port survives. Returns true when handed over.
    pub fn exit_with_helper(self: &Arc<Self>, handover: bool) -> bool {
        if self.helper.in_helper() || self.helper.state() != HelperState::Alive {
            return false;
        }
        let handover = handover && {
            let reg = self.registry.lock();
            reg.order
                .iter()
                .any(|port| port.roles().intersects(RoleSet::KEEPALIVE))
        };
        if handover {
            info!("handing process over to ipc helper");
            self.helper.set_state(HelperState::HandedOver);
        } else {
            info!("stopping ipc helper at exit");
            self.helper.set_state(HelperState::NotAlive);
        }
        self.helper.event.set();
        handover
    }

    /// Forces the helper to exit regardless of keepalive ports.
    pub fn terminate_helper(&self) -> Result<()> {
        match self.helper.state() {
            HelperState::Alive | HelperState::HandedOver => {
                info!("terminating ipc helper");
                self.helper.set_state(HelperState::NotAlive);
                self.helper.event.set();
                Ok(())
            }
            _ => Err(IpcError::NoSuchProcess),
        }
    }

    /// Blocks until the helper thread exits. No-op from the helper itself.
    pub fn join_helper(&self) {
        if self.helper.in_helper() {
            return;
        }
        let handle = self.helper.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn helper_main(fabric: Arc<IpcFabric>) {
    *fabric.helper.tid.lock() = Some(thread::current().id());
    info!("ipc helper thread started");

    let mut watched: Vec<WatchedPort> = Vec::new();
    let mut handles: Vec<Handle> = vec![fabric.helper.event.handle()];
    let mut keepalive = 0usize;

    reconfigure(&fabric, &mut watched, &mut handles, &mut keepalive);

    loop {
        let state = fabric.helper.state();
        if state != HelperState::Alive && keepalive == 0 {
            break;
        }

        let polled = match wait_any(&handles, Timeout::Infinite) {
            Ok(slot) => slot,
            Err(PalError::Interrupted) | Err(PalError::WouldBlock) => continue,
            Err(err) => {
                warn!("helper multi-wait failed: {err}");
                continue;
            }
        };

        let need_reconfigure = if polled == 0 {
            fabric.helper.event.clear();
            if fabric.helper.state() == HelperState::NotAlive {
                break;
            }
            true
        } else {
            let entry = &watched[polled - 1];
            let port = Arc::clone(&entry.port);
            let view = entry.view;

            if view.roles.contains(RoleSet::SERVER) {
                serve_accept(&fabric, &port, view);
                true
            } else {
                serve_port(&fabric, &port, view)
            }
        };

        if need_reconfigure {
            reconfigure(&fabric, &mut watched, &mut handles, &mut keepalive);
        }
    }

    watched.clear();
    handles.clear();

    let previous = fabric.helper.swap_state(HelperState::NotAlive);
    *fabric.helper.tid.lock() = None;
    if previous == HelperState::HandedOver {
        info!("ipc helper was the last duty; invoking shutdown");
        let hook = fabric.shutdown.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
    info!("ipc helper thread terminated");
}

/// Accepts one client on a server port, admitting it with the server's
/// peer id and the `LISTEN` role.
fn serve_accept(fabric: &Arc<IpcFabric>, port: &Arc<Port>, view: PortView) {
    let accepted = port
        .handle()
        .and_then(|handle| handle.accept().map_err(IpcError::from));
    match accepted {
        Ok(client) => {
            let roles = (view.roles - RoleSet::SERVER) | RoleSet::LISTEN;
            fabric.admit_by_handle(view.peer, client, roles, None);
        }
        Err(err) => {
            debug!("server port removed at accepting ({err})");
            fabric.teardown_port(port, -errno::ECHILD);
        }
    }
}

/// Queries and drains one non-server port. Returns whether the watched set
/// needs refreshing.
fn serve_port(fabric: &Arc<IpcFabric>, port: &Arc<Port>, _view: PortView) -> bool {
    let attr = port
        .handle()
        .and_then(|handle| handle.attr().map_err(IpcError::from));
    let attr = match attr {
        Ok(attr) => attr,
        Err(err) => {
            debug!("port removed at querying ({err})");
            let code = match err {
                IpcError::Pal(pal) => errno::from_pal(pal),
                _ => errno::EBADF,
            };
            fabric.teardown_port(port, -code);
            return true;
        }
    };

    if attr.readable {
        // Errors tear the port down inside the receive routine.
        let _ = fabric.receive_on_port(port, RecvMode::Dispatch);
    }
    if attr.disconnected {
        debug!("port disconnected");
        fabric.teardown_port(port, -errno::ECONNRESET);
        return true;
    }
    fabric.helper.dirty.load(Ordering::Acquire)
}

/// Synchronizes the helper's watched array with the registry.
fn reconfigure(
    fabric: &Arc<IpcFabric>,
    watched: &mut Vec<WatchedPort>,
    handles: &mut Vec<Handle>,
    keepalive: &mut usize,
) {
    fabric.helper.dirty.store(false, Ordering::Release);
    let reg = fabric.registry.lock();

    // Drop entries whose list membership is gone, then refresh dirty views
    // and shed entries that stopped being pollable.
    watched.retain_mut(|entry| {
        let mut meta = entry.port.meta();
        if !meta.in_list {
            if entry.view.roles.intersects(RoleSet::KEEPALIVE) {
                *keepalive = keepalive.saturating_sub(1);
            }
            debug!("helper dropping port for process {}", entry.view.peer);
            return false;
        }
        if meta.dirty {
            let had_keepalive = entry.view.roles.intersects(RoleSet::KEEPALIVE);
            let has_keepalive = meta.roles.intersects(RoleSet::KEEPALIVE);
            match (had_keepalive, has_keepalive) {
                (true, false) => *keepalive = keepalive.saturating_sub(1),
                (false, true) => *keepalive += 1,
                _ => {}
            }
            entry.view = PortView {
                roles: meta.roles,
                peer: meta.peer,
            };
            meta.dirty = false;
        }
        if !entry.view.roles.intersects(RoleSet::IFPOLL) {
            if entry.view.roles.intersects(RoleSet::KEEPALIVE) {
                *keepalive = keepalive.saturating_sub(1);
            }
            return false;
        }
        true
    });

    // Pick up newly pollable ports from the head of the insertion list.
    let mut fresh: Vec<WatchedPort> = Vec::new();
    for port in reg.order.iter() {
        let mut meta = port.meta();
        if !meta.recent {
            break;
        }
        meta.recent = false;
        meta.dirty = false;
        let view = PortView {
            roles: meta.roles,
            peer: meta.peer,
        };
        drop(meta);
        debug_assert!(view.roles.intersects(RoleSet::IFPOLL));

        if watched.iter().any(|entry| Arc::ptr_eq(&entry.port, port)) {
            continue;
        }
        if view.roles.intersects(RoleSet::KEEPALIVE) {
            *keepalive += 1;
        }
        debug!(
            "helper listening to process {} (roles {:?})",
            view.peer, view.roles
        );
        fresh.push(WatchedPort {
            port: Arc::clone(port),
            view,
        });
    }
    watched.extend(fresh);
    drop(reg);

    handles.truncate(1);
    watched.retain(|entry| match entry.port.handle() {
        Ok(handle) => {
            handles.push(handle);
            true
        }
        Err(_) => {
            if entry.view.roles.intersects(RoleSet::KEEPALIVE) {
                *keepalive = keepalive.saturating_sub(1);
            }
            false
        }
    });
}
