// Copyright 2025 Alcove OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The port registry and the process-wide IPC fabric.
//!
//! Two collections cover the same port set: a fixed-bucket hash index keyed
//! by peer id (a port is present iff its peer is known and it has been
//! admitted) and an insertion-order list of every admitted port, with
//! newly pollable ports kept at the head so the helper can stop scanning at
//! the first non-recent entry. Each membership holds one strong reference.
//! All registry state is mutated under a single lock; the per-port meta
//! lock is only taken while that lock is held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alcove_pal::Handle;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::dispatch::CallbackTable;
use crate::errno;
use crate::helper::HelperShared;
use crate::message::Message;
use crate::port::{FiniCallback, Port, RoleSet};
use crate::{ProcessId, Result};

/// Buckets in the peer-id index; peers hash by their low bits.
pub const PEER_BUCKETS: usize = 64;

pub(crate) struct RegistryState {
    buckets: Vec<Vec<Arc<Port>>>,
    pub(crate) order: VecDeque<Arc<Port>>,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            buckets: (0..PEER_BUCKETS).map(|_| Vec::new()).collect(),
            order: VecDeque::new(),
        }
    }

    fn bucket_of(peer: ProcessId) -> usize {
        (peer.value() as usize) & (PEER_BUCKETS - 1)
    }

    fn remove_from_order(&mut self, port: &Arc<Port>) {
        if let Some(index) = self.order.iter().position(|p| Arc::ptr_eq(p, port)) {
            self.order.remove(index);
        }
    }

    fn remove_from_bucket(&mut self, peer: ProcessId, port: &Arc<Port>) {
        let bucket = &mut self.buckets[Self::bucket_of(peer)];
        if let Some(index) = bucket.iter().position(|p| Arc::ptr_eq(p, port)) {
            bucket.swap_remove(index);
        }
    }
}

/// Process-wide IPC state: port registry, helper, callbacks, broadcast.
pub struct IpcFabric {
    self_id: ProcessId,
    pub(crate) registry: Mutex<RegistryState>,
    pub(crate) callbacks: CallbackTable,
    pub(crate) helper: HelperShared,
    pub(crate) shutdown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    broadcast: Mutex<Option<Arc<Port>>>,
    seq: AtomicU64,
}

/// One seed connection consumed by [`IpcFabric::init_ports`].
pub struct ProcessLink {
    /// Peer process id (the fabric's own id for the server port).
    pub id: ProcessId,
    /// URI to reconnect from when no live handle was inherited.
    pub uri: Option<String>,
    /// Inherited stream handle, when one exists.
    pub handle: Option<Handle>,
}

/// Seed description of a process's place in the IPC fabric.
#[derive(Default)]
pub struct ProcessLinks {
    /// Our own server port.
    pub server: Option<ProcessLink>,
    /// Connection to the parent process.
    pub parent: Option<ProcessLink>,
    /// Connection to the PID-namespace leader.
    pub pid_leader: Option<ProcessLink>,
    /// Connection to the SYSV-namespace leader.
    pub sysv_leader: Option<ProcessLink>,
    /// Dedicated broadcast stream, when the platform provides one.
    pub broadcast: Option<Handle>,
}

impl IpcFabric {
    /// Creates the fabric for a process with the given id.
    pub fn new(self_id: ProcessId) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            registry: Mutex::new(RegistryState::new()),
            callbacks: CallbackTable::new(),
            helper: HelperShared::new(),
            shutdown: Mutex::new(None),
            broadcast: Mutex::new(None),
            seq: AtomicU64::new(1),
        })
    }

    /// The owning process id.
    pub fn self_id(&self) -> ProcessId {
        self.self_id
    }

    /// Installs the hook the helper invokes when it finalizes a handover.
    pub fn set_shutdown_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.shutdown.lock() = Some(Box::new(hook));
    }

    /// Allocates a fresh non-zero duplex sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The dedicated broadcast port, when one is registered.
    pub fn broadcast_port(&self) -> Option<Arc<Port>> {
        self.broadcast.lock().clone()
    }

    /// Admits a stream into the registry, reusing an existing port that
    /// already wraps the same handle.
    pub fn admit_by_handle(
        self: &Arc<Self>,
        peer: ProcessId,
        handle: Handle,
        roles: RoleSet,
        fini: Option<FiniCallback>,
    ) -> Arc<Port> {
        debug!("adding port for process {peer} (roles {roles:?})");
        let (port, need_restart) = {
            let mut reg = self.registry.lock();

            let mut port = None;
            if !peer.is_unknown() {
                port = reg.buckets[RegistryState::bucket_of(peer)]
                    .iter()
                    .find(|p| p.peer() == peer && p.wraps(&handle))
                    .cloned();
            }
            if port.is_none() {
                port = reg.order.iter().find(|p| p.wraps(&handle)).cloned();
            }
            let port = port.unwrap_or_else(|| Port::new(handle));
            let need_restart = Self::admit_locked(&mut reg, &port, peer, roles, fini.as_ref());
            (port, need_restart)
        };
        if need_restart {
            self.request_restart(true);
        }
        port
    }

    /// Admits an existing port (same contract as [`Self::admit_by_handle`]).
    pub fn admit(
        self: &Arc<Self>,
        port: &Arc<Port>,
        peer: ProcessId,
        roles: RoleSet,
        fini: Option<FiniCallback>,
    ) {
        let need_restart = {
            let mut reg = self.registry.lock();
            Self::admit_locked(&mut reg, port, peer, roles, fini.as_ref())
        };
        if need_restart {
            self.request_restart(true);
        }
    }

    fn admit_locked(
        reg: &mut RegistryState,
        port: &Arc<Port>,
        peer: ProcessId,
        roles: RoleSet,
        fini: Option<&FiniCallback>,
    ) -> bool {
        let mut meta = port.meta();

        if !peer.is_unknown() && meta.peer.is_unknown() {
            meta.peer = peer;
            meta.dirty = true;
        }
        if !meta.peer.is_unknown() && !meta.in_index {
            let bucket = RegistryState::bucket_of(meta.peer);
            reg.buckets[bucket].push(Arc::clone(port));
            meta.in_index = true;
        }

        let newly_pollable =
            roles.intersects(RoleSet::IFPOLL) && !meta.roles.intersects(RoleSet::IFPOLL);
        let newly_keepalive =
            roles.intersects(RoleSet::KEEPALIVE) && !meta.roles.intersects(RoleSet::KEEPALIVE);
        if !meta.roles.contains(roles) {
            meta.roles |= roles;
            meta.dirty = true;
        }

        if let Some(fini) = fini {
            Port::install_fini_locked(&mut meta, fini);
        }

        if newly_pollable {
            if meta.in_list {
                if !meta.recent {
                    reg.remove_from_order(port);
                    reg.order.push_front(Arc::clone(port));
                }
            } else {
                reg.order.push_front(Arc::clone(port));
                meta.in_list = true;
            }
            meta.recent = true;
            true
        } else {
            if !meta.in_list {
                reg.order.push_back(Arc::clone(port));
                meta.in_list = true;
                meta.recent = false;
            }
            newly_keepalive
        }
    }

    /// Appends an on-close hook to a port; idempotent, capped at
    /// [`crate::MAX_FINI`].
    pub fn install_fini(&self, port: &Arc<Port>, fini: FiniCallback) {
        let _reg = self.registry.lock();
        let mut meta = port.meta();
        Port::install_fini_locked(&mut meta, &fini);
    }

    /// Clears roles from a port, removing it from the registry once no
    /// role outside the poll/keepalive masks remains.
    pub fn evict(self: &Arc<Self>, port: &Arc<Port>, roles: RoleSet) {
        let need_update = {
            let mut reg = self.registry.lock();
            Self::evict_locked(&mut reg, port, roles)
        };
        if need_update {
            self.request_restart(false);
        }
    }

    fn evict_locked(reg: &mut RegistryState, port: &Arc<Port>, roles: RoleSet) -> bool {
        let mut meta = port.meta();
        let clear = if roles.is_empty() { meta.roles } else { roles & meta.roles };
        let need_update = clear.intersects(RoleSet::IFPOLL | RoleSet::KEEPALIVE);

        let remaining = meta.roles - clear - RoleSet::IFPOLL - RoleSet::KEEPALIVE;
        if !remaining.is_empty() {
            debug!(
                "masking port for process {} (roles {:?} -> {:?})",
                meta.peer,
                meta.roles,
                meta.roles - clear
            );
            meta.roles -= clear;
            meta.dirty = true;
            return need_update;
        }

        debug!("deleting port for process {} (roles {clear:?})", meta.peer);
        meta.roles -= clear;
        if meta.in_list {
            reg.remove_from_order(port);
            meta.in_list = false;
            meta.recent = false;
        }
        if meta.in_index {
            reg.remove_from_bucket(meta.peer, port);
            meta.in_index = false;
        }
        meta.dirty = true;
        need_update
    }

    /// Evicts every port bound to `peer` carrying any of `roles`.
    pub fn evict_by_peer(self: &Arc<Self>, peer: ProcessId, roles: RoleSet) {
        let need_update = {
            let mut reg = self.registry.lock();
            let ports: Vec<Arc<Port>> = reg.buckets[RegistryState::bucket_of(peer)]
                .iter()
                .filter(|p| p.peer() == peer)
                .cloned()
                .collect();
            let mut need = false;
            for port in &ports {
                need |= Self::evict_locked(&mut reg, port, roles);
            }
            need
        };
        if need_update {
            self.request_restart(false);
        }
    }

    /// Evicts `roles` from every admitted port.
    pub fn evict_all(self: &Arc<Self>, roles: RoleSet) {
        let need_update = {
            let mut reg = self.registry.lock();
            let ports: Vec<Arc<Port>> = reg.order.iter().cloned().collect();
            let mut need = false;
            for port in &ports {
                need |= Self::evict_locked(&mut reg, port, roles);
            }
            need
        };
        if need_update {
            self.request_restart(false);
        }
    }

    /// First port in `peer`'s bucket whose roles intersect `roles` (any
    /// port when `roles` is empty), with one additional reference.
    pub fn lookup(&self, peer: ProcessId, roles: RoleSet) -> Option<Arc<Port>> {
        let reg = self.registry.lock();
        reg.buckets[RegistryState::bucket_of(peer)]
            .iter()
            .find(|p| {
                let meta = p.meta();
                meta.peer == peer && (roles.is_empty() || meta.roles.intersects(roles))
            })
            .cloned()
    }

    /// Visits a snapshot of the admitted ports matching `roles` (all ports
    /// when `roles` is empty), skipping `exclude`.
    pub fn for_each<F: FnMut(&Arc<Port>)>(
        &self,
        exclude: &[Arc<Port>],
        roles: RoleSet,
        mut visit: F,
    ) {
        let snapshot: Vec<Arc<Port>> = {
            let reg = self.registry.lock();
            reg.order
                .iter()
                .filter(|p| roles.is_empty() || p.roles().intersects(roles))
                .filter(|p| !exclude.iter().any(|ex| Arc::ptr_eq(ex, p)))
                .cloned()
                .collect()
        };
        for port in &snapshot {
            visit(port);
        }
    }

    /// Tears a port down: evicts both memberships, runs the fini hooks
    /// exactly once, and completes outstanding requests with
    /// connection-reset. The stream closes when the last reference drops.
    pub fn teardown_port(self: &Arc<Self>, port: &Arc<Port>, exit_code: i32) {
        let (hooks, peer, need_update) = {
            let mut reg = self.registry.lock();
            let (hooks, peer) = {
                let mut meta = port.meta();
                (std::mem::take(&mut meta.fini), meta.peer)
            };
            let need_update = Self::evict_locked(&mut reg, port, RoleSet::empty());
            (hooks, peer, need_update)
        };

        for hook in &hooks {
            (**hook)(port, peer, exit_code);
        }
        port.mark_reset();
        port.complete_all_pending(-errno::ECONNRESET);

        if need_update {
            self.request_restart(false);
        }
    }

    /// Sends `msg` to a set of recipients: the dedicated broadcast stream
    /// when `target` is empty and one exists, otherwise every admitted port
    /// whose roles intersect `target`. Per-recipient failures are logged
    /// and do not abort the fan-out.
    pub fn broadcast(
        &self,
        msg: &mut Message,
        exclude: &[Arc<Port>],
        target: RoleSet,
    ) -> Result<()> {
        if target.is_empty() {
            if let Some(bport) = self.broadcast_port() {
                if exclude.iter().any(|ex| Arc::ptr_eq(ex, &bport)) {
                    return Ok(());
                }
                debug!("send to broadcast stream");
                msg.header.dst = ProcessId::UNKNOWN;
                match bport.send(msg) {
                    Ok(()) => return Ok(()),
                    Err(err) => warn!("broadcast stream send failed: {err}"),
                }
            }
        }

        let recipients: Vec<Arc<Port>> = {
            let reg = self.registry.lock();
            reg.order
                .iter()
                .filter(|p| p.roles().intersects(target))
                .filter(|p| !exclude.iter().any(|ex| Arc::ptr_eq(ex, p)))
                .cloned()
                .collect()
        };
        for port in &recipients {
            let dst = port.peer();
            msg.header.dst = dst;
            debug!("broadcast to process {dst}");
            if let Err(err) = port.send(msg) {
                warn!("broadcast to process {dst} failed: {err}");
            }
        }
        Ok(())
    }

    /// Seeds the registry with the process's standing connections.
    pub fn init_ports(self: &Arc<Self>, links: ProcessLinks) -> Result<()> {
        if let Some(link) = links.server {
            self.seed_port(link, RoleSet::SERVER)?;
        }
        if let Some(link) = links.parent {
            self.seed_port(link, RoleSet::DIRPRT | RoleSet::LISTEN)?;
        }
        if let Some(link) = links.pid_leader {
            self.seed_port(link, RoleSet::PIDLDR | RoleSet::LISTEN)?;
        }
        if let Some(link) = links.sysv_leader {
            self.seed_port(link, RoleSet::SYSVLDR | RoleSet::LISTEN)?;
        }
        if let Some(handle) = links.broadcast {
            let weak = Arc::downgrade(self);
            let fini: FiniCallback = Arc::new(move |port, _peer, _code| {
                if let Some(fabric) = weak.upgrade() {
                    let mut slot = fabric.broadcast.lock();
                    if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, port)) {
                        *slot = None;
                    }
                }
            });
            let port =
                self.admit_by_handle(ProcessId::UNKNOWN, handle, RoleSet::LISTEN, Some(fini));
            *self.broadcast.lock() = Some(port);
        }
        Ok(())
    }

    fn seed_port(self: &Arc<Self>, link: ProcessLink, roles: RoleSet) -> Result<()> {
        let handle = match link.handle {
            Some(handle) => handle,
            None => match &link.uri {
                Some(uri) => {
                    debug!("reconnecting port {uri}");
                    alcove_pal::open(uri)?
                }
                None => return Ok(()),
            },
        };
        let peer = if link.id == self.self_id {
            ProcessId::UNKNOWN
        } else {
            link.id
        };
        self.admit_by_handle(peer, handle, roles, None);
        Ok(())
    }
}
