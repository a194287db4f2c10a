//! Host vnode layer.
//!
//! The host kernel keeps one vnode per published node, reference-counted once
//! the volume is mounted. [`VnodeHost`] is the seam the volume talks to;
//! [`MemoryHost`] is an in-process implementation used by the CLI and tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use ramvol_types::NodeId;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::trace;

use crate::error::{VolError, VolResult};
use crate::node::Node;

/// Host-scoped identity of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeHandle(u64);

impl VolumeHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol{}", self.0)
    }
}

/// The host kernel's vnode layer, keyed by volume handle and node id.
pub trait VnodeHost: Send + Sync {
    /// Create a vnode that path lookups cannot see yet.
    fn new_vnode(&self, volume: VolumeHandle, id: NodeId, node: &Arc<Node>) -> VolResult<()>;

    /// Create (or finish creating) a vnode and make it visible.
    fn publish_vnode(&self, volume: VolumeHandle, id: NodeId, node: &Arc<Node>, mode: u32) -> VolResult<()>;

    /// Take a reference to the vnode for `id`.
    fn get_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<Arc<Node>>;

    /// Drop a reference taken by `get_vnode`, `new_vnode` or `publish_vnode`.
    fn put_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<()>;

    /// Mark the vnode removed; it is reclaimed once unreferenced.
    fn remove_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<()>;

    /// Undo `remove_vnode`.
    fn unremove_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<()>;
}

/// Host operations, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum HostOp {
    NewVnode,
    PublishVnode,
    GetVnode,
    PutVnode,
    RemoveVnode,
    UnremoveVnode,
}

#[derive(Debug)]
struct Vnode {
    node: Arc<Node>,
    refs: u32,
    published: bool,
    removed: bool,
}

/// A vnode layer kept in process memory.
///
/// Vnodes that are removed and unreferenced are queued for reclaim. The
/// filesystem side drains the queue with [`MemoryHost::drain_reclaimable`]
/// and hands each node to `Volume::reclaim_vnode`.
#[derive(Default)]
pub struct MemoryHost {
    vnodes: Mutex<HashMap<(VolumeHandle, NodeId), Vnode>>,
    reclaimable: Mutex<Vec<(VolumeHandle, Arc<Node>)>>,
    failures: Mutex<HashSet<HostOp>>,
    calls: AtomicUsize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with a host error.
    pub fn fail_next(&self, op: HostOp) {
        self.failures.lock().insert(op);
    }

    /// Total trait calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Reference count of a vnode, if it exists.
    pub fn ref_count(&self, volume: VolumeHandle, id: NodeId) -> Option<u32> {
        self.vnodes.lock().get(&(volume, id)).map(|v| v.refs)
    }

    pub fn is_published(&self, volume: VolumeHandle, id: NodeId) -> bool {
        self.vnodes.lock().get(&(volume, id)).is_some_and(|v| v.published)
    }

    pub fn is_removed(&self, volume: VolumeHandle, id: NodeId) -> bool {
        self.vnodes.lock().get(&(volume, id)).is_some_and(|v| v.removed)
    }

    /// Number of live vnodes of `volume`.
    pub fn vnode_count(&self, volume: VolumeHandle) -> usize {
        self.vnodes.lock().keys().filter(|(v, _)| *v == volume).count()
    }

    /// Take the nodes whose vnodes were removed and fully released.
    pub fn drain_reclaimable(&self) -> Vec<(VolumeHandle, Arc<Node>)> {
        std::mem::take(&mut *self.reclaimable.lock())
    }

    /// Forget every vnode of `volume`, as the host does after unmounting it.
    pub fn release_volume(&self, volume: VolumeHandle) -> usize {
        let mut vnodes = self.vnodes.lock();
        let before = vnodes.len();
        vnodes.retain(|(v, _), _| *v != volume);
        self.reclaimable.lock().retain(|(v, _)| *v != volume);
        before - vnodes.len()
    }

    fn enter(&self, op: HostOp, volume: VolumeHandle, id: NodeId) -> VolResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        trace!(%op, %volume, %id, "host call");
        if self.failures.lock().remove(&op) {
            return Err(VolError::host(format!("{op} failed for {id}")));
        }
        Ok(())
    }

    fn insert(&self, volume: VolumeHandle, id: NodeId, node: &Arc<Node>, published: bool) -> VolResult<()> {
        let mut vnodes = self.vnodes.lock();
        match vnodes.get_mut(&(volume, id)) {
            // publishing a vnode created with new_vnode
            Some(v) if published && !v.published && Arc::ptr_eq(&v.node, node) => {
                v.published = true;
                Ok(())
            }
            Some(_) => Err(VolError::already_exists(format!("vnode {id}"))),
            None => {
                vnodes.insert(
                    (volume, id),
                    Vnode {
                        node: node.clone(),
                        refs: 1,
                        published,
                        removed: false,
                    },
                );
                Ok(())
            }
        }
    }

    fn reclaim_if_unused(&self, volume: VolumeHandle, id: NodeId, vnodes: &mut HashMap<(VolumeHandle, NodeId), Vnode>) {
        if vnodes.get(&(volume, id)).is_some_and(|v| v.removed && v.refs == 0) {
            if let Some(v) = vnodes.remove(&(volume, id)) {
                self.reclaimable.lock().push((volume, v.node));
            }
        }
    }
}

impl VnodeHost for MemoryHost {
    fn new_vnode(&self, volume: VolumeHandle, id: NodeId, node: &Arc<Node>) -> VolResult<()> {
        self.enter(HostOp::NewVnode, volume, id)?;
        self.insert(volume, id, node, false)
    }

    fn publish_vnode(&self, volume: VolumeHandle, id: NodeId, node: &Arc<Node>, _mode: u32) -> VolResult<()> {
        self.enter(HostOp::PublishVnode, volume, id)?;
        self.insert(volume, id, node, true)
    }

    fn get_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<Arc<Node>> {
        self.enter(HostOp::GetVnode, volume, id)?;
        let mut vnodes = self.vnodes.lock();
        let vnode = vnodes
            .get_mut(&(volume, id))
            .ok_or_else(|| VolError::not_found(format!("vnode {id}")))?;
        vnode.refs += 1;
        Ok(vnode.node.clone())
    }

    fn put_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<()> {
        self.enter(HostOp::PutVnode, volume, id)?;
        let mut vnodes = self.vnodes.lock();
        let vnode = vnodes
            .get_mut(&(volume, id))
            .ok_or_else(|| VolError::not_found(format!("vnode {id}")))?;
        if vnode.refs == 0 {
            return Err(VolError::bad_value(format!("vnode {id} has no references")));
        }
        vnode.refs -= 1;
        self.reclaim_if_unused(volume, id, &mut vnodes);
        Ok(())
    }

    fn remove_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<()> {
        self.enter(HostOp::RemoveVnode, volume, id)?;
        let mut vnodes = self.vnodes.lock();
        let vnode = vnodes
            .get_mut(&(volume, id))
            .ok_or_else(|| VolError::not_found(format!("vnode {id}")))?;
        vnode.removed = true;
        self.reclaim_if_unused(volume, id, &mut vnodes);
        Ok(())
    }

    fn unremove_vnode(&self, volume: VolumeHandle, id: NodeId) -> VolResult<()> {
        self.enter(HostOp::UnremoveVnode, volume, id)?;
        let mut vnodes = self.vnodes.lock();
        let vnode = vnodes
            .get_mut(&(volume, id))
            .ok_or_else(|| VolError::not_found(format!("vnode {id}")))?;
        vnode.removed = false;
        Ok(())
    }
}

impl fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHost")
            .field("vnodes", &self.vnodes.lock().len())
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}
