//! The volume orchestrator.
//!
//! A [`Volume`] owns everything a mount needs: the node and entry tables,
//! the index directory, the root directory (and through it the whole
//! hierarchy), the listener registries and the live query list.
//!
//! # Locking
//!
//! The hierarchy sits behind one reader/writer lock. Structural changes go
//! through a [`VolumeWriter`] from [`Volume::write_lock`]; lookups go through
//! [`Volume::read_lock`]. Listener and query state have their own recursive
//! locks, taken after the hierarchy lock, never before it.
//!
//! # Notification
//!
//! Every mutator commits its table change first and only then notifies, on
//! the calling thread, before returning. A failed change notifies nobody.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use ramvol_types::{
    EntryId, EntryListenFlags, IdCounter, MAX_NAME_LENGTH, NodeId, NodeListenFlags, TypeCode,
};
use serde::Serialize;
use strum::{Display, EnumIter};
use tracing::{debug, error, trace, warn};

use crate::config::{DEFAULT_VOLUME_NAME, VolumeConfig, check_volume_name};
use crate::entry::Entry;
use crate::error::{VolError, VolResult};
use crate::host::{VnodeHost, VolumeHandle};
use crate::index::{AttributeIndex, Index, IndexDirectory, NameIndex, NodeValueIndex};
use crate::listener::{EntryListenerHandle, EntryListenerRegistry, NodeListenerHandle, NodeListenerRegistry};
use crate::lock::{RecursiveGuard, RecursiveLock, VolumeLock, VolumeReadGuard, VolumeWriteGuard};
use crate::node::{Attribute, Node};
use crate::query::{LiveUpdate, QueryHandle, QueryRegistry};
use crate::table::{DirectoryEntryTable, NodeTable};

/// Allocation steps of [`Volume::mount`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum MountStep {
    NodeListeners,
    EntryListeners,
    NodeTable,
    EntryTable,
    IndexDirectory,
    RootDirectory,
}

/// The structures that exist only while mounted.
#[derive(Debug, Default)]
pub struct Hierarchy {
    nodes: Option<NodeTable>,
    entries: Option<DirectoryEntryTable>,
    indices: Option<IndexDirectory>,
    root: Option<Arc<Node>>,
}

impl Hierarchy {
    fn nodes_mut(&mut self) -> VolResult<&mut NodeTable> {
        self.nodes.as_mut().ok_or(VolError::NotMounted)
    }

    fn entries_mut(&mut self) -> VolResult<&mut DirectoryEntryTable> {
        self.entries.as_mut().ok_or(VolError::NotMounted)
    }

    pub fn root(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    /// Look up a node by id.
    pub fn find_node(&self, id: NodeId) -> VolResult<Arc<Node>> {
        self.nodes
            .as_ref()
            .ok_or(VolError::NotMounted)?
            .get_node(id)
            .ok_or_else(|| VolError::not_found(format!("node {id}")))
    }

    /// Look up the entry `name` in directory `dir`.
    pub fn find_entry(&self, dir: NodeId, name: &str) -> VolResult<Arc<Entry>> {
        self.entries
            .as_ref()
            .ok_or(VolError::NotMounted)?
            .get_entry(dir, name)
            .ok_or_else(|| VolError::not_found(format!("{dir}/{name}")))
    }

    pub fn index_directory(&self) -> VolResult<&IndexDirectory> {
        self.indices.as_ref().ok_or(VolError::NotMounted)
    }

    pub fn find_index(&self, name: &str) -> Option<Arc<dyn Index>> {
        self.indices.as_ref()?.find_index(name)
    }

    pub fn find_attribute_index(&self, name: &str, type_code: TypeCode) -> Option<Arc<AttributeIndex>> {
        self.indices.as_ref()?.find_attribute_index(name, type_code)
    }

    pub fn name_index(&self) -> Option<&Arc<NameIndex>> {
        self.indices.as_ref().map(IndexDirectory::name_index)
    }

    pub fn last_modified_index(&self) -> Option<&Arc<NodeValueIndex>> {
        self.indices.as_ref().map(IndexDirectory::last_modified_index)
    }

    pub fn size_index(&self) -> Option<&Arc<NodeValueIndex>> {
        self.indices.as_ref().map(IndexDirectory::size_index)
    }

    /// Re-index a node whose modification time changed.
    fn touch_indexed(&self, node: &Node) {
        if let Some(indices) = &self.indices {
            indices.last_modified_index().update(node);
        }
    }
}

#[derive(Debug, Default)]
struct Listeners {
    nodes: NodeListenerRegistry,
    entries: EntryListenerRegistry,
}

/// Memory accounting for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationInfo {
    pub nodes: usize,
    pub entries: usize,
    pub attributes: usize,
    pub attribute_bytes: usize,
    /// Entry names plus the volume name.
    pub name_bytes: usize,
    /// Approximate bytes held by the node and entry tables.
    pub table_bytes: usize,
}

/// A snapshot of volume-level figures.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStats {
    pub name: String,
    pub mounted: bool,
    pub root: Option<NodeId>,
    pub block_size: u32,
    pub blocks: u64,
    pub free_blocks: u64,
    pub node_listeners: usize,
    pub entry_listeners: usize,
    pub queries: usize,
    pub allocation: Option<AllocationInfo>,
}

/// An in-memory volume.
pub struct Volume {
    handle: VolumeHandle,
    host: Arc<dyn VnodeHost>,
    config: VolumeConfig,
    name: RwLock<String>,
    mounted: AtomicBool,
    node_ids: IdCounter,
    entry_ids: IdCounter,
    hierarchy: VolumeLock<Hierarchy>,
    listeners: RecursiveLock<RefCell<Listeners>>,
    queries: RecursiveLock<RefCell<QueryRegistry>>,
    iterators: RecursiveLock<()>,
    attribute_iterators: RecursiveLock<()>,
    #[cfg(any(test, feature = "test-mock"))]
    mount_fault: parking_lot::Mutex<Option<MountStep>>,
}

impl Volume {
    /// Create an unmounted volume known to `host` as `handle`.
    ///
    /// A config name that [`Volume::set_name`] would refuse is replaced by
    /// [`DEFAULT_VOLUME_NAME`].
    pub fn new(handle: VolumeHandle, host: Arc<dyn VnodeHost>, config: VolumeConfig) -> Self {
        let name = match check_volume_name(&config.name) {
            Ok(()) => config.name.clone(),
            Err(err) => {
                warn!(volume = %handle, %err, "using default volume name");
                DEFAULT_VOLUME_NAME.to_string()
            }
        };
        Self {
            handle,
            host,
            name: RwLock::new(name),
            config,
            mounted: AtomicBool::new(false),
            node_ids: IdCounter::above(ramvol_types::ROOT_PARENT_ID.raw()),
            entry_ids: IdCounter::above(0),
            hierarchy: VolumeLock::new("ramfs volume", Hierarchy::default()),
            listeners: RecursiveLock::new(RefCell::new(Listeners::default())),
            queries: RecursiveLock::new(RefCell::new(QueryRegistry::new())),
            iterators: RecursiveLock::new(()),
            attribute_iterators: RecursiveLock::new(()),
            #[cfg(any(test, feature = "test-mock"))]
            mount_fault: parking_lot::Mutex::new(None),
        }
    }

    pub fn handle(&self) -> VolumeHandle {
        self.handle
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Issue a fresh node id. Ids are never reused for the life of the volume.
    pub fn next_node_id(&self) -> NodeId {
        NodeId::from_raw(self.node_ids.issue())
    }

    fn next_entry_id(&self) -> EntryId {
        EntryId::from_raw(self.entry_ids.issue())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mount the volume.
    ///
    /// Any previous mount is torn down first. On failure everything built so
    /// far is torn down again and the result is [`VolError::NoMemory`].
    #[tracing::instrument(name = "volume.mount", skip(self), fields(volume = %self.handle))]
    pub fn mount(&self, flags: u32) -> VolResult<()> {
        let mut writer = self.write_lock();
        self.mounted.store(false, Ordering::SeqCst);
        self.teardown(&mut writer.hierarchy);

        if let Err(err) = self.build(&mut writer) {
            warn!(%err, "mount failed, tearing down");
            self.teardown(&mut writer.hierarchy);
            return Err(VolError::NoMemory);
        }
        // the flag only changes under the writer
        self.mounted.store(true, Ordering::SeqCst);
        debug!(root = ?writer.root().map(|r| r.id()), "mounted");
        Ok(())
    }

    fn build(&self, writer: &mut VolumeWriter<'_>) -> VolResult<()> {
        self.check_fault(MountStep::NodeListeners)?;
        self.listeners.lock().borrow_mut().nodes.install();

        self.check_fault(MountStep::EntryListeners)?;
        self.listeners.lock().borrow_mut().entries.install();

        self.check_fault(MountStep::NodeTable)?;
        writer.hierarchy.nodes = Some(NodeTable::with_capacity(self.config.node_table_capacity)?);

        self.check_fault(MountStep::EntryTable)?;
        writer.hierarchy.entries = Some(DirectoryEntryTable::with_capacity(self.config.entry_table_capacity)?);

        self.check_fault(MountStep::IndexDirectory)?;
        let indices = writer.hierarchy.indices.insert(IndexDirectory::new());
        {
            let listeners = self.listeners.lock();
            let mut listeners = listeners.borrow_mut();
            listeners
                .entries
                .add(indices.entry_listener(), None, EntryListenFlags::ANY_ENTRY | EntryListenFlags::ALL)?;
            for listener in indices.node_listeners() {
                listeners
                    .nodes
                    .add(listener, None, NodeListenFlags::ANY_NODE | NodeListenFlags::ALL)?;
            }
        }

        self.check_fault(MountStep::RootDirectory)?;
        let root = Node::new_directory(self.next_node_id(), self.config.root_mode);
        writer.publish_vnode(&root)?;
        writer.hierarchy.root = Some(root);
        Ok(())
    }

    /// Tear the mount down. Always succeeds and is safe to repeat.
    pub fn unmount(&self) {
        let mut hierarchy = self.hierarchy.write();
        self.mounted.store(false, Ordering::SeqCst);
        self.teardown(&mut hierarchy);
    }

    fn teardown(&self, hierarchy: &mut Hierarchy) {
        if let Some(root) = hierarchy.root.take() {
            debug!(volume = %self.handle, root = %root.id(), "unmounting");
            root.dismantle();
        }
        if let Some(indices) = hierarchy.indices.take() {
            let listeners = self.listeners.lock();
            let mut listeners = listeners.borrow_mut();
            // missing registrations mean mount failed halfway
            let _ = listeners.entries.remove(indices.entry_listener(), None);
            for listener in indices.node_listeners() {
                let _ = listeners.nodes.remove(listener, None);
            }
        }
        {
            let listeners = self.listeners.lock();
            let mut listeners = listeners.borrow_mut();
            listeners.nodes.teardown();
            listeners.entries.teardown();
        }
        hierarchy.nodes = None;
        hierarchy.entries = None;
    }

    /// Arrange for the next mount to fail at `step`.
    #[cfg(any(test, feature = "test-mock"))]
    pub fn fail_mount_at(&self, step: MountStep) {
        *self.mount_fault.lock() = Some(step);
    }

    #[cfg(any(test, feature = "test-mock"))]
    fn check_fault(&self, step: MountStep) -> VolResult<()> {
        if self.mount_fault.lock().take_if(|s| *s == step).is_some() {
            debug!(%step, "injected mount failure");
            return Err(VolError::NoMemory);
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "test-mock")))]
    fn check_fault(&self, _step: MountStep) -> VolResult<()> {
        Ok(())
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// Shared access to the hierarchy.
    pub fn read_lock(&self) -> VolumeReadGuard<'_, Hierarchy> {
        self.hierarchy.read()
    }

    /// Exclusive access to the hierarchy and its mutators.
    pub fn write_lock(&self) -> VolumeWriter<'_> {
        VolumeWriter {
            volume: self,
            hierarchy: self.hierarchy.write(),
        }
    }

    pub fn iterator_lock(&self) -> RecursiveGuard<'_, ()> {
        self.iterators.lock()
    }

    pub fn attribute_iterator_lock(&self) -> RecursiveGuard<'_, ()> {
        self.attribute_iterators.lock()
    }

    /// Last time the hierarchy lock was contended.
    pub fn access_time(&self) -> Option<SystemTime> {
        self.hierarchy.access_time()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn find_node(&self, id: NodeId) -> VolResult<Arc<Node>> {
        self.read_lock().find_node(id)
    }

    pub fn find_entry(&self, dir: NodeId, name: &str) -> VolResult<Arc<Entry>> {
        self.read_lock().find_entry(dir, name)
    }

    pub fn root(&self) -> Option<Arc<Node>> {
        self.read_lock().root().cloned()
    }

    // ========================================================================
    // Vnodes
    // ========================================================================

    /// Take a host reference to the vnode for `id`.
    pub fn get_vnode(&self, id: NodeId) -> VolResult<Arc<Node>> {
        if !self.is_mounted() {
            return Err(VolError::NotMounted);
        }
        self.host.get_vnode(self.handle, id)
    }

    /// Take a host reference to `node`'s vnode and check the host agrees
    /// that `node` is the node with that id.
    pub fn get_vnode_checked(&self, node: &Arc<Node>) -> VolResult<()> {
        let found = self.get_vnode(node.id())?;
        if !Arc::ptr_eq(&found, node) {
            error!(volume = %self.handle, id = %node.id(), "two nodes have the same id");
            if let Err(err) = self.put_vnode(node.id()) {
                warn!(id = %node.id(), %err, "failed to release duplicate vnode");
            }
            return Err(VolError::IdCollision(node.id()));
        }
        Ok(())
    }

    /// Drop a host reference. Fails with [`VolError::NotMounted`] when there
    /// is no mount to release it against.
    pub fn put_vnode(&self, id: NodeId) -> VolResult<()> {
        if !self.is_mounted() {
            return Err(VolError::NotMounted);
        }
        self.host.put_vnode(self.handle, id)
    }

    pub fn unremove_vnode(&self, id: NodeId) -> VolResult<()> {
        if !self.is_mounted() {
            return Err(VolError::NotMounted);
        }
        self.host.unremove_vnode(self.handle, id)
    }

    // ========================================================================
    // Name and blocks
    // ========================================================================

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) -> VolResult<()> {
        check_volume_name(name)?;
        *self.name.write() = name.to_string();
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// Blocks in use. Content storage is not tracked here.
    pub fn count_blocks(&self) -> u64 {
        0
    }

    pub fn count_free_blocks(&self) -> u64 {
        self.config.capacity_blocks.saturating_sub(self.count_blocks())
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a node listener on `target`, or on every node when `flags`
    /// has [`NodeListenFlags::ANY_NODE`].
    pub fn add_node_listener(
        &self,
        listener: &NodeListenerHandle,
        target: Option<NodeId>,
        flags: NodeListenFlags,
    ) -> VolResult<()> {
        self.listeners.lock().borrow_mut().nodes.add(listener, target, flags)
    }

    pub fn remove_node_listener(&self, listener: &NodeListenerHandle, target: Option<NodeId>) -> VolResult<()> {
        self.listeners.lock().borrow_mut().nodes.remove(listener, target)
    }

    /// Register an entry listener on `target`, or on every entry when `flags`
    /// has [`EntryListenFlags::ANY_ENTRY`].
    pub fn add_entry_listener(
        &self,
        listener: &EntryListenerHandle,
        target: Option<EntryId>,
        flags: EntryListenFlags,
    ) -> VolResult<()> {
        self.listeners.lock().borrow_mut().entries.add(listener, target, flags)
    }

    pub fn remove_entry_listener(&self, listener: &EntryListenerHandle, target: Option<EntryId>) -> VolResult<()> {
        self.listeners.lock().borrow_mut().entries.remove(listener, target)
    }

    fn notify_node(&self, node: &Arc<Node>, event: NodeListenFlags) {
        let listeners = self.listeners.lock();
        let recipients = listeners.borrow().nodes.recipients(node.id(), event);
        trace!(node = %node.id(), ?event, recipients = recipients.len(), "node event");
        for listener in &recipients {
            if event.contains(NodeListenFlags::ADDED) {
                listener.node_added(node);
            } else {
                listener.node_removed(node);
            }
        }
    }

    fn notify_entry(&self, entry: &Arc<Entry>, event: EntryListenFlags) {
        let listeners = self.listeners.lock();
        let recipients = listeners.borrow().entries.recipients(entry.id(), event);
        trace!(entry = %entry.id(), ?event, recipients = recipients.len(), "entry event");
        for listener in &recipients {
            if event.contains(EntryListenFlags::ADDED) {
                listener.entry_added(entry);
            } else {
                listener.entry_removed(entry);
            }
        }
    }

    fn purge_node_listeners(&self, id: NodeId) {
        let purged = self.listeners.lock().borrow_mut().nodes.remove_target(id);
        if purged > 0 {
            trace!(node = %id, purged, "dropped node listeners");
        }
    }

    fn purge_entry_listeners(&self, id: EntryId) {
        let purged = self.listeners.lock().borrow_mut().entries.remove_target(id);
        if purged > 0 {
            trace!(entry = %id, purged, "dropped entry listeners");
        }
    }

    // ========================================================================
    // Live queries
    // ========================================================================

    pub fn add_query(&self, query: &QueryHandle) {
        self.queries.lock().borrow_mut().add(query);
    }

    pub fn remove_query(&self, query: &QueryHandle) {
        self.queries.lock().borrow_mut().remove(query);
    }

    /// Forward an attribute delta to every registered query, in
    /// registration order.
    pub fn update_live_queries(&self, update: &LiveUpdate<'_>) {
        let queries = self.queries.lock();
        let snapshot = queries.borrow().snapshot();
        trace!(node = %update.node.id(), attribute = update.attribute, queries = snapshot.len(), "live update");
        for query in &snapshot {
            query.live_update(update);
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn allocation_info(&self) -> VolResult<AllocationInfo> {
        let hierarchy = self.read_lock();
        let nodes = hierarchy.nodes.as_ref().ok_or(VolError::NotMounted)?;
        let entries = hierarchy.entries.as_ref().ok_or(VolError::NotMounted)?;

        let mut info = AllocationInfo {
            nodes: nodes.len(),
            entries: entries.len(),
            name_bytes: entries.name_bytes() + self.name.read().len(),
            table_bytes: nodes.len() * std::mem::size_of::<(NodeId, std::sync::Weak<Node>)>()
                + entries.len() * std::mem::size_of::<((NodeId, String), std::sync::Weak<Entry>)>(),
            ..AllocationInfo::default()
        };

        let mut seen = HashSet::new();
        let mut pending: Vec<Arc<Node>> = hierarchy.root().cloned().into_iter().collect();
        while let Some(node) = pending.pop() {
            if !seen.insert(node.id()) {
                continue;
            }
            for attribute in node.attributes() {
                info.attributes += 1;
                info.attribute_bytes += attribute.name().len() + attribute.value().len();
            }
            pending.extend(node.children().iter().map(|e| e.node().clone()));
        }
        Ok(info)
    }

    pub fn stats(&self) -> VolumeStats {
        let (node_listeners, entry_listeners) = {
            let listeners = self.listeners.lock();
            let listeners = listeners.borrow();
            (
                listeners.nodes.targeted_count() + listeners.nodes.any_target_count(),
                listeners.entries.targeted_count() + listeners.entries.any_target_count(),
            )
        };
        VolumeStats {
            name: self.name(),
            mounted: self.is_mounted(),
            root: self.root().map(|r| r.id()),
            block_size: self.block_size(),
            blocks: self.count_blocks(),
            free_blocks: self.count_free_blocks(),
            node_listeners,
            entry_listeners,
            queries: self.queries.lock().borrow().len(),
            allocation: self.allocation_info().ok(),
        }
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("handle", &self.handle)
            .field("name", &*self.name.read())
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Exclusive access to a volume's hierarchy.
///
/// Lookups are available through `Deref` to [`Hierarchy`].
pub struct VolumeWriter<'a> {
    volume: &'a Volume,
    hierarchy: VolumeWriteGuard<'a, Hierarchy>,
}

impl Deref for VolumeWriter<'_> {
    type Target = Hierarchy;

    fn deref(&self) -> &Hierarchy {
        &self.hierarchy
    }
}

impl VolumeWriter<'_> {
    /// Register a node in the identity table and notify added-listeners.
    pub fn node_added(&mut self, node: &Arc<Node>) -> VolResult<()> {
        self.hierarchy.nodes_mut()?.add_node(node)?;
        self.volume.notify_node(node, NodeListenFlags::ADDED);
        Ok(())
    }

    /// Unregister a node and notify removed-listeners.
    pub fn node_removed(&mut self, node: &Arc<Node>) -> VolResult<()> {
        self.hierarchy.nodes_mut()?.remove_node(node)?;
        self.volume.notify_node(node, NodeListenFlags::REMOVED);
        Ok(())
    }

    /// Register an entry of directory `dir` and notify added-listeners.
    pub fn entry_added(&mut self, dir: NodeId, entry: &Arc<Entry>) -> VolResult<()> {
        self.hierarchy.entries_mut()?.add_entry(dir, entry)?;
        self.volume.notify_entry(entry, EntryListenFlags::ADDED);
        Ok(())
    }

    /// Unregister an entry of directory `dir` and notify removed-listeners.
    pub fn entry_removed(&mut self, dir: NodeId, entry: &Arc<Entry>) -> VolResult<()> {
        self.hierarchy.entries_mut()?.remove_entry(dir, entry)?;
        self.volume.notify_entry(entry, EntryListenFlags::REMOVED);
        Ok(())
    }

    /// Register `node` and create its vnode, hidden from path lookups.
    pub fn new_vnode(&mut self, node: &Arc<Node>) -> VolResult<()> {
        self.register_vnode(node, false)
    }

    /// Register `node` and create its vnode, visible to path lookups.
    pub fn publish_vnode(&mut self, node: &Arc<Node>) -> VolResult<()> {
        self.register_vnode(node, true)
    }

    fn register_vnode(&mut self, node: &Arc<Node>, publish: bool) -> VolResult<()> {
        self.node_added(node)?;
        let volume = self.volume;
        let (host, handle) = (&volume.host, volume.handle);
        let result = if publish {
            host.publish_vnode(handle, node.id(), node, node.mode())
        } else {
            host.new_vnode(handle, node.id(), node)
        };
        if let Err(err) = result {
            warn!(node = %node.id(), publish, %err, "host refused vnode, unregistering");
            if let Err(undo) = self.node_removed(node) {
                warn!(node = %node.id(), %undo, "rollback failed");
            }
            volume.purge_node_listeners(node.id());
            return Err(err);
        }
        Ok(())
    }

    /// Mark `node` removed.
    ///
    /// While mounted this is the host's business; the node is reclaimed when
    /// its last reference goes. Otherwise the node is unregistered and torn
    /// down right away, and a node that is not registered is left alone.
    pub fn remove_vnode(&mut self, node: &Arc<Node>) -> VolResult<()> {
        if self.volume.is_mounted() {
            return self.volume.host.remove_vnode(self.volume.handle, node.id());
        }
        self.node_removed(node)?;
        self.release_node(node);
        Ok(())
    }

    /// Release a removed node once the host has dropped its last reference.
    ///
    /// A node a rolled back create already unregistered is still torn down.
    pub fn reclaim_vnode(&mut self, node: &Arc<Node>) -> VolResult<()> {
        match self.node_removed(node) {
            Ok(()) | Err(VolError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.release_node(node);
        Ok(())
    }

    fn release_node(&mut self, node: &Arc<Node>) {
        for attribute in node.attributes() {
            self.node_attribute_removed(&attribute);
            node.remove_attribute(attribute.name());
        }
        self.volume.purge_node_listeners(node.id());
        node.dismantle();
    }

    /// Create and link an empty directory.
    pub fn create_directory(&mut self, parent: &Arc<Node>, name: &str, perm: u32) -> VolResult<Arc<Node>> {
        let node = Node::new_directory(self.volume.next_node_id(), perm);
        self.create_node(parent, name, node)
    }

    /// Create and link an empty regular file.
    pub fn create_file(&mut self, parent: &Arc<Node>, name: &str, perm: u32) -> VolResult<Arc<Node>> {
        let node = Node::new_file(self.volume.next_node_id(), perm);
        self.create_node(parent, name, node)
    }

    /// Publish `node` and link it into `parent`. The creation reference is
    /// released before returning.
    fn create_node(&mut self, parent: &Arc<Node>, name: &str, node: Arc<Node>) -> VolResult<Arc<Node>> {
        if !self.volume.is_mounted() {
            return Err(VolError::NotMounted);
        }
        check_entry_name(name)?;
        if !parent.is_directory() {
            return Err(VolError::not_a_directory(format!("node {}", parent.id())));
        }
        if parent.child(name).is_some() {
            return Err(VolError::already_exists(format!("{}/{name}", parent.id())));
        }

        self.publish_vnode(&node)?;
        if let Err(err) = self.link(parent, name, &node) {
            warn!(node = %node.id(), %err, "link failed, discarding new node");
            let volume = self.volume;
            let (host, handle) = (&volume.host, volume.handle);
            if let Err(undo) = self.node_removed(&node) {
                warn!(node = %node.id(), %undo, "rollback failed to unregister node");
            }
            volume.purge_node_listeners(node.id());
            if let Err(undo) = host.remove_vnode(handle, node.id()) {
                warn!(node = %node.id(), %undo, "rollback failed to remove vnode");
            }
            if let Err(undo) = host.put_vnode(handle, node.id()) {
                warn!(node = %node.id(), %undo, "rollback failed to release vnode");
            }
            return Err(err);
        }
        self.volume.put_vnode(node.id())?;
        Ok(node)
    }

    /// Link `node` into `parent` as `name`.
    pub fn link(&mut self, parent: &Arc<Node>, name: &str, node: &Arc<Node>) -> VolResult<Arc<Entry>> {
        check_entry_name(name)?;
        if !parent.is_directory() {
            return Err(VolError::not_a_directory(format!("node {}", parent.id())));
        }
        if node.is_directory() && node.link_count() > 0 {
            return Err(VolError::bad_value(format!("directory {} is already linked", node.id())));
        }

        let entry = Entry::new(self.volume.next_entry_id(), parent, name, node.clone());
        if !parent.insert_child(entry.clone()) {
            return Err(VolError::already_exists(format!("{}/{name}", parent.id())));
        }
        if let Err(err) = self.entry_added(parent.id(), &entry) {
            parent.take_child(name);
            if node.unlink() == 0 {
                node.clear_parent();
            }
            return Err(err);
        }
        self.hierarchy.touch_indexed(parent);
        Ok(entry)
    }

    /// Remove the entry `name` from `parent`. The node goes once its last
    /// link does.
    pub fn unlink(&mut self, parent: &Arc<Node>, name: &str) -> VolResult<()> {
        if !parent.is_directory() {
            return Err(VolError::not_a_directory(format!("node {}", parent.id())));
        }
        let entry = parent
            .child(name)
            .ok_or_else(|| VolError::not_found(format!("{}/{name}", parent.id())))?;
        let node = entry.node().clone();
        if node.is_directory() && !node.children().is_empty() {
            return Err(VolError::bad_value(format!("directory {} is not empty", node.id())));
        }

        self.entry_removed(parent.id(), &entry)?;
        self.volume.purge_entry_listeners(entry.id());
        parent.take_child(name);
        self.hierarchy.touch_indexed(parent);

        if node.unlink() == 0 {
            node.clear_parent();
            self.remove_vnode(&node)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    /// An attribute was attached to a node.
    pub fn node_attribute_added(&mut self, attribute: &Attribute) {
        if let Some(index) = self.find_attribute_index(attribute.name(), attribute.type_code()) {
            index.added(attribute);
        }
    }

    /// An attribute is about to be detached from its node.
    pub fn node_attribute_removed(&mut self, attribute: &Attribute) {
        if let Some(index) = self.find_attribute_index(attribute.name(), attribute.type_code()) {
            index.removed(attribute);
        }
        if let Some(node) = attribute.node() {
            let old_key = attribute.key();
            self.volume.update_live_queries(&LiveUpdate {
                entry: None,
                node: &node,
                attribute: attribute.name(),
                type_code: attribute.type_code(),
                old_key: Some(&old_key),
                new_key: None,
            });
        }
    }

    /// An attached attribute's value changed; `old_key` is its previous key.
    pub fn node_attribute_changed(&mut self, attribute: &Attribute, old_key: &[u8]) {
        if let Some(index) = self.find_attribute_index(attribute.name(), attribute.type_code()) {
            index.changed(attribute, old_key);
        }
        if let Some(node) = attribute.node() {
            let new_key = attribute.key();
            self.volume.update_live_queries(&LiveUpdate {
                entry: None,
                node: &node,
                attribute: attribute.name(),
                type_code: attribute.type_code(),
                old_key: Some(old_key),
                new_key: Some(&new_key),
            });
        }
    }

    /// Set attribute `name` on `node`, creating or replacing it as needed.
    pub fn write_attribute(
        &mut self,
        node: &Arc<Node>,
        name: &str,
        type_code: TypeCode,
        value: impl Into<Vec<u8>>,
    ) -> VolResult<Arc<Attribute>> {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(VolError::bad_value(format!("invalid attribute name {name:?}")));
        }
        let existing = node.attribute(name);
        if let Some(attribute) = existing.as_ref().filter(|a| a.type_code() == type_code) {
            let old_key = attribute.set_value(value);
            self.node_attribute_changed(attribute, &old_key);
            return Ok(attribute.clone());
        }
        if let Some(old) = existing {
            self.node_attribute_removed(&old);
            node.remove_attribute(name);
        }

        let attribute = Attribute::new(name, type_code, value);
        node.set_attribute(attribute.clone());
        self.node_attribute_added(&attribute);
        let new_key = attribute.key();
        self.volume.update_live_queries(&LiveUpdate {
            entry: None,
            node,
            attribute: name,
            type_code,
            old_key: None,
            new_key: Some(&new_key),
        });
        Ok(attribute)
    }

    /// Remove attribute `name` from `node`.
    pub fn remove_attribute(&mut self, node: &Arc<Node>, name: &str) -> VolResult<()> {
        let attribute = node
            .attribute(name)
            .ok_or_else(|| VolError::not_found(format!("attribute {name} on node {}", node.id())))?;
        self.node_attribute_removed(&attribute);
        node.remove_attribute(name);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Indices
    // ------------------------------------------------------------------------

    pub fn create_index(&mut self, name: &str, type_code: TypeCode) -> VolResult<Arc<AttributeIndex>> {
        self.hierarchy
            .indices
            .as_mut()
            .ok_or(VolError::NotMounted)?
            .create_index(name, type_code)
    }

    pub fn remove_index(&mut self, name: &str) -> VolResult<()> {
        self.hierarchy
            .indices
            .as_mut()
            .ok_or(VolError::NotMounted)?
            .remove_index(name)
    }
}

fn check_entry_name(name: &str) -> VolResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || name.contains('/') || name == "." || name == ".." {
        return Err(VolError::bad_value(format!("invalid entry name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostOp, MemoryHost};
    use crate::listener::NodeListener;
    use parking_lot::Mutex;
    use strum::IntoEnumIterator;

    fn volume() -> (Arc<MemoryHost>, Volume) {
        let host = Arc::new(MemoryHost::new());
        let volume = Volume::new(VolumeHandle::from_raw(1), host.clone(), VolumeConfig::default());
        (host, volume)
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<NodeId>>);

    impl NodeListener for Seen {
        fn node_added(&self, node: &Arc<Node>) {
            self.0.lock().push(node.id());
        }
    }

    #[test]
    fn test_every_mount_step_can_fail() {
        let (host, volume) = volume();
        for step in MountStep::iter() {
            volume.fail_mount_at(step);
            assert!(matches!(volume.mount(0), Err(VolError::NoMemory)), "step {step}");
            assert!(!volume.is_mounted());
            {
                let hierarchy = volume.read_lock();
                assert!(hierarchy.nodes.is_none());
                assert!(hierarchy.entries.is_none());
                assert!(hierarchy.indices.is_none());
                assert!(hierarchy.root.is_none());
            }
            {
                let listeners = volume.listeners.lock();
                let listeners = listeners.borrow();
                assert!(!listeners.nodes.is_installed());
                assert!(!listeners.entries.is_installed());
                assert_eq!(listeners.nodes.any_target_count(), 0);
                assert_eq!(listeners.entries.any_target_count(), 0);
            }
            volume.unmount();
        }
        assert_eq!(host.vnode_count(volume.handle()), 0);
        volume.mount(0).unwrap();
        assert!(volume.is_mounted());
    }

    #[test]
    fn test_mount_fails_when_root_publish_fails() {
        let (host, volume) = volume();
        let seen = Arc::new(Seen::default());
        let handle: NodeListenerHandle = seen.clone().into();
        volume
            .add_node_listener(&handle, None, NodeListenFlags::ANY_NODE | NodeListenFlags::ALL)
            .unwrap();

        host.fail_next(HostOp::PublishVnode);
        assert!(matches!(volume.mount(0), Err(VolError::NoMemory)));
        assert!(!volume.is_mounted());
        // the root was announced, then rolled back
        assert_eq!(seen.0.lock().len(), 1);
        assert_eq!(host.vnode_count(volume.handle()), 0);
    }

    #[test]
    fn test_index_listeners_follow_mount() {
        let (_host, volume) = volume();
        volume.mount(0).unwrap();
        {
            let listeners = volume.listeners.lock();
            let listeners = listeners.borrow();
            assert_eq!(listeners.nodes.any_target_count(), 2);
            assert_eq!(listeners.entries.any_target_count(), 1);
        }
        let root = volume.root().unwrap();
        let hierarchy = volume.read_lock();
        assert_eq!(hierarchy.size_index().unwrap().value_of(root.id()), Some(0));
        drop(hierarchy);

        volume.unmount();
        let listeners = volume.listeners.lock();
        assert_eq!(listeners.borrow().nodes.any_target_count(), 0);
        assert_eq!(listeners.borrow().entries.any_target_count(), 0);
    }

    #[test]
    fn test_unmounted_remove_vnode_discards() {
        let (host, volume) = volume();
        volume.mount(0).unwrap();
        let mut writer = volume.write_lock();
        let node = Node::new_file(volume.next_node_id(), 0o644);
        writer.node_added(&node).unwrap();
        drop(writer);

        volume.mounted.store(false, Ordering::SeqCst);
        let calls = host.calls();
        let mut writer = volume.write_lock();
        writer.remove_vnode(&node).unwrap();
        assert!(writer.find_node(node.id()).unwrap_err().is_not_found());
        assert_eq!(host.calls(), calls);

        // a node that was never registered is refused and left intact
        let stray = Node::new_directory(volume.next_node_id(), 0o755);
        let child = Node::new_file(volume.next_node_id(), 0o644);
        assert!(stray.insert_child(Entry::new(EntryId::from_raw(99), &stray, "c", child)));
        assert!(writer.remove_vnode(&stray).unwrap_err().is_not_found());
        assert_eq!(stray.children().len(), 1);
    }

    #[test]
    fn test_reclaim_after_rolled_back_create() {
        let (host, volume) = volume();
        volume.mount(0).unwrap();
        let mut writer = volume.write_lock();
        let node = Node::new_file(volume.next_node_id(), 0o644);
        writer.publish_vnode(&node).unwrap();
        node.set_attribute(Attribute::new("tag", ramvol_types::type_code::STRING, b"x".to_vec()));
        writer.node_removed(&node).unwrap();

        writer.reclaim_vnode(&node).unwrap();
        assert!(node.attributes().is_empty());
        assert_eq!(host.vnode_count(volume.handle()), 2);
    }

    #[test]
    fn test_entry_names_are_checked() {
        for bad in ["", ".", "..", "a/b"] {
            assert!(check_entry_name(bad).is_err(), "{bad:?}");
        }
        assert!(check_entry_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
        check_entry_name("notes.txt").unwrap();
    }

    #[test]
    fn test_set_name() {
        let (_host, volume) = volume();
        assert_eq!(volume.name(), "RAMFS");
        volume.set_name("scratch").unwrap();
        assert_eq!(volume.name(), "scratch");
        assert!(volume.set_name("").is_err());
        assert!(volume.set_name(&"n".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert_eq!(volume.name(), "scratch");
    }

    #[test]
    fn test_unchecked_config_name_falls_back() {
        let host = Arc::new(MemoryHost::new());
        let config = VolumeConfig::default().with_name("");
        let volume = Volume::new(VolumeHandle::from_raw(2), host, config);
        assert_eq!(volume.name(), DEFAULT_VOLUME_NAME);
    }
}
