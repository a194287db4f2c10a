//! In-memory nodes and their attributes.
//!
//! The hierarchy is a tree of exclusively-owned nodes: a directory owns its
//! entries and each entry owns its child node. Parent links are weak and only
//! serve path resolution. [`Node::dismantle`] tears a subtree down
//! depth-first, which is how unmounting the root destroys the whole volume.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use ramvol_types::{MAX_INDEX_KEY_LENGTH, NodeId, ROOT_PARENT_ID, TypeCode};

use crate::entry::Entry;

/// Mask of the file type bits in a mode.
pub const S_IFMT: u32 = 0o170000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = 0o120000;

/// What a node is.
#[derive(Debug)]
pub enum NodeKind {
    /// A directory and its entries, keyed by name.
    Directory(Mutex<BTreeMap<String, Arc<Entry>>>),
    /// A regular file. Content lives in an external data container.
    File,
    /// A symbolic link.
    Symlink(String),
}

impl NodeKind {
    fn type_bits(&self) -> u32 {
        match self {
            NodeKind::Directory(_) => S_IFDIR,
            NodeKind::File => S_IFREG,
            NodeKind::Symlink(_) => S_IFLNK,
        }
    }
}

#[derive(Debug)]
struct ParentLink {
    id: NodeId,
    node: Weak<Node>,
}

/// A node of the volume.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    /// Permission and type bits.
    mode: AtomicU32,
    parent: Mutex<ParentLink>,
    /// Microseconds since the epoch.
    modified: AtomicU64,
    size: AtomicU64,
    /// Entries referring to this node.
    links: AtomicU32,
    attributes: Mutex<Vec<Arc<Attribute>>>,
    this: Weak<Node>,
}

impl Node {
    fn new(id: NodeId, kind: NodeKind, perm: u32) -> Arc<Self> {
        let mode = kind.type_bits() | (perm & !S_IFMT);
        Arc::new_cyclic(|this| Self {
            id,
            kind,
            mode: AtomicU32::new(mode),
            parent: Mutex::new(ParentLink {
                id: ROOT_PARENT_ID,
                node: Weak::new(),
            }),
            modified: AtomicU64::new(now_micros()),
            size: AtomicU64::new(0),
            links: AtomicU32::new(0),
            attributes: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Create an empty directory.
    pub fn new_directory(id: NodeId, perm: u32) -> Arc<Self> {
        Self::new(id, NodeKind::Directory(Mutex::new(BTreeMap::new())), perm)
    }

    /// Create a regular file.
    pub fn new_file(id: NodeId, perm: u32) -> Arc<Self> {
        Self::new(id, NodeKind::File, perm)
    }

    /// Create a symbolic link.
    pub fn new_symlink(id: NodeId, target: impl Into<String>) -> Arc<Self> {
        let target = target.into();
        let node = Self::new(id, NodeKind::Symlink(target.clone()), 0o777);
        node.size.store(target.len() as u64, Ordering::Relaxed);
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    /// Full mode: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }

    /// Replace the permission bits; the type bits are kept.
    pub fn set_mode(&self, perm: u32) {
        let mode = self.kind.type_bits() | (perm & !S_IFMT);
        self.mode.store(mode, Ordering::Relaxed);
    }

    pub fn parent_id(&self) -> NodeId {
        self.parent.lock().id
    }

    /// The parent directory, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.lock().node.upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Node>) {
        let mut link = self.parent.lock();
        link.id = parent.id;
        link.node = Arc::downgrade(parent);
    }

    pub(crate) fn clear_parent(&self) {
        let mut link = self.parent.lock();
        link.id = ROOT_PARENT_ID;
        link.node = Weak::new();
    }

    pub fn modified_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.modified.load(Ordering::Relaxed))
    }

    /// Modification time as stored in the last-modified index.
    pub fn modified_micros(&self) -> u64 {
        self.modified.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.modified.store(now_micros(), Ordering::Relaxed);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn link_count(&self) -> u32 {
        self.links.load(Ordering::Relaxed)
    }

    pub(crate) fn link(&self) {
        self.links.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one link, returning the remaining count.
    pub(crate) fn unlink(&self) -> u32 {
        let prev = self.links.fetch_sub(1, Ordering::Relaxed);
        prev.saturating_sub(1)
    }

    /// Look up a child entry by name. `None` for non-directories.
    pub fn child(&self, name: &str) -> Option<Arc<Entry>> {
        match &self.kind {
            NodeKind::Directory(entries) => entries.lock().get(name).cloned(),
            _ => None,
        }
    }

    /// Child entries in name order. Empty for non-directories.
    pub fn children(&self) -> Vec<Arc<Entry>> {
        match &self.kind {
            NodeKind::Directory(entries) => entries.lock().values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Insert an entry into this directory. Returns false if the name is taken
    /// or this is not a directory.
    pub(crate) fn insert_child(&self, entry: Arc<Entry>) -> bool {
        let NodeKind::Directory(entries) = &self.kind else {
            return false;
        };
        let mut entries = entries.lock();
        if entries.contains_key(entry.name()) {
            return false;
        }
        entry.node().link();
        if let Some(this) = self.this.upgrade() {
            entry.node().set_parent(&this);
        }
        entries.insert(entry.name().to_string(), entry);
        drop(entries);
        self.touch();
        true
    }

    pub(crate) fn take_child(&self, name: &str) -> Option<Arc<Entry>> {
        let NodeKind::Directory(entries) = &self.kind else {
            return None;
        };
        let entry = entries.lock().remove(name)?;
        self.touch();
        Some(entry)
    }

    /// Tear down this subtree depth-first: every descendant entry is detached
    /// and its node dismantled before this directory lets go of it.
    pub fn dismantle(&self) {
        if let NodeKind::Directory(entries) = &self.kind {
            let taken = std::mem::take(&mut *entries.lock());
            for (_, entry) in taken {
                let child = entry.node();
                child.dismantle();
                child.unlink();
                child.clear_parent();
            }
        }
        self.attributes.lock().clear();
    }

    /// Attach an attribute to this node, replacing one with the same name.
    /// Returns the replaced attribute, already detached.
    pub fn set_attribute(&self, attribute: Arc<Attribute>) -> Option<Arc<Attribute>> {
        *attribute.node.lock() = self.this.clone();
        let mut attributes = self.attributes.lock();
        let replaced = match attributes.iter().position(|a| a.name == attribute.name) {
            Some(pos) => Some(std::mem::replace(&mut attributes[pos], attribute)),
            None => {
                attributes.push(attribute);
                None
            }
        };
        if let Some(old) = &replaced {
            old.detach();
        }
        replaced
    }

    pub fn attribute(&self, name: &str) -> Option<Arc<Attribute>> {
        self.attributes.lock().iter().find(|a| a.name == name).cloned()
    }

    pub fn attributes(&self) -> Vec<Arc<Attribute>> {
        self.attributes.lock().clone()
    }

    /// Detach and return the named attribute.
    pub fn remove_attribute(&self, name: &str) -> Option<Arc<Attribute>> {
        let mut attributes = self.attributes.lock();
        let pos = attributes.iter().position(|a| a.name == name)?;
        let attribute = attributes.remove(pos);
        attribute.detach();
        Some(attribute)
    }
}

/// A typed attribute attached to a node.
#[derive(Debug)]
pub struct Attribute {
    name: String,
    type_code: TypeCode,
    value: Mutex<Vec<u8>>,
    node: Mutex<Weak<Node>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, type_code: TypeCode, value: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            type_code,
            value: Mutex::new(value.into()),
            node: Mutex::new(Weak::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_code(&self) -> TypeCode {
        self.type_code
    }

    pub fn value(&self) -> Vec<u8> {
        self.value.lock().clone()
    }

    /// Replace the value, returning the previous index key.
    pub fn set_value(&self, value: impl Into<Vec<u8>>) -> Vec<u8> {
        let mut current = self.value.lock();
        let old_key = index_key(&current);
        *current = value.into();
        old_key
    }

    /// The value as an index key, truncated to [`MAX_INDEX_KEY_LENGTH`].
    pub fn key(&self) -> Vec<u8> {
        index_key(&self.value.lock())
    }

    /// The node this attribute is attached to, if any.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.lock().upgrade()
    }

    fn detach(&self) {
        *self.node.lock() = Weak::new();
    }
}

fn index_key(value: &[u8]) -> Vec<u8> {
    value[..value.len().min(MAX_INDEX_KEY_LENGTH)].to_vec()
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramvol_types::{EntryId, type_code};

    fn id(raw: u64) -> NodeId {
        NodeId::from_raw(raw)
    }

    #[test]
    fn test_mode_keeps_type_bits() {
        let dir = Node::new_directory(id(1), 0o755);
        assert_eq!(dir.mode(), S_IFDIR | 0o755);
        dir.set_mode(0o700);
        assert_eq!(dir.mode(), S_IFDIR | 0o700);
        assert_eq!(dir.mode() & S_IFMT, S_IFDIR);
    }

    #[test]
    fn test_insert_child_links_parent() {
        let dir = Node::new_directory(id(1), 0o755);
        let file = Node::new_file(id(2), 0o644);
        let entry = Entry::new(EntryId::from_raw(1), &dir, "a.txt", file.clone());
        assert!(dir.insert_child(entry.clone()));
        assert_eq!(file.parent_id(), id(1));
        assert_eq!(file.link_count(), 1);
        assert!(Arc::ptr_eq(&dir.child("a.txt").unwrap(), &entry));

        // name taken
        let again = Entry::new(EntryId::from_raw(2), &dir, "a.txt", Node::new_file(id(3), 0o644));
        assert!(!dir.insert_child(again));
    }

    #[test]
    fn test_file_cannot_hold_children() {
        let file = Node::new_file(id(2), 0o644);
        let other = Node::new_file(id(3), 0o644);
        let entry = Entry::new(EntryId::from_raw(1), &file, "x", other);
        assert!(!file.insert_child(entry));
        assert!(file.children().is_empty());
    }

    #[test]
    fn test_dismantle_cascades() {
        let root = Node::new_directory(id(1), 0o755);
        let sub = Node::new_directory(id(2), 0o755);
        let leaf = Node::new_file(id(3), 0o644);
        root.insert_child(Entry::new(EntryId::from_raw(1), &root, "sub", sub.clone()));
        sub.insert_child(Entry::new(EntryId::from_raw(2), &sub, "leaf", leaf.clone()));

        let weak_leaf = Arc::downgrade(&leaf);
        drop(leaf);
        drop(sub);

        root.dismantle();
        assert!(root.children().is_empty());
        assert!(weak_leaf.upgrade().is_none());
    }

    #[test]
    fn test_attribute_attach_and_replace() {
        let node = Node::new_file(id(5), 0o644);
        let first = Attribute::new("color", type_code::STRING, b"red".to_vec());
        assert!(node.set_attribute(first.clone()).is_none());
        assert_eq!(first.node().unwrap().id(), id(5));

        let second = Attribute::new("color", type_code::STRING, b"blue".to_vec());
        let replaced = node.set_attribute(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(first.node().is_none());
        assert_eq!(node.attribute("color").unwrap().value(), b"blue");

        let removed = node.remove_attribute("color").unwrap();
        assert!(removed.node().is_none());
        assert!(node.attributes().is_empty());
    }

    #[test]
    fn test_key_is_truncated() {
        let attr = Attribute::new("big", type_code::RAW, vec![7u8; MAX_INDEX_KEY_LENGTH + 10]);
        assert_eq!(attr.key().len(), MAX_INDEX_KEY_LENGTH);
        let old = attr.set_value(b"small".to_vec());
        assert_eq!(old.len(), MAX_INDEX_KEY_LENGTH);
        assert_eq!(attr.key(), b"small");
    }

    #[test]
    fn test_symlink_size() {
        let link = Node::new_symlink(id(9), "/target");
        assert_eq!(link.size(), 7);
        assert_eq!(link.mode() & S_IFMT, S_IFLNK);
    }
}
