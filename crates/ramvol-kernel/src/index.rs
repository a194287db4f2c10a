//! Index directory.
//!
//! Every mounted volume carries three built-in indices and any number of
//! attribute indices:
//!
//! - [`NameIndex`] tracks entry names. It is an any-target entry listener.
//! - Two [`NodeValueIndex`]es track node modification time and size. They are
//!   any-target node listeners.
//! - [`AttributeIndex`]es are keyed by (attribute name, type code) and fed by
//!   the volume's attribute hooks.
//!
//! The built-ins are registered as listeners when the volume mounts and
//! deregistered before the index directory is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use ramvol_types::{BuiltinIndex, EntryId, NodeId, TypeCode, type_code};
use tracing::debug;

use crate::entry::Entry;
use crate::error::{VolError, VolResult};
use crate::listener::{EntryListener, EntryListenerHandle, NodeListener, NodeListenerHandle};
use crate::node::{Attribute, Node};

/// Behavior common to every index.
pub trait Index: Send + Sync {
    fn name(&self) -> &str;

    fn key_type(&self) -> TypeCode;

    /// Key length when every key has the same size.
    fn fixed_key_length(&self) -> Option<usize>;

    fn count_entries(&self) -> usize;
}

// ============================================================================
// Name index
// ============================================================================

/// Entry names to the nodes they link.
#[derive(Debug, Default)]
pub struct NameIndex {
    entries: Mutex<BTreeMap<(String, EntryId), NodeId>>,
}

impl NameIndex {
    /// Nodes linked under `name`, in entry order.
    pub fn lookup(&self, name: &str) -> Vec<NodeId> {
        self.entries
            .lock()
            .range((name.to_string(), EntryId::from_raw(0))..)
            .take_while(|((n, _), _)| n == name)
            .map(|(_, id)| *id)
            .collect()
    }
}

impl Index for NameIndex {
    fn name(&self) -> &str {
        BuiltinIndex::Name.index_name()
    }

    fn key_type(&self) -> TypeCode {
        BuiltinIndex::Name.key_type()
    }

    fn fixed_key_length(&self) -> Option<usize> {
        None
    }

    fn count_entries(&self) -> usize {
        self.entries.lock().len()
    }
}

impl EntryListener for NameIndex {
    fn entry_added(&self, entry: &Arc<Entry>) {
        self.entries
            .lock()
            .insert((entry.name().to_string(), entry.id()), entry.node().id());
    }

    fn entry_removed(&self, entry: &Arc<Entry>) {
        self.entries
            .lock()
            .remove(&(entry.name().to_string(), entry.id()));
    }
}

// ============================================================================
// Node value indices (last modified, size)
// ============================================================================

#[derive(Debug, Default)]
struct ValueEntries {
    ordered: BTreeSet<(u64, NodeId)>,
    by_node: HashMap<NodeId, u64>,
}

/// A built-in index keyed by a 64-bit value read off each node.
#[derive(Debug)]
pub struct NodeValueIndex {
    kind: BuiltinIndex,
    key: fn(&Node) -> u64,
    entries: Mutex<ValueEntries>,
}

impl NodeValueIndex {
    fn new(kind: BuiltinIndex, key: fn(&Node) -> u64) -> Self {
        Self {
            kind,
            key,
            entries: Mutex::new(ValueEntries::default()),
        }
    }

    /// Index over node modification times (microseconds).
    pub fn last_modified() -> Self {
        Self::new(BuiltinIndex::LastModified, Node::modified_micros)
    }

    /// Index over node sizes.
    pub fn size() -> Self {
        Self::new(BuiltinIndex::Size, Node::size)
    }

    pub fn kind(&self) -> BuiltinIndex {
        self.kind
    }

    /// The indexed value of a node, if present.
    pub fn value_of(&self, id: NodeId) -> Option<u64> {
        self.entries.lock().by_node.get(&id).copied()
    }

    /// Nodes whose value lies in `[low, high]`, in value order.
    pub fn range(&self, low: u64, high: u64) -> Vec<NodeId> {
        self.entries
            .lock()
            .ordered
            .range((low, NodeId::from_raw(0))..=(high, NodeId::from_raw(u64::MAX)))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Re-read a node's value after it changed.
    pub fn update(&self, node: &Node) {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.by_node.get(&node.id()).copied() {
            let new = (self.key)(node);
            entries.ordered.remove(&(old, node.id()));
            entries.ordered.insert((new, node.id()));
            entries.by_node.insert(node.id(), new);
        }
    }
}

impl Index for NodeValueIndex {
    fn name(&self) -> &str {
        self.kind.index_name()
    }

    fn key_type(&self) -> TypeCode {
        self.kind.key_type()
    }

    fn fixed_key_length(&self) -> Option<usize> {
        Some(std::mem::size_of::<u64>())
    }

    fn count_entries(&self) -> usize {
        self.entries.lock().by_node.len()
    }
}

impl NodeListener for NodeValueIndex {
    fn node_added(&self, node: &Arc<Node>) {
        let value = (self.key)(node);
        let mut entries = self.entries.lock();
        entries.ordered.insert((value, node.id()));
        entries.by_node.insert(node.id(), value);
    }

    fn node_removed(&self, node: &Arc<Node>) {
        let mut entries = self.entries.lock();
        if let Some(value) = entries.by_node.remove(&node.id()) {
            entries.ordered.remove(&(value, node.id()));
        }
    }
}

// ============================================================================
// Attribute index
// ============================================================================

/// Index over one attribute name and type.
#[derive(Debug)]
pub struct AttributeIndex {
    name: String,
    type_code: TypeCode,
    entries: Mutex<BTreeSet<(Vec<u8>, NodeId)>>,
}

impl AttributeIndex {
    pub fn new(name: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            name: name.into(),
            type_code,
            entries: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn type_code(&self) -> TypeCode {
        self.type_code
    }

    /// An attribute was attached to a node.
    pub fn added(&self, attribute: &Attribute) {
        if let Some(node) = attribute.node() {
            self.entries.lock().insert((attribute.key(), node.id()));
        }
    }

    /// An attribute is about to be detached from its node.
    pub fn removed(&self, attribute: &Attribute) {
        if let Some(node) = attribute.node() {
            self.entries.lock().remove(&(attribute.key(), node.id()));
        }
    }

    /// An attached attribute's value changed from `old_key`.
    pub fn changed(&self, attribute: &Attribute, old_key: &[u8]) {
        if let Some(node) = attribute.node() {
            let mut entries = self.entries.lock();
            entries.remove(&(old_key.to_vec(), node.id()));
            entries.insert((attribute.key(), node.id()));
        }
    }

    /// Nodes whose attribute key equals `key`.
    pub fn lookup(&self, key: &[u8]) -> Vec<NodeId> {
        self.entries
            .lock()
            .range((key.to_vec(), NodeId::from_raw(0))..=(key.to_vec(), NodeId::from_raw(u64::MAX)))
            .map(|(_, id)| *id)
            .collect()
    }
}

impl Index for AttributeIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_type(&self) -> TypeCode {
        self.type_code
    }

    fn fixed_key_length(&self) -> Option<usize> {
        match self.type_code {
            type_code::INT32 | type_code::UINT32 | type_code::FLOAT => Some(4),
            type_code::INT64 | type_code::UINT64 | type_code::DOUBLE => Some(8),
            _ => None,
        }
    }

    fn count_entries(&self) -> usize {
        self.entries.lock().len()
    }
}

// ============================================================================
// Index directory
// ============================================================================

/// All indices of a mounted volume.
pub struct IndexDirectory {
    name_index: Arc<NameIndex>,
    last_modified_index: Arc<NodeValueIndex>,
    size_index: Arc<NodeValueIndex>,
    attribute_indices: BTreeMap<String, Arc<AttributeIndex>>,
    name_listener: EntryListenerHandle,
    last_modified_listener: NodeListenerHandle,
    size_listener: NodeListenerHandle,
}

impl Default for IndexDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexDirectory {
    /// Create the directory with its three built-in indices.
    pub fn new() -> Self {
        let name_index = Arc::new(NameIndex::default());
        let last_modified_index = Arc::new(NodeValueIndex::last_modified());
        let size_index = Arc::new(NodeValueIndex::size());
        Self {
            name_listener: name_index.clone().into(),
            last_modified_listener: last_modified_index.clone().into(),
            size_listener: size_index.clone().into(),
            name_index,
            last_modified_index,
            size_index,
            attribute_indices: BTreeMap::new(),
        }
    }

    pub fn name_index(&self) -> &Arc<NameIndex> {
        &self.name_index
    }

    pub fn last_modified_index(&self) -> &Arc<NodeValueIndex> {
        &self.last_modified_index
    }

    pub fn size_index(&self) -> &Arc<NodeValueIndex> {
        &self.size_index
    }

    /// Listener handles the volume registers for the built-in indices.
    pub(crate) fn entry_listener(&self) -> &EntryListenerHandle {
        &self.name_listener
    }

    pub(crate) fn node_listeners(&self) -> [&NodeListenerHandle; 2] {
        [&self.last_modified_listener, &self.size_listener]
    }

    /// Find any index by name.
    pub fn find_index(&self, name: &str) -> Option<Arc<dyn Index>> {
        match name.parse::<BuiltinIndex>() {
            Ok(BuiltinIndex::Name) => Some(self.name_index.clone()),
            Ok(BuiltinIndex::LastModified) => Some(self.last_modified_index.clone()),
            Ok(BuiltinIndex::Size) => Some(self.size_index.clone()),
            Err(_) => self
                .attribute_indices
                .get(name)
                .map(|i| i.clone() as Arc<dyn Index>),
        }
    }

    /// Find the attribute index for `name` with exactly this type.
    pub fn find_attribute_index(&self, name: &str, type_code: TypeCode) -> Option<Arc<AttributeIndex>> {
        self.attribute_indices
            .get(name)
            .filter(|i| i.type_code() == type_code)
            .cloned()
    }

    /// Create an attribute index.
    pub fn create_index(&mut self, name: &str, type_code: TypeCode) -> VolResult<Arc<AttributeIndex>> {
        if name.is_empty() {
            return Err(VolError::bad_value("index name is empty"));
        }
        if self.find_index(name).is_some() {
            return Err(VolError::already_exists(format!("index {name}")));
        }
        let index = Arc::new(AttributeIndex::new(name, type_code));
        self.attribute_indices.insert(name.to_string(), index.clone());
        debug!(index = name, type_code, "created attribute index");
        Ok(index)
    }

    /// Remove an attribute index. Built-in indices cannot be removed.
    pub fn remove_index(&mut self, name: &str) -> VolResult<()> {
        if name.parse::<BuiltinIndex>().is_ok() {
            return Err(VolError::bad_value(format!("cannot remove built-in index {name}")));
        }
        self.attribute_indices
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VolError::not_found(format!("index {name}")))
    }

    /// Every index, built-ins first, then attribute indices by name.
    pub fn indices(&self) -> Vec<Arc<dyn Index>> {
        let mut all: Vec<Arc<dyn Index>> = vec![
            self.name_index.clone(),
            self.last_modified_index.clone(),
            self.size_index.clone(),
        ];
        all.extend(self.attribute_indices.values().map(|i| i.clone() as Arc<dyn Index>));
        all
    }
}

impl std::fmt::Debug for IndexDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDirectory")
            .field("attribute_indices", &self.attribute_indices.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_findable() {
        let dir = IndexDirectory::new();
        for name in ["name", "last_modified", "size"] {
            let index = dir.find_index(name).unwrap();
            assert_eq!(index.name(), name);
        }
        assert!(dir.find_index("missing").is_none());
        assert_eq!(dir.indices().len(), 3);
    }

    #[test]
    fn test_create_and_remove_attribute_index() {
        let mut dir = IndexDirectory::new();
        dir.create_index("MAIL:from", type_code::STRING).unwrap();
        assert!(matches!(
            dir.create_index("MAIL:from", type_code::STRING),
            Err(VolError::AlreadyExists(_))
        ));
        assert!(matches!(dir.create_index("size", type_code::INT64), Err(VolError::AlreadyExists(_))));

        assert!(dir.find_attribute_index("MAIL:from", type_code::STRING).is_some());
        assert!(dir.find_attribute_index("MAIL:from", type_code::INT32).is_none());

        assert!(matches!(dir.remove_index("name"), Err(VolError::BadValue(_))));
        dir.remove_index("MAIL:from").unwrap();
        assert!(dir.remove_index("MAIL:from").unwrap_err().is_not_found());
    }

    #[test]
    fn test_attribute_index_tracks_keys() {
        let index = AttributeIndex::new("color", type_code::STRING);
        let a = Node::new_file(NodeId::from_raw(1), 0o644);
        let b = Node::new_file(NodeId::from_raw(2), 0o644);
        let attr_a = Attribute::new("color", type_code::STRING, b"red".to_vec());
        let attr_b = Attribute::new("color", type_code::STRING, b"red".to_vec());
        a.set_attribute(attr_a.clone());
        b.set_attribute(attr_b.clone());

        index.added(&attr_a);
        index.added(&attr_b);
        assert_eq!(index.lookup(b"red"), vec![a.id(), b.id()]);

        let old = attr_a.set_value(b"blue".to_vec());
        index.changed(&attr_a, &old);
        assert_eq!(index.lookup(b"red"), vec![b.id()]);
        assert_eq!(index.lookup(b"blue"), vec![a.id()]);

        index.removed(&attr_b);
        assert!(index.lookup(b"red").is_empty());
        assert_eq!(index.count_entries(), 1);
    }

    #[test]
    fn test_detached_attribute_is_ignored() {
        let index = AttributeIndex::new("color", type_code::STRING);
        let loose = Attribute::new("color", type_code::STRING, b"red".to_vec());
        index.added(&loose);
        assert_eq!(index.count_entries(), 0);
    }

    #[test]
    fn test_value_index_follows_node_events() {
        let index = NodeValueIndex::size();
        let link = Node::new_symlink(NodeId::from_raw(4), "/abc");
        let file = Node::new_file(NodeId::from_raw(5), 0o644);
        index.node_added(&link);
        index.node_added(&file);
        assert_eq!(index.value_of(link.id()), Some(4));
        assert_eq!(index.range(0, 0), vec![file.id()]);
        assert_eq!(index.range(1, 10), vec![link.id()]);

        index.node_removed(&link);
        assert_eq!(index.count_entries(), 1);
        assert!(index.value_of(link.id()).is_none());
    }

    #[test]
    fn test_name_index_lookup() {
        let index = NameIndex::default();
        let dir = Node::new_directory(NodeId::from_raw(1), 0o755);
        let file = Node::new_file(NodeId::from_raw(2), 0o644);
        let entry = Entry::new(EntryId::from_raw(1), &dir, "readme", file.clone());
        index.entry_added(&entry);
        assert_eq!(index.lookup("readme"), vec![file.id()]);
        assert!(index.lookup("read").is_empty());
        index.entry_removed(&entry);
        assert_eq!(index.count_entries(), 0);
    }
}
