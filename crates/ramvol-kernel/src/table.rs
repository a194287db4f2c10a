//! Node identity table and directory entry table.
//!
//! Both tables index the hierarchy without owning it: they hold weak
//! references, so a table entry never keeps a node or entry alive.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use ramvol_types::NodeId;

use crate::entry::Entry;
use crate::error::{VolError, VolResult};
use crate::node::Node;

/// Maps node ids to live nodes. Ids are unique within the table.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Weak<Node>>,
}

impl NodeTable {
    /// Create a table with room for `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> VolResult<Self> {
        let mut nodes = HashMap::new();
        nodes.try_reserve(capacity)?;
        Ok(Self { nodes })
    }

    /// Register a node. Fails if its id is already present.
    pub fn add_node(&mut self, node: &Arc<Node>) -> VolResult<()> {
        let id = node.id();
        if self.nodes.get(&id).is_some_and(|n| n.strong_count() > 0) {
            return Err(VolError::already_exists(format!("node {id}")));
        }
        self.nodes.try_reserve(1)?;
        self.nodes.insert(id, Arc::downgrade(node));
        Ok(())
    }

    /// Unregister a node. Fails unless this exact node is registered.
    pub fn remove_node(&mut self, node: &Node) -> VolResult<()> {
        let id = node.id();
        match self.nodes.get(&id) {
            Some(weak) if std::ptr::eq(weak.as_ptr(), node) => {
                self.nodes.remove(&id);
                Ok(())
            }
            _ => Err(VolError::not_found(format!("node {id}"))),
        }
    }

    pub fn get_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(&id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Maps (directory id, name) to entries.
#[derive(Debug, Default)]
pub struct DirectoryEntryTable {
    entries: HashMap<(NodeId, String), Weak<Entry>>,
    name_bytes: usize,
}

impl DirectoryEntryTable {
    /// Create a table with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> VolResult<Self> {
        let mut entries = HashMap::new();
        entries.try_reserve(capacity)?;
        Ok(Self {
            entries,
            name_bytes: 0,
        })
    }

    /// Register an entry under directory `dir`. Fails if the name is taken.
    pub fn add_entry(&mut self, dir: NodeId, entry: &Arc<Entry>) -> VolResult<()> {
        let key = (dir, entry.name().to_string());
        if self.entries.get(&key).is_some_and(|e| e.strong_count() > 0) {
            return Err(VolError::already_exists(format!("{dir}/{}", entry.name())));
        }
        self.entries.try_reserve(1)?;
        self.name_bytes += entry.name().len();
        self.entries.insert(key, Arc::downgrade(entry));
        Ok(())
    }

    /// Unregister an entry. Fails unless this exact entry is registered.
    pub fn remove_entry(&mut self, dir: NodeId, entry: &Entry) -> VolResult<()> {
        let key = (dir, entry.name().to_string());
        match self.entries.get(&key) {
            Some(weak) if std::ptr::eq(weak.as_ptr(), entry) => {
                self.entries.remove(&key);
                self.name_bytes -= entry.name().len();
                Ok(())
            }
            _ => Err(VolError::not_found(format!("{dir}/{}", entry.name()))),
        }
    }

    pub fn get_entry(&self, dir: NodeId, name: &str) -> Option<Arc<Entry>> {
        self.entries
            .get(&(dir, name.to_string()))
            .and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of entry names currently indexed.
    pub fn name_bytes(&self) -> usize {
        self.name_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramvol_types::EntryId;

    #[test]
    fn test_node_table_uniqueness() {
        let mut table = NodeTable::with_capacity(4).unwrap();
        let a = Node::new_file(NodeId::from_raw(10), 0o644);
        let twin = Node::new_file(NodeId::from_raw(10), 0o644);

        table.add_node(&a).unwrap();
        assert!(matches!(table.add_node(&twin), Err(VolError::AlreadyExists(_))));
        assert!(Arc::ptr_eq(&table.get_node(NodeId::from_raw(10)).unwrap(), &a));

        // the twin is not the registered node
        assert!(table.remove_node(&twin).is_err());
        table.remove_node(&a).unwrap();
        assert!(table.get_node(NodeId::from_raw(10)).is_none());
        assert!(table.remove_node(&a).unwrap_err().is_not_found());
    }

    #[test]
    fn test_node_table_does_not_own() {
        let mut table = NodeTable::with_capacity(1).unwrap();
        let a = Node::new_file(NodeId::from_raw(3), 0o644);
        table.add_node(&a).unwrap();
        drop(a);
        assert!(table.get_node(NodeId::from_raw(3)).is_none());
    }

    #[test]
    fn test_capacity_overflow_is_no_memory() {
        assert!(matches!(NodeTable::with_capacity(usize::MAX), Err(VolError::NoMemory)));
        assert!(matches!(
            DirectoryEntryTable::with_capacity(usize::MAX),
            Err(VolError::NoMemory)
        ));
    }

    #[test]
    fn test_entry_table_add_remove() {
        let mut table = DirectoryEntryTable::with_capacity(4).unwrap();
        let dir = Node::new_directory(NodeId::from_raw(1), 0o755);
        let file = Node::new_file(NodeId::from_raw(2), 0o644);
        let entry = Entry::new(EntryId::from_raw(1), &dir, "notes", file);

        table.add_entry(dir.id(), &entry).unwrap();
        assert_eq!(table.name_bytes(), 5);
        assert!(table.add_entry(dir.id(), &entry).is_err());
        assert!(Arc::ptr_eq(&table.get_entry(dir.id(), "notes").unwrap(), &entry));
        assert!(table.get_entry(dir.id(), "other").is_none());

        table.remove_entry(dir.id(), &entry).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.name_bytes(), 0);
        assert!(table.remove_entry(dir.id(), &entry).is_err());
    }
}
