//! Directory entries.

use std::sync::{Arc, Weak};

use ramvol_types::{EntryId, NodeId};

use crate::node::Node;

/// A named link from a directory to a child node.
///
/// The entry owns its child; the parent link is weak.
#[derive(Debug)]
pub struct Entry {
    id: EntryId,
    parent_id: NodeId,
    parent: Weak<Node>,
    name: String,
    node: Arc<Node>,
}

impl Entry {
    pub fn new(id: EntryId, parent: &Arc<Node>, name: impl Into<String>, node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent_id: parent.id(),
            parent: Arc::downgrade(parent),
            name: name.into(),
            node,
        })
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn parent_id(&self) -> NodeId {
        self.parent_id
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}
