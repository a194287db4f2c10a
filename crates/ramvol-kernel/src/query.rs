//! Live query registry.
//!
//! Standing queries are re-evaluated incrementally: every attribute change
//! on the volume is forwarded to each registered query as a [`LiveUpdate`],
//! and the query decides for itself whether the change matters.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use ramvol_types::{MAX_INDEX_KEY_LENGTH, NodeId, SubscriberId, TypeCode};

use crate::entry::Entry;
use crate::node::Node;
use crate::subscriber::Subscriber;

/// One attribute delta.
///
/// A key of `None` means the attribute is absent on that side of the change.
#[derive(Debug, Clone, Copy)]
pub struct LiveUpdate<'a> {
    /// Set when the change came with an entry rename; `None` for
    /// attribute-only changes.
    pub entry: Option<&'a Arc<Entry>>,
    pub node: &'a Arc<Node>,
    pub attribute: &'a str,
    pub type_code: TypeCode,
    pub old_key: Option<&'a [u8]>,
    pub new_key: Option<&'a [u8]>,
}

/// A standing query.
///
/// `live_update` runs with the queries lock held. The same lock-ordering
/// rule as listener callbacks applies: never acquire the hierarchy lock here.
pub trait LiveQuery: Send + Sync {
    fn live_update(&self, update: &LiveUpdate<'_>);
}

pub type QueryHandle = Subscriber<dyn LiveQuery>;

impl<Q: LiveQuery + 'static> From<Arc<Q>> for Subscriber<dyn LiveQuery> {
    fn from(query: Arc<Q>) -> Self {
        Subscriber::new(query)
    }
}

/// Registered queries in insertion order, without duplicates.
#[derive(Default)]
pub struct QueryRegistry {
    queries: IndexMap<SubscriberId, QueryHandle>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query. Returns false if it was already registered.
    pub fn add(&mut self, query: &QueryHandle) -> bool {
        if self.queries.contains_key(&query.id()) {
            return false;
        }
        self.queries.insert(query.id(), query.clone());
        true
    }

    /// Remove a query, keeping the order of the rest. Returns false if it was
    /// not registered.
    pub fn remove(&mut self, query: &QueryHandle) -> bool {
        self.queries.shift_remove(&query.id()).is_some()
    }

    /// Queries in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn LiveQuery>> {
        self.queries.values().map(|q| q.get().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.queries.keys()).finish()
    }
}

/// A node entering or leaving an [`AttributeMatchQuery`]'s result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchChange {
    Entered(NodeId),
    Left(NodeId),
}

/// Matches nodes whose attribute `name` of type `type_code` has key `value`.
pub struct AttributeMatchQuery {
    attribute: String,
    type_code: TypeCode,
    key: Vec<u8>,
    notify: Box<dyn Fn(MatchChange) + Send + Sync>,
}

impl AttributeMatchQuery {
    pub fn new(
        attribute: impl Into<String>,
        type_code: TypeCode,
        value: &[u8],
        notify: impl Fn(MatchChange) + Send + Sync + 'static,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            type_code,
            key: value[..value.len().min(MAX_INDEX_KEY_LENGTH)].to_vec(),
            notify: Box::new(notify),
        }
    }

    fn matches(&self, key: Option<&[u8]>) -> bool {
        key == Some(self.key.as_slice())
    }
}

impl LiveQuery for AttributeMatchQuery {
    fn live_update(&self, update: &LiveUpdate<'_>) {
        if update.attribute != self.attribute || update.type_code != self.type_code {
            return;
        }
        let id = update.node.id();
        match (self.matches(update.old_key), self.matches(update.new_key)) {
            (false, true) => (self.notify)(MatchChange::Entered(id)),
            (true, false) => (self.notify)(MatchChange::Left(id)),
            _ => {}
        }
    }
}

impl fmt::Debug for AttributeMatchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeMatchQuery")
            .field("attribute", &self.attribute)
            .field("type_code", &self.type_code)
            .finish_non_exhaustive()
    }
}
