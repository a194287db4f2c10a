//! Dual-keyed listener registries.
//!
//! A [`ListenerRegistry`] holds two kinds of registration:
//!
//! - **Targeted**: keyed by target id, then by listener id. Lookups by target
//!   yield that target's registrations in listener-id order. This map exists
//!   only while the volume is mounted ([`ListenerRegistry::install`]).
//! - **Any-target**: a plain list in registration order, kept for the
//!   lifetime of the volume.
//!
//! The same structure backs node listeners (keyed by [`NodeId`]) and entry
//! listeners (keyed by [`EntryId`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ramvol_types::{EntryId, EntryListenFlags, ListenMask, NodeId, NodeListenFlags, SubscriberId};

use crate::entry::Entry;
use crate::error::{VolError, VolResult};
use crate::node::Node;
use crate::subscriber::Subscriber;

/// Receives node registration events.
///
/// Callbacks run synchronously on the mutating thread while the listeners
/// lock is held. They must be fast, and they must not acquire the volume's
/// hierarchy lock (no `read_lock`, `write_lock`, `find_node`, ...). Touching
/// listener or query registrations from a callback is fine.
pub trait NodeListener: Send + Sync {
    fn node_added(&self, _node: &Arc<Node>) {}
    fn node_removed(&self, _node: &Arc<Node>) {}
}

/// Receives directory entry events. Same calling rules as [`NodeListener`].
pub trait EntryListener: Send + Sync {
    fn entry_added(&self, _entry: &Arc<Entry>) {}
    fn entry_removed(&self, _entry: &Arc<Entry>) {}
}

pub type NodeListenerHandle = Subscriber<dyn NodeListener>;
pub type EntryListenerHandle = Subscriber<dyn EntryListener>;

impl<L: NodeListener + 'static> From<Arc<L>> for Subscriber<dyn NodeListener> {
    fn from(listener: Arc<L>) -> Self {
        Subscriber::new(listener as Arc<dyn NodeListener>)
    }
}

impl<L: EntryListener + 'static> From<Arc<L>> for Subscriber<dyn EntryListener> {
    fn from(listener: Arc<L>) -> Self {
        Subscriber::new(listener as Arc<dyn EntryListener>)
    }
}

struct Registration<K, L: ?Sized, F> {
    listener: Subscriber<L>,
    target: Option<K>,
    flags: F,
}

impl<K: PartialEq, L: ?Sized, F> Registration<K, L, F> {
    /// Equality used for removal: listener and target, never the flags.
    fn same_subscription(&self, other: &Self) -> bool {
        self.listener.id() == other.listener.id() && self.target == other.target
    }
}

type TargetMap<K, L, F> = BTreeMap<K, BTreeMap<SubscriberId, Registration<K, L, F>>>;

/// Registry of listeners of one event kind.
pub struct ListenerRegistry<K, L: ?Sized, F> {
    targeted: Option<TargetMap<K, L, F>>,
    any_target: Vec<Registration<K, L, F>>,
}

pub type NodeListenerRegistry = ListenerRegistry<NodeId, dyn NodeListener, NodeListenFlags>;
pub type EntryListenerRegistry = ListenerRegistry<EntryId, dyn EntryListener, EntryListenFlags>;

impl<K, L, F> Default for ListenerRegistry<K, L, F>
where
    K: Ord + Copy + fmt::Display,
    L: ?Sized,
    F: ListenMask,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, L, F> ListenerRegistry<K, L, F>
where
    K: Ord + Copy + fmt::Display,
    L: ?Sized,
    F: ListenMask,
{
    /// Create a registry with no targeted map installed.
    pub fn new() -> Self {
        Self {
            targeted: None,
            any_target: Vec::new(),
        }
    }

    /// Allocate the targeted map. Any previous map is discarded.
    pub fn install(&mut self) {
        self.targeted = Some(BTreeMap::new());
    }

    /// Drop the targeted map and every targeted registration in it.
    pub fn teardown(&mut self) {
        self.targeted = None;
    }

    pub fn is_installed(&self) -> bool {
        self.targeted.is_some()
    }

    /// Register `listener`.
    ///
    /// A mask with the any-target bit makes an any-target registration and
    /// `target` is ignored. Otherwise `target` is required. The mask must
    /// select at least one event.
    pub fn add(&mut self, listener: &Subscriber<L>, target: Option<K>, flags: F) -> VolResult<()> {
        if !flags.selects_events() {
            return Err(VolError::bad_value(format!("listener mask selects no events: {flags:?}")));
        }
        if flags.is_any_target() {
            self.any_target.try_reserve(1)?;
            self.any_target.push(Registration {
                listener: listener.clone(),
                target: None,
                flags,
            });
            return Ok(());
        }
        let Some(target) = target else {
            return Err(VolError::bad_value("listener needs a target or the any-target flag"));
        };
        let targeted = self.targeted.as_mut().ok_or(VolError::NotMounted)?;
        let set = targeted.entry(target).or_default();
        if set.contains_key(&listener.id()) {
            return Err(VolError::already_exists(format!(
                "listener {} on target {target}",
                listener.id()
            )));
        }
        set.insert(
            listener.id(),
            Registration {
                listener: listener.clone(),
                target: Some(target),
                flags,
            },
        );
        Ok(())
    }

    /// Remove a registration.
    ///
    /// With a target, the exact (target, listener) pair must be registered.
    /// Without one, the first any-target registration of `listener` goes,
    /// whatever its mask.
    pub fn remove(&mut self, listener: &Subscriber<L>, target: Option<K>) -> VolResult<()> {
        let missing = || VolError::not_found(format!("listener {}", listener.id()));
        match target {
            Some(target) => {
                let targeted = self.targeted.as_mut().ok_or_else(missing)?;
                let set = targeted.get_mut(&target).ok_or_else(missing)?;
                set.remove(&listener.id()).ok_or_else(missing)?;
                if set.is_empty() {
                    targeted.remove(&target);
                }
                Ok(())
            }
            None => {
                let wanted = Registration {
                    listener: listener.clone(),
                    target: None,
                    flags: F::none(),
                };
                let pos = self
                    .any_target
                    .iter()
                    .position(|r| r.same_subscription(&wanted))
                    .ok_or_else(missing)?;
                self.any_target.remove(pos);
                Ok(())
            }
        }
    }

    /// Drop every targeted registration for `target`. Returns how many went.
    pub fn remove_target(&mut self, target: K) -> usize {
        self.targeted
            .as_mut()
            .and_then(|t| t.remove(&target))
            .map_or(0, |set| set.len())
    }

    /// Listeners to notify of `event` on `target`: targeted registrations in
    /// listener-id order, then any-target registrations in registration order.
    pub fn recipients(&self, target: K, event: F) -> Vec<Arc<L>> {
        let targeted = self
            .targeted
            .as_ref()
            .and_then(|t| t.get(&target))
            .into_iter()
            .flat_map(|set| set.values());
        targeted
            .chain(self.any_target.iter())
            .filter(|r| r.flags.wants(event))
            .map(|r| r.listener.get().clone())
            .collect()
    }

    pub fn targeted_count(&self) -> usize {
        self.targeted
            .as_ref()
            .map_or(0, |t| t.values().map(BTreeMap::len).sum())
    }

    pub fn any_target_count(&self) -> usize {
        self.any_target.len()
    }
}

impl<K, L: ?Sized, F> fmt::Debug for ListenerRegistry<K, L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("installed", &self.targeted.is_some())
            .field("targets", &self.targeted.as_ref().map_or(0, BTreeMap::len))
            .field("any_target", &self.any_target.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<(&'static str, NodeId)>>>;

    struct Recorder {
        tag: &'static str,
        log: Log,
    }

    impl NodeListener for Recorder {
        fn node_added(&self, node: &Arc<Node>) {
            self.log.lock().push((self.tag, node.id()));
        }
    }

    fn registry() -> NodeListenerRegistry {
        let mut r = NodeListenerRegistry::new();
        r.install();
        r
    }

    fn handle(tag: &'static str, log: &Log) -> NodeListenerHandle {
        Arc::new(Recorder {
            tag,
            log: log.clone(),
        })
        .into()
    }

    fn deliver_added(registry: &NodeListenerRegistry, id: NodeId) {
        let node = Node::new_file(id, 0o644);
        for l in registry.recipients(id, NodeListenFlags::ADDED) {
            l.node_added(&node);
        }
    }

    #[test]
    fn test_rejects_empty_mask() {
        let mut r = registry();
        let l = handle("a", &Log::default());
        let err = r.add(&l, Some(NodeId::from_raw(1)), NodeListenFlags::ANY_NODE).unwrap_err();
        assert!(matches!(err, VolError::BadValue(_)));
        let err = r.add(&l, Some(NodeId::from_raw(1)), NodeListenFlags::empty()).unwrap_err();
        assert!(matches!(err, VolError::BadValue(_)));
    }

    #[test]
    fn test_rejects_missing_target() {
        let mut r = registry();
        let l = handle("a", &Log::default());
        assert!(matches!(r.add(&l, None, NodeListenFlags::ADDED), Err(VolError::BadValue(_))));
    }

    #[test]
    fn test_targeted_needs_install() {
        let mut r = NodeListenerRegistry::new();
        let l = handle("a", &Log::default());
        let err = r.add(&l, Some(NodeId::from_raw(1)), NodeListenFlags::ADDED).unwrap_err();
        assert!(matches!(err, VolError::NotMounted));
        // any-target registrations do not need the map
        r.add(&l, None, NodeListenFlags::ANY_NODE | NodeListenFlags::ADDED).unwrap();
        assert_eq!(r.any_target_count(), 1);
    }

    #[test]
    fn test_target_plus_any_flag_is_any_target() {
        let mut r = registry();
        let l = handle("a", &Log::default());
        r.add(
            &l,
            Some(NodeId::from_raw(1)),
            NodeListenFlags::ANY_NODE | NodeListenFlags::ADDED,
        )
        .unwrap();
        assert_eq!(r.targeted_count(), 0);
        assert_eq!(r.any_target_count(), 1);
        assert_eq!(r.recipients(NodeId::from_raw(99), NodeListenFlags::ADDED).len(), 1);
    }

    #[test]
    fn test_duplicate_targeted_registration() {
        let mut r = registry();
        let l = handle("a", &Log::default());
        let target = Some(NodeId::from_raw(4));
        r.add(&l, target, NodeListenFlags::ADDED).unwrap();
        assert!(matches!(
            r.add(&l, target, NodeListenFlags::REMOVED),
            Err(VolError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_recipient_order_and_filter() {
        let log = Log::default();
        let mut r = registry();
        let a = handle("a", &log);
        let b = handle("b", &log);
        let c = handle("c", &log);
        let d = handle("d", &log);
        let target = NodeId::from_raw(7);

        // b registers before a; targeted order follows listener identity
        r.add(&b, Some(target), NodeListenFlags::ADDED).unwrap();
        r.add(&a, Some(target), NodeListenFlags::ADDED).unwrap();
        r.add(&d, None, NodeListenFlags::ANY_NODE | NodeListenFlags::ADDED).unwrap();
        r.add(&c, None, NodeListenFlags::ANY_NODE | NodeListenFlags::REMOVED).unwrap();

        deliver_added(&r, target);
        let tags: Vec<_> = log.lock().iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec!["a", "b", "d"]);

        log.lock().clear();
        deliver_added(&r, NodeId::from_raw(8));
        assert_eq!(*log.lock(), vec![("d", NodeId::from_raw(8))]);
    }

    #[test]
    fn test_remove_targeted_requires_exact_pair() {
        let log = Log::default();
        let mut r = registry();
        let l = handle("a", &log);
        let other = handle("b", &log);
        let target = NodeId::from_raw(3);
        r.add(&l, Some(target), NodeListenFlags::ADDED).unwrap();

        assert!(r.remove(&other, Some(target)).unwrap_err().is_not_found());
        assert!(r.remove(&l, Some(NodeId::from_raw(4))).unwrap_err().is_not_found());
        r.remove(&l, Some(target)).unwrap();
        deliver_added(&r, target);
        assert!(log.lock().is_empty());
        assert_eq!(r.targeted_count(), 0);
    }

    #[test]
    fn test_any_target_removal_ignores_mask() {
        let mut r = registry();
        let l = handle("a", &Log::default());
        r.add(&l, None, NodeListenFlags::ANY_NODE | NodeListenFlags::ALL).unwrap();
        r.remove(&l, None).unwrap();
        assert_eq!(r.any_target_count(), 0);
        assert!(r.remove(&l, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_target_purges() {
        let log = Log::default();
        let mut r = registry();
        let a = handle("a", &log);
        let b = handle("b", &log);
        let target = NodeId::from_raw(5);
        r.add(&a, Some(target), NodeListenFlags::ADDED).unwrap();
        r.add(&b, Some(target), NodeListenFlags::REMOVED).unwrap();
        assert_eq!(r.remove_target(target), 2);
        assert_eq!(r.remove_target(target), 0);
    }

    #[test]
    fn test_teardown_keeps_any_target() {
        let mut r = registry();
        let a = handle("a", &Log::default());
        r.add(&a, Some(NodeId::from_raw(1)), NodeListenFlags::ADDED).unwrap();
        r.add(&a, None, NodeListenFlags::ANY_NODE | NodeListenFlags::ADDED).unwrap();
        r.teardown();
        assert!(!r.is_installed());
        assert_eq!(r.targeted_count(), 0);
        assert_eq!(r.any_target_count(), 1);
    }
}
