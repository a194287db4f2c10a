//! Typed identifiers for nodes, entries, and subscribers.
//!
//! All ID types wrap a `u64` handed out by a monotonic counter. Node and entry
//! IDs come from the owning volume's counters and are never reused for the
//! lifetime of that volume, across mount/unmount cycles included. Subscriber
//! IDs come from a process-wide counter so a listener or query handle keeps
//! one identity no matter which volume it is registered with.
//!
//! `ROOT_PARENT_ID` is the reserved sentinel stored as the root directory's
//! parent linkage. No real node ever carries it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A node identifier (host-visible vnode number).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

/// A directory entry identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

/// Logical identity of a registered listener or live query.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(u64);

/// Parent linkage of the root directory.
pub const ROOT_PARENT_ID: NodeId = NodeId(0);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_counter_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Wrap a raw value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw value.
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $T {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$T> for u64 {
            fn from(id: $T) -> u64 {
                id.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.0)
            }
        }
    };
}

impl_counter_id!(NodeId, "NodeId");
impl_counter_id!(EntryId, "EntryId");
impl_counter_id!(SubscriberId, "SubscriberId");

impl NodeId {
    /// Whether this is the reserved root-parent sentinel.
    pub fn is_root_parent(&self) -> bool {
        *self == ROOT_PARENT_ID
    }
}

impl SubscriberId {
    /// Allocate the next process-wide subscriber identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Monotonic ID source scoped to one owner (a volume).
///
/// Starts just above a floor value and only ever counts up.
#[derive(Debug)]
pub struct IdCounter {
    next: AtomicU64,
}

impl IdCounter {
    /// Create a counter whose first issued value is `floor + 1`.
    pub const fn above(floor: u64) -> Self {
        Self {
            next: AtomicU64::new(floor + 1),
        }
    }

    /// Issue the next value.
    pub fn issue(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Peek at the value the next call to `issue` returns.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_parent_sentinel() {
        assert!(ROOT_PARENT_ID.is_root_parent());
        assert!(!NodeId::from_raw(1).is_root_parent());
    }

    #[test]
    fn test_counter_is_monotonic() {
        let counter = IdCounter::above(ROOT_PARENT_ID.raw());
        assert_eq!(counter.peek(), 1);
        let a = counter.issue();
        let b = counter.issue();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(counter.peek(), 3);
    }

    #[test]
    fn test_subscriber_ids_are_distinct() {
        let a = SubscriberId::next();
        let b = SubscriberId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_debug_and_display() {
        let id = NodeId::from_raw(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(format!("{:?}", id), "NodeId(42)");
    }

    #[test]
    fn test_serde_transparent() {
        let id = EntryId::from_raw(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "7");
        let back: EntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
