//! Listener interest masks.
//!
//! A registration carries one of these masks. The `ADDED`/`REMOVED` bits
//! select which events reach the listener; the `ANY_*` bit turns the
//! registration into an any-target one. A mask must contain at least one bit
//! of `ALL` to be accepted.

use bitflags::bitflags;

bitflags! {
    /// Interest mask for node listeners.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeListenFlags: u32 {
        /// Listen to every node, not one target.
        const ANY_NODE = 0x01;
        /// Node was registered in the identity table.
        const ADDED = 0x02;
        /// Node was unregistered from the identity table.
        const REMOVED = 0x04;
        /// Every event bit a registration may select.
        const ALL = Self::ADDED.bits() | Self::REMOVED.bits();
    }
}

bitflags! {
    /// Interest mask for entry listeners.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryListenFlags: u32 {
        /// Listen to every entry, not one target.
        const ANY_ENTRY = 0x01;
        /// Entry was added to the directory entry table.
        const ADDED = 0x02;
        /// Entry was removed from the directory entry table.
        const REMOVED = 0x04;
        /// Every event bit a registration may select.
        const ALL = Self::ADDED.bits() | Self::REMOVED.bits();
    }
}

/// The operations a listener registry needs from an interest mask.
pub trait ListenMask: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// The zero mask.
    fn none() -> Self;

    /// Whether the any-target bit is set.
    fn is_any_target(&self) -> bool;

    /// Whether at least one allowed event bit is set.
    fn selects_events(&self) -> bool;

    /// Whether this mask selects the given event bit.
    fn wants(&self, event: Self) -> bool;
}

macro_rules! impl_listen_mask {
    ($T:ident, $any:ident) => {
        impl ListenMask for $T {
            fn none() -> Self {
                Self::empty()
            }

            fn is_any_target(&self) -> bool {
                self.contains(Self::$any)
            }

            fn selects_events(&self) -> bool {
                self.intersects(Self::ALL)
            }

            fn wants(&self, event: Self) -> bool {
                self.intersects(event)
            }
        }
    };
}

impl_listen_mask!(NodeListenFlags, ANY_NODE);
impl_listen_mask!(EntryListenFlags, ANY_ENTRY);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_excludes_any_bit() {
        assert!(!NodeListenFlags::ALL.contains(NodeListenFlags::ANY_NODE));
        assert!(!EntryListenFlags::ALL.contains(EntryListenFlags::ANY_ENTRY));
    }

    #[test]
    fn test_any_bit_alone_selects_nothing() {
        let mask = NodeListenFlags::ANY_NODE;
        assert!(mask.is_any_target());
        assert!(!mask.selects_events());
    }

    #[test]
    fn test_wants() {
        let mask = EntryListenFlags::ANY_ENTRY | EntryListenFlags::REMOVED;
        assert!(mask.wants(EntryListenFlags::REMOVED));
        assert!(!mask.wants(EntryListenFlags::ADDED));
    }
}
