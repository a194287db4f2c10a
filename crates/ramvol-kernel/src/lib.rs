//! # ramvol-kernel
//!
//! Core of an in-memory filesystem volume.
//!
//! A [`Volume`] owns the node/entry hierarchy of one mount and mediates
//! between the host kernel's vnode layer and the filesystem code above it:
//! - Node and entry tables index the hierarchy by id and by (directory, name)
//! - Listener registries notify interested parties of nodes and entries
//!   coming and going, synchronously and in a fixed order
//! - The index directory keeps name, last-modified, size and attribute indices
//! - Live queries are re-evaluated on every attribute change
//!
//! Nothing here installs a tracing subscriber; that is up to the binary.

pub mod config;
pub mod entry;
pub mod error;
pub mod host;
pub mod index;
pub mod listener;
pub mod lock;
pub mod node;
pub mod query;
pub mod subscriber;
pub mod table;
pub mod volume;

pub use config::{DEFAULT_ROOT_MODE, DEFAULT_VOLUME_NAME, VolumeConfig};
pub use entry::Entry;
pub use error::{VolError, VolResult};
pub use host::{HostOp, MemoryHost, VnodeHost, VolumeHandle};
pub use index::{AttributeIndex, Index, IndexDirectory, NameIndex, NodeValueIndex};
pub use listener::{
    EntryListener, EntryListenerHandle, EntryListenerRegistry, ListenerRegistry, NodeListener,
    NodeListenerHandle, NodeListenerRegistry,
};
pub use lock::{RecursiveGuard, RecursiveLock, VolumeLock, VolumeReadGuard, VolumeWriteGuard};
pub use node::{Attribute, Node, NodeKind};
pub use query::{AttributeMatchQuery, LiveQuery, LiveUpdate, MatchChange, QueryHandle, QueryRegistry};
pub use subscriber::Subscriber;
pub use table::{DirectoryEntryTable, NodeTable};
pub use volume::{AllocationInfo, Hierarchy, MountStep, Volume, VolumeStats, VolumeWriter};

pub use ramvol_types::{
    BuiltinIndex, EntryId, EntryListenFlags, ListenMask, NodeId, NodeListenFlags, ROOT_PARENT_ID,
    SubscriberId, TypeCode, type_code,
};
