//! # ramvol-types
//!
//! Identity and flag types shared by the ramvol volume core and its hosts.
//!
//! - [`NodeId`], [`EntryId`], [`SubscriberId`] - counter-backed identifiers
//! - [`NodeListenFlags`], [`EntryListenFlags`] - listener interest masks
//! - [`type_code`], [`BuiltinIndex`] - attribute typing and index naming

pub mod attr;
pub mod flags;
pub mod ids;

pub use attr::{BuiltinIndex, MAX_INDEX_KEY_LENGTH, MAX_NAME_LENGTH, TypeCode, type_code};
pub use flags::{EntryListenFlags, ListenMask, NodeListenFlags};
pub use ids::{EntryId, IdCounter, NodeId, ROOT_PARENT_ID, SubscriberId};
