//! Attribute type codes and index naming.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Longest key an index stores for one value; longer values are truncated.
pub const MAX_INDEX_KEY_LENGTH: usize = 256;

/// Longest accepted volume or entry name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Four-character type code of an attribute value.
pub type TypeCode = u32;

/// Well-known attribute type codes.
pub mod type_code {
    use super::TypeCode;

    const fn fourcc(code: &[u8; 4]) -> TypeCode {
        u32::from_be_bytes(*code)
    }

    /// Null-terminated string.
    pub const STRING: TypeCode = fourcc(b"CSTR");
    /// Signed 32-bit integer.
    pub const INT32: TypeCode = fourcc(b"LONG");
    /// Unsigned 32-bit integer.
    pub const UINT32: TypeCode = fourcc(b"ULNG");
    /// Signed 64-bit integer.
    pub const INT64: TypeCode = fourcc(b"LLNG");
    /// Unsigned 64-bit integer.
    pub const UINT64: TypeCode = fourcc(b"ULLG");
    /// 32-bit float.
    pub const FLOAT: TypeCode = fourcc(b"FLOT");
    /// 64-bit float.
    pub const DOUBLE: TypeCode = fourcc(b"DBLE");
    /// MIME type string.
    pub const MIME_STRING: TypeCode = fourcc(b"MIMS");
    /// Opaque bytes.
    pub const RAW: TypeCode = fourcc(b"RAWT");
}

/// The indices every mounted volume carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinIndex {
    /// Entry names.
    Name,
    /// Node modification times.
    LastModified,
    /// Node content sizes.
    Size,
}

impl BuiltinIndex {
    /// The on-volume index name (`name`, `last_modified`, `size`).
    pub fn index_name(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::LastModified => "last_modified",
            Self::Size => "size",
        }
    }

    /// Type code of the keys the index stores.
    pub fn key_type(&self) -> TypeCode {
        match self {
            Self::Name => type_code::STRING,
            Self::LastModified => type_code::INT64,
            Self::Size => type_code::INT64,
        }
    }
}
