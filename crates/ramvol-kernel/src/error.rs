//! Volume error types.

use std::io;

use ramvol_types::NodeId;
use thiserror::Error;

/// Volume error type.
#[derive(Debug, Error)]
pub enum VolError {
    /// Null, empty, or malformed input.
    #[error("bad value: {0}")]
    BadValue(String),

    /// An allocation step failed.
    #[error("out of memory")]
    NoMemory,

    /// Lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// The volume is not mounted.
    #[error("volume is not mounted")]
    NotMounted,

    /// Target already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The host returned a different node for an id than the one we own.
    #[error("two nodes have the same id: {0}")]
    IdCollision(NodeId),

    /// The host vnode layer refused the request.
    #[error("host error: {0}")]
    Host(String),
}

impl VolError {
    /// Create a BadValue error.
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(what: impl Into<String>) -> Self {
        Self::NotADirectory(what.into())
    }

    /// Create a Host error.
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Whether this is an ordinary lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::collections::TryReserveError> for VolError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::NoMemory
    }
}

/// Convert VolError to std::io::Error for host glue.
impl From<VolError> for io::Error {
    fn from(e: VolError) -> Self {
        match e {
            VolError::BadValue(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VolError::NoMemory => io::Error::new(io::ErrorKind::OutOfMemory, "out of memory"),
            VolError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VolError::NotMounted => {
                io::Error::new(io::ErrorKind::InvalidInput, "volume is not mounted")
            }
            VolError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VolError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VolError::IdCollision(id) => {
                io::Error::other(format!("two nodes have the same id: {id}"))
            }
            VolError::Host(msg) => io::Error::other(msg),
        }
    }
}

/// Volume result type.
pub type VolResult<T> = Result<T, VolError>;
