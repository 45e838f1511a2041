#![forbid(unsafe_code)]
//! Shared identifiers, link encoding and the storage error type.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Checksum helpers used by log framing.
pub mod checksum;

pub use checksum::{frame_crc32, Checksum, Crc32Fast};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

record_id!(
    /// Slot id of a node record.
    NodeId
);
record_id!(
    /// Slot id of a relationship record.
    RelId
);
record_id!(
    /// Slot id of a property record.
    PropertyId
);
record_id!(
    /// Slot id of a property-key record.
    PropertyKeyId
);
record_id!(
    /// Slot id of a relationship-type record.
    RelTypeId
);
record_id!(
    /// Slot id of a block in a dynamic store.
    BlockId
);

/// On-disk encoding of an absent 4-byte link.
pub const NO_LINK: u32 = u32::MAX;

/// Exclusive upper bound for ids addressable through a 4-byte link.
pub const LINK_ID_LIMIT: u64 = NO_LINK as u64;

/// Encodes an optional link into its 4-byte on-disk form.
pub fn encode_link<T: Into<u64>>(link: Option<T>) -> u32 {
    match link {
        Some(id) => {
            let raw: u64 = id.into();
            debug_assert!(raw < LINK_ID_LIMIT, "link id exceeds 4-byte range");
            raw as u32
        }
        None => NO_LINK,
    }
}

/// Decodes a 4-byte on-disk link.
pub fn decode_link<T: From<u64>>(raw: u32) -> Option<T> {
    if raw == NO_LINK {
        None
    } else {
        Some(T::from(u64::from(raw)))
    }
}

/// Errors raised by the record storage layer.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk content failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an invalid argument (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Requested record is not in use.
    #[error("not found")]
    NotFound,
    /// The id sidecar file cannot be trusted and must be rebuilt.
    #[error("invalid id generator {path}: {reason}")]
    InvalidIdGenerator {
        /// Sidecar path.
        path: PathBuf,
        /// What failed validation.
        reason: &'static str,
    },
    /// Another process holds the store's advisory lock.
    #[error("store {0} is locked by another process")]
    StoreLocked(PathBuf),
    /// The store carries an older descriptor of the same type.
    #[error("store {path} needs upgrade: found {found:?}, expected {expected:?}")]
    NeedsUpgrade {
        /// Store file path.
        path: PathBuf,
        /// Descriptor found at the end of the file.
        found: String,
        /// Descriptor this build writes.
        expected: String,
    },
    /// The store is not ok and requires repair before writes.
    #[error("store {0} is not ok, repair required")]
    NotOk(PathBuf),
    /// A write was attempted against a read-only store.
    #[error("read only: {0}")]
    ReadOnly(&'static str),
    /// Persisting store state failed after retries.
    #[error("underlying storage failure: {0}")]
    UnderlyingStorage(String),
    /// Storage creation found an existing file.
    #[error("store {0} already exists")]
    AlreadyExists(PathBuf),
    /// Another open transaction holds the record's write lock.
    #[error("write conflict: {record} is locked by transaction {holder}")]
    WriteConflict {
        /// The contended record.
        record: String,
        /// Log identifier of the holding transaction.
        holder: u32,
    },
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True when the error came from an end-of-file read.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, StoreError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_encoding_uses_sentinel_for_none() {
        assert_eq!(encode_link::<NodeId>(None), NO_LINK);
        assert_eq!(encode_link(Some(NodeId(7))), 7);
        assert_eq!(decode_link::<RelId>(NO_LINK), None);
        assert_eq!(decode_link::<RelId>(42), Some(RelId(42)));
    }

    #[test]
    fn ids_display_as_numbers() {
        assert_eq!(NodeId(12).to_string(), "12");
        assert_eq!(u64::from(BlockId(3)), 3);
    }
}
