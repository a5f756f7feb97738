//! Storage failures.

use std::io;
use thiserror::Error;

/// Result alias used throughout this crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// Why a storage request failed.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system rejected a file operation.
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes the store does not hold.
    #[error("bytes {offset}..{} requested from a store of {size} bytes", offset.saturating_add(*len as u64))]
    ReadPastEnd {
        /// First byte asked for.
        offset: u64,
        /// Number of bytes asked for.
        len: usize,
        /// Bytes the store holds.
        size: u64,
    },

    /// A truncation asked to grow the store.
    #[error("cannot shrink a store of {size} bytes to {requested} bytes")]
    GrowByTruncate {
        /// Length asked for.
        requested: u64,
        /// Bytes the store holds.
        size: u64,
    },

    /// An allocator index or item file does not decode.
    #[error("damaged allocator state: {0}")]
    Corrupted(String),

    /// Text that is not an item identifier.
    #[error("invalid item id: {0}")]
    InvalidId(String),

    /// The item, or the file backing it, does not exist.
    #[error("no storage for {0}")]
    NotFound(String),
}

impl StorageError {
    /// Fails unless `offset..offset + len` lies within `size` bytes.
    pub(crate) fn check_read(offset: u64, len: usize, size: u64) -> StorageResult<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Self::ReadPastEnd { offset, len, size }),
        }
    }

    /// Fails if `requested` would grow a store of `size` bytes.
    pub(crate) fn check_truncate(requested: u64, size: u64) -> StorageResult<()> {
        if requested > size {
            return Err(Self::GrowByTruncate { requested, size });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflowing_read_range_is_rejected() {
        assert!(StorageError::check_read(0, 4, 4).is_ok());
        assert!(StorageError::check_read(4, 0, 4).is_ok());
        assert!(matches!(
            StorageError::check_read(u64::MAX, 2, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn messages_name_the_range() {
        let err = StorageError::check_read(3, 5, 4).unwrap_err();
        assert_eq!(err.to_string(), "bytes 3..8 requested from a store of 4 bytes");
        let err = StorageError::check_truncate(9, 2).unwrap_err();
        assert_eq!(err.to_string(), "cannot shrink a store of 2 bytes to 9 bytes");
    }
}
