//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store holding one item's data or metadata, or one journal.
///
/// Backends are **opaque**. They do not know about journal envelopes,
/// interval metadata or point trees; the transaction engine owns every
/// format. Unlike a pure log, a backend also supports positional writes,
/// since range items are updated in place at commit.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `write_at` past the current end extends the store, zero-filling any gap
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes every earlier write durable
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends past
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, growing the store when needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the store and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and file metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Shrinks the store to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::GrowByTruncate`] if `new_size` exceeds
    /// the current size, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Replaces the whole content of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation or the write fails.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.truncate(0)?;
        self.write_at(0, data)
    }

    /// Reads the whole content of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
