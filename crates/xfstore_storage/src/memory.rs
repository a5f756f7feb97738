//! Volatile byte stores.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// A byte store kept in process memory.
///
/// Clones share one buffer, so a test can hand a clone to a journal or an
/// [`ItemStorage`](crate::ItemStorage) and inspect or damage the bytes it
/// wrote through the original. Flush and sync have nothing to do.
///
/// ```rust
/// use xfstore_storage::{MemoryBackend, StorageBackend};
///
/// let view = MemoryBackend::new();
/// let mut writer = view.clone();
/// writer.write_at(2, b"ok").unwrap();
/// assert_eq!(view.snapshot(), b"\0\0ok");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `bytes`.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copies out the current content.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Cuts the content to its first `len` bytes without the checks of
    /// [`StorageBackend::truncate`], to simulate a torn write.
    pub fn tear(&self, len: usize) {
        self.bytes.lock().truncate(len);
    }
}

impl StorageBackend for MemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.lock();
        StorageError::check_read(offset, len, bytes.len() as u64)?;
        let start = offset as usize;
        Ok(bytes[start..start + len].to_vec())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.lock();
        let at = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(at)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.lock();
        StorageError::check_truncate(new_size, bytes.len() as u64)?;
        bytes.truncate(new_size as usize);
        Ok(())
    }
}
