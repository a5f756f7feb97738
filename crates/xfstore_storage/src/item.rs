//! Per-item storage handles.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::file::{FileBackend, OpenMode};
use crate::id::ItemId;
use crate::memory::MemoryBackend;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;

/// The durable byte ranges of one item: a data region and a metadata region.
///
/// Range items keep raw bytes in the data region and their interval metadata
/// in the metadata region. Point items keep their encoded point tree in the
/// data region and leave metadata empty.
pub struct ItemStorage {
    id: ItemId,
    data: Mutex<Box<dyn StorageBackend>>,
    meta: Mutex<Box<dyn StorageBackend>>,
}

impl ItemStorage {
    /// Opens the data and metadata files of an item, creating them if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be opened.
    pub fn open(id: ItemId, data_path: &Path, meta_path: &Path) -> StorageResult<Self> {
        let data = FileBackend::open(data_path, OpenMode::CreateWithParents)?;
        let meta = FileBackend::open(meta_path, OpenMode::CreateWithParents)?;
        Ok(Self::with_backends(id, Box::new(data), Box::new(meta)))
    }

    /// Creates storage over arbitrary backends.
    #[must_use]
    pub fn with_backends(
        id: ItemId,
        data: Box<dyn StorageBackend>,
        meta: Box<dyn StorageBackend>,
    ) -> Self {
        Self {
            id,
            data: Mutex::new(data),
            meta: Mutex::new(meta),
        }
    }

    /// Creates storage held entirely in memory.
    #[must_use]
    pub fn in_memory(id: ItemId) -> Self {
        Self::with_backends(
            id,
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
        )
    }

    /// Returns the item this storage belongs to.
    #[must_use]
    pub fn id(&self) -> &ItemId {
        &self.id
    }

    /// Reads up to `len` data bytes at `offset`, clipped to the data size.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_data(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.lock();
        let size = data.size()?;
        if offset >= size {
            return Ok(Vec::new());
        }
        let available = (size - offset).min(len as u64) as usize;
        data.read_at(offset, available)
    }

    /// Writes data bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_data(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.data.lock().write_at(offset, bytes)
    }

    /// Reads the whole data region.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_all_data(&self) -> StorageResult<Vec<u8>> {
        self.data.lock().read_all()
    }

    /// Replaces the whole data region.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn replace_data(&self, bytes: &[u8]) -> StorageResult<()> {
        self.data.lock().replace(bytes)
    }

    /// Returns the size of the data region.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    pub fn data_len(&self) -> StorageResult<u64> {
        self.data.lock().size()
    }

    /// Reads the whole metadata region.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_meta(&self) -> StorageResult<Vec<u8>> {
        self.meta.lock().read_all()
    }

    /// Replaces the whole metadata region.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn replace_meta(&self, bytes: &[u8]) -> StorageResult<()> {
        self.meta.lock().replace(bytes)
    }

    /// Discards both regions, leaving an empty item.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails.
    pub fn clear(&self) -> StorageResult<()> {
        self.data.lock().truncate(0)?;
        self.meta.lock().truncate(0)
    }

    /// Makes both regions durable.
    ///
    /// # Errors
    ///
    /// Returns an error if either sync fails.
    pub fn sync(&self) -> StorageResult<()> {
        self.data.lock().sync()?;
        self.meta.lock().sync()
    }
}

impl fmt::Debug for ItemStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemStorage")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> ItemStorage {
        ItemStorage::in_memory(ItemId::parse("/ts/a").unwrap())
    }

    #[test]
    fn read_data_clips_to_size() {
        let storage = storage();
        storage.write_data(0, b"ABCD").unwrap();
        assert_eq!(storage.read_data(2, 100).unwrap(), b"CD");
        assert!(storage.read_data(10, 4).unwrap().is_empty());
    }

    #[test]
    fn clear_empties_both_regions() {
        let storage = storage();
        storage.write_data(0, b"data").unwrap();
        storage.replace_meta(b"meta").unwrap();
        storage.clear().unwrap();
        assert_eq!(storage.data_len().unwrap(), 0);
        assert!(storage.read_meta().unwrap().is_empty());
    }
}
