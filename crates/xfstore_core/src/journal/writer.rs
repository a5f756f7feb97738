//! Journal appends and random-access reads.

use crate::error::{CoreError, CoreResult};
use crate::journal::entry::{encode_parts, frame_len, JournalEntry, PREFIX_SIZE};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use xfstore_storage::{FileBackend, ItemId, OpenMode, StorageBackend};

/// An open, appendable journal.
///
/// Client threads of one transaction append concurrently; each append is
/// written as one contiguous frame and returns its start offset, which items
/// keep to read the entry back later.
pub struct Journal {
    path: PathBuf,
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl Journal {
    /// Opens or creates the journal file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open(path, OpenMode::CreateWithParents)?;
        Ok(Self::with_backend(path, Box::new(backend)))
    }

    /// Creates a journal over an arbitrary backend.
    #[must_use]
    pub fn with_backend(path: &Path, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            path: path.to_path_buf(),
            backend: Mutex::new(backend),
        }
    }

    /// Returns the journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an entry and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is too large or the write fails.
    pub fn append(&self, id: &ItemId, dest: i64, payload: &[u8]) -> CoreResult<u64> {
        let frame = encode_parts(id, dest, payload)?;
        Ok(self.backend.lock().append(&frame)?)
    }

    /// Reads the entry starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `JournalCorruption` if no complete, valid entry starts there.
    pub fn read_entry(&self, offset: u64) -> CoreResult<JournalEntry> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        let mut want = PREFIX_SIZE;
        loop {
            if offset.saturating_add(want as u64) > size {
                return Err(CoreError::journal_corruption(format!(
                    "entry at offset {offset} runs past journal end {size}"
                )));
            }
            let buf = backend.read_at(offset, want)?;
            let needed = frame_len(&buf, offset)?;
            if needed <= want {
                return match JournalEntry::decode(&buf, offset)? {
                    Some((entry, _)) => Ok(entry),
                    None => Err(CoreError::journal_corruption(format!(
                        "incomplete entry at offset {offset}"
                    ))),
                };
            }
            want = needed;
        }
    }

    /// Returns the journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Pushes buffered appends to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        Ok(self.backend.lock().flush()?)
    }

    /// Makes every append durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.flush()?;
        Ok(backend.sync()?)
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use xfstore_storage::MemoryBackend;

    fn journal() -> Journal {
        Journal::with_backend(Path::new("mem"), Box::new(MemoryBackend::new()))
    }

    #[test]
    fn append_returns_addressable_offsets() {
        let journal = journal();
        let a = ItemId::parse("/ts/a").unwrap();
        let b = ItemId::parse("/ts/b").unwrap();
        let first = journal.append(&a, 0, b"ABCD").unwrap();
        let second = journal.append(&b, -2, &[7u8; 300]).unwrap();
        assert_eq!(first, 0);
        assert!(second > first);

        let entry = journal.read_entry(second).unwrap();
        assert_eq!(entry.id, b);
        assert_eq!(entry.dest, -2);
        assert_eq!(entry.payload.len(), 300);
        assert_eq!(journal.read_entry(first).unwrap().payload, b"ABCD");
    }

    #[test]
    fn read_past_end_is_corruption() {
        let journal = journal();
        let a = ItemId::parse("/ts/a").unwrap();
        journal.append(&a, 0, b"x").unwrap();
        assert!(matches!(
            journal.read_entry(10_000),
            Err(CoreError::JournalCorruption { .. })
        ));
        assert!(journal.read_entry(1).is_err());
    }

    #[test]
    fn concurrent_appends_stay_framed() {
        let journal = Arc::new(journal());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let journal = Arc::clone(&journal);
                std::thread::spawn(move || {
                    let id = ItemId::parse(&format!("/ts/t{t}")).unwrap();
                    (0..50)
                        .map(|i| journal.append(&id, i, &[t as u8; 17]).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for (t, handle) in handles.into_iter().enumerate() {
            for offset in handle.join().unwrap() {
                let entry = journal.read_entry(offset).unwrap();
                assert_eq!(entry.payload, vec![t as u8; 17]);
            }
        }
    }
}
