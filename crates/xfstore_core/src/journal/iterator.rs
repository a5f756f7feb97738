//! Streaming journal iterator.
//!
//! Reads entries one at a time through a bounded buffer, so replaying a large
//! journal during commit or recovery keeps memory flat.

use crate::error::CoreResult;
use crate::journal::entry::{frame_len, JournalEntry, PREFIX_SIZE};
use std::path::Path;
use xfstore_storage::{FileBackend, OpenMode, StorageBackend};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A streaming iterator over `(offset, entry)` pairs.
///
/// A truncated final entry ends iteration cleanly. Corruption is returned
/// once as an error, after which the iterator is exhausted.
pub struct JournalIterator {
    backend: Box<dyn StorageBackend>,
    total_size: u64,
    /// File offset of `buffer[0]`.
    buffer_offset: u64,
    buffer: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl JournalIterator {
    /// Iterates over a journal held by `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            buffer_offset: 0,
            buffer: Vec::new(),
            pos: 0,
            finished: false,
        })
    }

    /// Opens the journal file at `path`. A missing file yields no entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            let mut empty = Self::new(Box::new(xfstore_storage::MemoryBackend::new()))?;
            empty.finished = true;
            return Ok(empty);
        }
        Self::new(Box::new(FileBackend::open(path, OpenMode::Existing)?))
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Makes at least `want` bytes available from `pos`, returning false at EOF.
    fn fill(&mut self, want: usize) -> CoreResult<bool> {
        if self.available() >= want {
            return Ok(true);
        }
        self.buffer.drain(..self.pos);
        self.buffer_offset += self.pos as u64;
        self.pos = 0;

        let read_from = self.buffer_offset + self.buffer.len() as u64;
        let remaining = self.total_size.saturating_sub(read_from);
        let missing = (want - self.buffer.len()) as u64;
        if remaining < missing {
            return Ok(false);
        }
        let chunk = remaining.min(missing.max(READ_BUFFER_SIZE as u64)) as usize;
        let data = self.backend.read_at(read_from, chunk)?;
        self.buffer.extend_from_slice(&data);
        Ok(self.available() >= want)
    }

    fn next_entry(&mut self) -> CoreResult<Option<(u64, JournalEntry)>> {
        let offset = self.buffer_offset + self.pos as u64;
        let mut want = PREFIX_SIZE;
        loop {
            if !self.fill(want)? {
                return Ok(None);
            }
            let needed = frame_len(&self.buffer[self.pos..], offset)?;
            if needed <= want {
                break;
            }
            want = needed;
        }
        match JournalEntry::decode(&self.buffer[self.pos..self.pos + want], offset)? {
            Some((entry, used)) => {
                self.pos += used;
                Ok(Some((offset, entry)))
            }
            None => Ok(None),
        }
    }
}

impl Iterator for JournalIterator {
    type Item = CoreResult<(u64, JournalEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(error) => {
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}
