//! Crash-safe monotonic id sequences.

use crate::dir::write_atomic;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_BLOCK: u64 = 1024;

/// A persistent, monotonically increasing sequence.
///
/// Ids are handed out from an in-memory block. Before a block is used its
/// upper bound is written to disk, so after a crash the sequence resumes past
/// every id it may have handed out. Ids start at 1.
#[derive(Debug)]
pub struct PersistentSequence {
    path: PathBuf,
    block: u64,
    state: Mutex<SequenceState>,
}

#[derive(Debug)]
struct SequenceState {
    next: u64,
    reserved: u64,
}

impl PersistentSequence {
    /// Opens a sequence stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageCorruption` if the file does not hold a number.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::with_block(path, DEFAULT_BLOCK)
    }

    /// Opens a sequence that reserves `block` ids at a time.
    ///
    /// # Errors
    ///
    /// Returns `StorageCorruption` if the file does not hold a number.
    pub fn with_block(path: &Path, block: u64) -> CoreResult<Self> {
        let reserved = if path.exists() {
            let text = fs::read_to_string(path)?;
            text.trim().parse::<u64>().map_err(|_| {
                CoreError::storage_corruption(format!(
                    "bad sequence file {}: {text:?}",
                    path.display()
                ))
            })?
        } else {
            0
        };
        Ok(Self {
            path: path.to_path_buf(),
            block: block.max(1),
            state: Mutex::new(SequenceState {
                next: reserved + 1,
                reserved,
            }),
        })
    }

    /// Returns the next id.
    ///
    /// # Errors
    ///
    /// Returns an error if a new block cannot be reserved on disk.
    pub fn next(&self) -> CoreResult<u64> {
        let mut state = self.state.lock();
        if state.next > state.reserved {
            let reserved = state.reserved + self.block;
            write_atomic(&self.path, reserved.to_string().as_bytes())?;
            state.reserved = reserved;
        }
        let id = state.next;
        state.next += 1;
        Ok(id)
    }

    /// Ensures future ids are greater than `seen`.
    ///
    /// Used by recovery when it finds ids on disk that the sequence file may
    /// not cover.
    ///
    /// # Errors
    ///
    /// Returns an error if the new bound cannot be written.
    pub fn advance_past(&self, seen: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        if seen >= state.next {
            state.next = seen + 1;
            if seen >= state.reserved {
                write_atomic(&self.path, seen.to_string().as_bytes())?;
                state.reserved = seen;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ids_start_at_one_and_increase() {
        let temp = tempdir().unwrap();
        let seq = PersistentSequence::open(&temp.path().join("s.seq")).unwrap();
        assert_eq!(seq.next().unwrap(), 1);
        assert_eq!(seq.next().unwrap(), 2);
    }

    #[test]
    fn reopen_never_reuses_ids() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("s.seq");
        let last = {
            let seq = PersistentSequence::with_block(&path, 4).unwrap();
            (0..6).map(|_| seq.next().unwrap()).last().unwrap()
        };
        let seq = PersistentSequence::with_block(&path, 4).unwrap();
        assert!(seq.next().unwrap() > last);
    }

    #[test]
    fn advance_past_skips_ahead() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("s.seq");
        let seq = PersistentSequence::with_block(&path, 2).unwrap();
        seq.advance_past(100).unwrap();
        assert_eq!(seq.next().unwrap(), 101);

        let reopened = PersistentSequence::with_block(&path, 2).unwrap();
        assert!(reopened.next().unwrap() > 101);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("s.seq");
        fs::write(&path, "not a number").unwrap();
        assert!(matches!(
            PersistentSequence::open(&path),
            Err(CoreError::StorageCorruption { .. })
        ));
    }
}
