//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How [`FileBackend::open`] treats a missing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the file if it does not exist.
    Create,
    /// Create the file and any missing parent directories.
    CreateWithParents,
    /// Fail with [`StorageError::NotFound`] if the file does not exist.
    Existing,
}

#[derive(Debug)]
struct FileState {
    file: File,
    len: u64,
    // Known position of the OS cursor; `None` after a failed operation.
    cursor: Option<u64>,
}

impl FileState {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if self.cursor != Some(offset) {
            self.cursor = None;
            self.file.seek(SeekFrom::Start(offset))?;
            self.cursor = Some(offset);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek_to(offset)?;
        self.cursor = None;
        self.file.write_all(data)?;
        let end = offset + data.len() as u64;
        self.cursor = Some(end);
        self.len = self.len.max(end);
        Ok(())
    }
}

/// A storage backend over one OS file.
///
/// Used for item data and metadata files and for transaction journals.
/// Journals are written sequentially, so the backend remembers where the
/// OS cursor is and only seeks when an access is not contiguous.
///
/// `flush()` pushes data to the OS; `sync()` calls `File::sync_all()`.
///
/// # Example
///
/// ```no_run
/// use xfstore_storage::{FileBackend, OpenMode, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("item.dat"), OpenMode::Create).unwrap();
/// backend.write_at(128, b"payload").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileBackend {
    /// Opens the file at `path` according to `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for a missing file in
    /// [`OpenMode::Existing`], or an I/O error.
    pub fn open(path: &Path, mode: OpenMode) -> StorageResult<Self> {
        match mode {
            OpenMode::Existing if !path.exists() => {
                return Err(StorageError::NotFound(path.display().to_string()));
            }
            OpenMode::CreateWithParents => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            _ => {}
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(mode != OpenMode::Existing)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(FileState {
                file,
                len,
                cursor: Some(0),
            }),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.state.lock();
        StorageError::check_read(offset, len, state.len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        state.seek_to(offset)?;
        state.cursor = None;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        state.cursor = Some(offset + len as u64);
        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if !data.is_empty() {
            self.state.get_mut().write_at(offset, data)?;
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = self.state.get_mut();
        let offset = state.len;
        if !data.is_empty() {
            state.write_at(offset, data)?;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.state.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.get_mut().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let state = self.state.get_mut();
        StorageError::check_truncate(new_size, state.len)?;
        state.file.set_len(new_size)?;
        state.len = new_size;
        state.cursor = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_mode_makes_an_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("item.dat");

        let backend = FileBackend::open(&path, OpenMode::Create).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn positional_writes_overlay() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("item.dat"), OpenMode::Create).unwrap();

        backend.write_at(0, b"ABCD").unwrap();
        backend.write_at(2, b"xyz").unwrap();

        assert_eq!(backend.size().unwrap(), 5);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"ABxyz");
    }

    #[test]
    fn append_follows_the_highest_write() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("journal"), OpenMode::Create).unwrap();

        backend.write_at(10, b"a").unwrap();
        let offset = backend.append(b"b").unwrap();
        assert_eq!(offset, 11);
        assert_eq!(backend.read_at(0, 10).unwrap(), vec![0u8; 10]);
        assert_eq!(backend.read_at(10, 2).unwrap(), b"ab");
    }

    #[test]
    fn reads_after_truncate_reseek() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("meta"), OpenMode::Create).unwrap();
        backend.append(b"long metadata").unwrap();
        backend.replace(b"short").unwrap();
        let offset = backend.append(b"!").unwrap();

        assert_eq!(offset, 5);
        assert_eq!(backend.read_all().unwrap(), b"short!");
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("item.dat"), OpenMode::Create).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn content_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("item.meta");

        {
            let mut backend = FileBackend::open(&path, OpenMode::Create).unwrap();
            backend.replace(b"metadata").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path, OpenMode::Existing).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"metadata");
    }

    #[test]
    fn existing_mode_refuses_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent");
        let result = FileBackend::open(&path, OpenMode::Existing);
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(!path.exists());
    }

    #[test]
    fn parents_are_created_on_request() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("item.dat");

        assert!(FileBackend::open(&path, OpenMode::Create).is_err());
        let backend = FileBackend::open(&path, OpenMode::CreateWithParents).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}
