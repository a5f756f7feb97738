//! On-disk layout of an engine and small durability helpers.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK              # held with an advisory lock while an engine runs
//! ├─ xlog/             # recovery logs and transaction journals
//! ├─ series/           # range item allocators
//! ├─ points/           # point item allocators
//! ├─ blob/             # blob files
//! ├─ commit-order.seq
//! └─ local-xid.seq
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// A directory or file inside the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Area {
    Xlog,
    Series,
    Points,
    Blob,
    CommitOrder,
    LocalXids,
}

impl Area {
    const DIRECTORIES: [Area; 4] = [Area::Xlog, Area::Series, Area::Points, Area::Blob];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Area::Xlog => "xlog",
            Area::Series => "series",
            Area::Points => "points",
            Area::Blob => "blob",
            Area::CommitOrder => "commit-order.seq",
            Area::LocalXids => "local-xid.seq",
        }
    }
}

/// A data directory held by one engine.
///
/// The advisory lock on `LOCK` lives as long as this value, so a second
/// engine in any process fails with `DataDirLocked`.
#[derive(Debug)]
pub struct DataDir {
    root: PathBuf,
    _held: File,
}

impl DataDir {
    /// Locks `root` and makes sure every storage area exists.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if `root` is missing and `create_if_missing` is
    /// false or if it is not a directory, `DataDirLocked` if another engine
    /// holds it, or an I/O error.
    pub fn open(root: &Path, create_if_missing: bool) -> CoreResult<Self> {
        match (root.exists(), create_if_missing) {
            (false, true) => fs::create_dir_all(root)?,
            (false, false) => {
                return Err(CoreError::invalid_operation(format!(
                    "no data directory at {}",
                    root.display()
                )))
            }
            (true, _) if !root.is_dir() => {
                return Err(CoreError::invalid_operation(format!(
                    "{} exists and is not a directory",
                    root.display()
                )))
            }
            (true, _) => {}
        }

        let held = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        held.try_lock_exclusive().map_err(|_| CoreError::DataDirLocked)?;

        for area in Area::DIRECTORIES {
            fs::create_dir_all(root.join(area.name()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            _held: held,
        })
    }

    /// Returns the root of the data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub(crate) fn area(&self, area: Area) -> PathBuf {
        self.root.join(area.name())
    }
}

/// Replaces `path` with `data` so a crash leaves either the old or the new
/// content.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    let staged = path.with_extension("tmp");
    {
        let mut file = File::create(&staged)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&staged, path)?;
    match path.parent() {
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

/// Makes directory entry changes durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn every_area_directory_is_created() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("store");
        let dir = DataDir::open(&root, true).unwrap();

        for area in Area::DIRECTORIES {
            assert!(dir.area(area).is_dir(), "{}", area.name());
        }
        assert!(!dir.area(Area::CommitOrder).exists());
        assert!(root.join(LOCK_FILE).exists());
    }

    #[test]
    fn missing_root_needs_create_flag() {
        let temp = tempdir().unwrap();
        let result = DataDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn plain_file_is_not_a_data_directory() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            DataDir::open(&file, true),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn one_engine_per_directory_until_drop() {
        let temp = tempdir().unwrap();
        let first = DataDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            DataDir::open(temp.path(), true),
            Err(CoreError::DataDirLocked)
        ));
        drop(first);
        assert!(DataDir::open(temp.path(), true).is_ok());
    }

    #[test]
    fn atomic_write_leaves_no_staging_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("value.seq");
        write_atomic(&path, b"1").unwrap();
        write_atomic(&path, b"22").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"22");
        assert!(!path.with_extension("tmp").exists());
    }
}
