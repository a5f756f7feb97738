//! Blob file placement.

use crate::error::StorageResult;
use crate::id::ItemId;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix of the per-blob directory holding staged transaction files.
pub const TRANSACTION_DIR_SUFFIX: &str = ".xactions";

/// Name of the shared empty-file sentinel linked in for new blobs.
pub const SENTINEL_NAME: &str = "sentinel";

/// Maps blob identifiers to files under a blob root.
///
/// A blob `/a/b/c` lives at `<root>/a/b/c`; its staged files live in
/// `<root>/a/b/c.xactions/`.
#[derive(Debug, Clone)]
pub struct BlobLocator {
    root: PathBuf,
}

impl BlobLocator {
    /// Creates a locator rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    pub fn new(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the blob root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file holding committed blob content.
    #[must_use]
    pub fn target_file(&self, id: &ItemId) -> PathBuf {
        self.root.join(id.relative_path()).join(id.name())
    }

    /// Returns the directory holding staged files for `id`.
    #[must_use]
    pub fn transaction_dir(&self, id: &ItemId) -> PathBuf {
        self.root
            .join(id.relative_path())
            .join(format!("{}{TRANSACTION_DIR_SUFFIX}", id.name()))
    }

    /// Returns the shared sentinel file.
    #[must_use]
    pub fn sentinel_file(&self) -> PathBuf {
        self.root.join(SENTINEL_NAME)
    }

    /// Lists committed blobs directly under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn find_ids(&self, path: &str) -> StorageResult<Vec<ItemId>> {
        let dir = self.root.join(path.trim_start_matches('/'));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == SENTINEL_NAME && dir == self.root {
                continue;
            }
            if let Ok(id) = ItemId::new(path, &name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_for_nested_blob() {
        let dir = tempdir().unwrap();
        let locator = BlobLocator::new(dir.path()).unwrap();
        let id = ItemId::parse("/blob/b").unwrap();

        assert_eq!(locator.target_file(&id), dir.path().join("blob").join("b"));
        assert_eq!(
            locator.transaction_dir(&id),
            dir.path().join("blob").join("b.xactions")
        );
    }

    #[test]
    fn find_ids_skips_staging_dirs_and_sentinel() {
        let dir = tempdir().unwrap();
        let locator = BlobLocator::new(dir.path()).unwrap();
        fs::write(locator.sentinel_file(), b"").unwrap();
        fs::create_dir_all(dir.path().join("blob").join("x.xactions")).unwrap();
        fs::write(dir.path().join("blob").join("x"), b"1").unwrap();
        fs::write(dir.path().join("blob").join("y"), b"2").unwrap();

        let ids = locator.find_ids("/blob").unwrap();
        assert_eq!(
            ids,
            vec![
                ItemId::parse("/blob/x").unwrap(),
                ItemId::parse("/blob/y").unwrap()
            ]
        );
        assert!(locator.find_ids("/").unwrap().is_empty());
        assert!(locator.find_ids("/missing").unwrap().is_empty());
    }
}
