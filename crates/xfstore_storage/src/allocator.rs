//! Storage allocators.
//!
//! An allocator owns the items under one path. It maps each item name to
//! its [`ItemStorage`] and remembers, in a small index file, whether the
//! item was created by a transaction that has not committed yet ("new") or
//! holds committed content ("old").
//!
//! ```text
//! <root>/<path>/
//! ├─ ids.idx          # item index: "O <name>" / "N <name>" lines
//! ├─ <name>.dat       # item data region
//! └─ <name>.meta      # item metadata region
//! ```
//!
//! Index changes are kept in memory until
//! [`StorageAllocator::commit_pending_modifications`] writes the index with
//! a write-then-rename so a crash leaves either the old or the new index.

use crate::error::{StorageError, StorageResult};
use crate::id::ItemId;
use crate::item::ItemStorage;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INDEX_FILE: &str = "ids.idx";
const INDEX_TEMP: &str = "ids.idx.tmp";
const INDEX_HEADER: &str = "XFIDX 1";
const DATA_EXT: &str = "dat";
const META_EXT: &str = "meta";

/// The storage allocator contract the transaction engine relies on.
pub trait StorageAllocator: Send + Sync + fmt::Debug {
    /// Returns the path this allocator serves.
    fn path(&self) -> &str;

    /// Returns true if the item has storage, new or old.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier belongs to another path.
    fn has_item(&self, id: &ItemId) -> StorageResult<bool>;

    /// Returns true if the item was created and never committed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the item has no storage.
    fn is_new(&self, id: &ItemId) -> StorageResult<bool>;

    /// Returns the storage of an item, creating it as new if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the item files cannot be opened.
    fn create(&self, id: &ItemId) -> StorageResult<Arc<ItemStorage>>;

    /// Returns the storage of an existing item.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the item has no storage.
    fn storage(&self, id: &ItemId) -> StorageResult<Arc<ItemStorage>>;

    /// Marks an item as holding committed content.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the item has no storage.
    fn mark_old(&self, id: &ItemId) -> StorageResult<()>;

    /// Deletes an item. A permanent delete removes its files and index entry;
    /// otherwise the item is emptied but keeps its identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be removed.
    fn delete(&self, id: &ItemId, permanently: bool) -> StorageResult<()>;

    /// Durably writes the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    fn commit_pending_modifications(&self) -> StorageResult<()>;

    /// Forgets every new item, or only the listed ones, and returns what was
    /// removed. Files are left for [`StorageAllocator::gc_files`].
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier belongs to another path.
    fn remove_all_new_ids(&self, only: Option<&[ItemId]>) -> StorageResult<Vec<ItemId>>;

    /// Removes item files that no index entry refers to and returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    fn gc_files(&self) -> StorageResult<usize>;

    /// Returns the identifiers of all committed items.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry name is not a valid identifier.
    fn find_ids(&self) -> StorageResult<Vec<ItemId>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdState {
    New,
    Old,
}

#[derive(Default)]
struct AllocatorState {
    index: BTreeMap<String, IdState>,
    open: HashMap<String, Arc<ItemStorage>>,
    dirty: bool,
}

/// A [`StorageAllocator`] that keeps every item of a path in one directory.
pub struct DirectoryAllocator {
    path: String,
    dir: PathBuf,
    state: Mutex<AllocatorState>,
}

impl DirectoryAllocator {
    /// Opens the allocator directory for `path`, loading its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the index is
    /// malformed.
    pub fn open(path: &str, dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let index = load_index(&dir.join(INDEX_FILE))?;
        Ok(Self {
            path: path.to_string(),
            dir: dir.to_path_buf(),
            state: Mutex::new(AllocatorState {
                index,
                ..AllocatorState::default()
            }),
        })
    }

    /// Returns the directory holding this allocator's files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_path(&self, id: &ItemId) -> StorageResult<()> {
        if id.path() == self.path {
            Ok(())
        } else {
            Err(StorageError::InvalidId(format!(
                "{id} does not belong to allocator {}",
                self.path
            )))
        }
    }

    fn files(&self, name: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{name}.{DATA_EXT}")),
            self.dir.join(format!("{name}.{META_EXT}")),
        )
    }

    fn open_storage(
        &self,
        state: &mut AllocatorState,
        id: &ItemId,
    ) -> StorageResult<Arc<ItemStorage>> {
        if let Some(storage) = state.open.get(id.name()) {
            return Ok(Arc::clone(storage));
        }
        let (data, meta) = self.files(id.name());
        let storage = Arc::new(ItemStorage::open(id.clone(), &data, &meta)?);
        state.open.insert(id.name().to_string(), Arc::clone(&storage));
        Ok(storage)
    }

    fn sync_directory(&self) -> StorageResult<()> {
        #[cfg(unix)]
        {
            let dir = File::open(&self.dir)?;
            dir.sync_all()?;
        }
        Ok(())
    }
}

impl StorageAllocator for DirectoryAllocator {
    fn path(&self) -> &str {
        &self.path
    }

    fn has_item(&self, id: &ItemId) -> StorageResult<bool> {
        self.check_path(id)?;
        Ok(self.state.lock().index.contains_key(id.name()))
    }

    fn is_new(&self, id: &ItemId) -> StorageResult<bool> {
        self.check_path(id)?;
        match self.state.lock().index.get(id.name()) {
            Some(state) => Ok(*state == IdState::New),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    fn create(&self, id: &ItemId) -> StorageResult<Arc<ItemStorage>> {
        self.check_path(id)?;
        let mut state = self.state.lock();
        if !state.index.contains_key(id.name()) {
            state.index.insert(id.name().to_string(), IdState::New);
            state.dirty = true;
        }
        self.open_storage(&mut state, id)
    }

    fn storage(&self, id: &ItemId) -> StorageResult<Arc<ItemStorage>> {
        self.check_path(id)?;
        let mut state = self.state.lock();
        if !state.index.contains_key(id.name()) {
            return Err(StorageError::NotFound(id.to_string()));
        }
        self.open_storage(&mut state, id)
    }

    fn mark_old(&self, id: &ItemId) -> StorageResult<()> {
        self.check_path(id)?;
        let mut state = self.state.lock();
        match state.index.get_mut(id.name()) {
            Some(entry) => {
                if *entry == IdState::New {
                    *entry = IdState::Old;
                    state.dirty = true;
                }
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    fn delete(&self, id: &ItemId, permanently: bool) -> StorageResult<()> {
        self.check_path(id)?;
        let mut state = self.state.lock();
        if !permanently {
            if state.index.contains_key(id.name()) {
                self.open_storage(&mut state, id)?.clear()?;
            }
            return Ok(());
        }

        state.open.remove(id.name());
        if state.index.remove(id.name()).is_some() {
            state.dirty = true;
        }
        let (data, meta) = self.files(id.name());
        for file in [data, meta] {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn commit_pending_modifications(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }

        let mut text = String::from(INDEX_HEADER);
        text.push('\n');
        for (name, id_state) in &state.index {
            let tag = match id_state {
                IdState::New => 'N',
                IdState::Old => 'O',
            };
            text.push(tag);
            text.push(' ');
            text.push_str(name);
            text.push('\n');
        }

        let temp_path = self.dir.join(INDEX_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.dir.join(INDEX_FILE))?;
        self.sync_directory()?;
        state.dirty = false;
        Ok(())
    }

    fn remove_all_new_ids(&self, only: Option<&[ItemId]>) -> StorageResult<Vec<ItemId>> {
        let wanted: Option<BTreeSet<&str>> = match only {
            Some(ids) => {
                for id in ids {
                    self.check_path(id)?;
                }
                Some(ids.iter().map(ItemId::name).collect())
            }
            None => None,
        };

        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .index
            .iter()
            .filter(|(name, id_state)| {
                **id_state == IdState::New
                    && wanted.as_ref().map_or(true, |w| w.contains(name.as_str()))
            })
            .map(|(name, _)| name.clone())
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for name in doomed {
            state.index.remove(&name);
            state.open.remove(&name);
            state.dirty = true;
            removed.push(ItemId::new(&self.path, &name)?);
        }
        Ok(removed)
    }

    fn gc_files(&self) -> StorageResult<usize> {
        let state = self.state.lock();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|e| e.to_str()),
            ) else {
                continue;
            };
            let item_file = ext == DATA_EXT || ext == META_EXT;
            if item_file && !state.index.contains_key(stem) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn find_ids(&self) -> StorageResult<Vec<ItemId>> {
        let state = self.state.lock();
        state
            .index
            .iter()
            .filter(|(_, id_state)| **id_state == IdState::Old)
            .map(|(name, _)| ItemId::new(&self.path, name))
            .collect()
    }
}

impl fmt::Debug for DirectoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryAllocator")
            .field("path", &self.path)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

fn load_index(index_path: &Path) -> StorageResult<BTreeMap<String, IdState>> {
    let mut index = BTreeMap::new();
    if !index_path.exists() {
        return Ok(index);
    }

    let text = fs::read_to_string(index_path)?;
    let mut lines = text.lines();
    match lines.next() {
        Some(INDEX_HEADER) => {}
        None => return Ok(index),
        Some(other) => {
            return Err(StorageError::Corrupted(format!(
                "bad index header {other:?} in {}",
                index_path.display()
            )))
        }
    }

    for line in lines.filter(|l| !l.is_empty()) {
        let (id_state, name) = if let Some(name) = line.strip_prefix("N ") {
            (IdState::New, name)
        } else if let Some(name) = line.strip_prefix("O ") {
            (IdState::Old, name)
        } else {
            return Err(StorageError::Corrupted(format!(
                "bad index line {line:?} in {}",
                index_path.display()
            )));
        };
        index.insert(name.to_string(), id_state);
    }
    Ok(index)
}

/// Hands out one [`DirectoryAllocator`] per path under a storage root.
#[derive(Debug)]
pub struct AllocatorFactory {
    root: PathBuf,
    allocators: Mutex<HashMap<String, Arc<DirectoryAllocator>>>,
}

impl AllocatorFactory {
    /// Creates a factory rooted at `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            allocators: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Finds the allocator responsible for `id`.
    ///
    /// Returns `None` when the path has never been used and `create_if_absent`
    /// is false.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator directory cannot be opened.
    pub fn find_allocator(
        &self,
        id: &ItemId,
        create_if_absent: bool,
    ) -> StorageResult<Option<Arc<dyn StorageAllocator>>> {
        self.allocator_for_path(id.path(), create_if_absent)
    }

    /// Finds the allocator for a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator directory cannot be opened.
    pub fn allocator_for_path(
        &self,
        path: &str,
        create_if_absent: bool,
    ) -> StorageResult<Option<Arc<dyn StorageAllocator>>> {
        let mut allocators = self.allocators.lock();
        if let Some(allocator) = allocators.get(path) {
            return Ok(Some(Arc::clone(allocator) as Arc<dyn StorageAllocator>));
        }

        let dir = self.root.join(path.trim_start_matches('/'));
        if !create_if_absent && !dir.join(INDEX_FILE).exists() {
            return Ok(None);
        }

        let allocator = Arc::new(DirectoryAllocator::open(path, &dir)?);
        allocators.insert(path.to_string(), Arc::clone(&allocator));
        Ok(Some(allocator as Arc<dyn StorageAllocator>))
    }

    /// Returns every allocator opened so far.
    #[must_use]
    pub fn open_allocators(&self) -> Vec<Arc<dyn StorageAllocator>> {
        self.allocators
            .lock()
            .values()
            .map(|a| Arc::clone(a) as Arc<dyn StorageAllocator>)
            .collect()
    }
}
