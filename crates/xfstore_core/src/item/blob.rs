//! Whole-item blobs.
//!
//! A blob is one file. A transaction stages the full new content in
//! `<name>.xactions/<xid>.dirty`; prepare hard-links the current file (or the
//! shared sentinel when the blob is new) as `<name>.xactions/rollback`; commit
//! renames the dirty file over the target and drops the link; rollback
//! restores from the link.
//!
//! Every blob file starts with a ten byte header: version, state and
//! originator.

use crate::dir::sync_dir;
use crate::error::{CoreError, CoreResult};
use crate::item::{ByteReader, ItemCore, ItemJournals, StateFlags, TransactionalItem, TxState};
use crate::lock::ItemLock;
use crate::types::{ItemKey, ItemKind, Xid};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xfstore_storage::{BlobLocator, ItemId, StorageAllocator};

const BLOB_VERSION: u8 = 3;
const HEADER_SIZE: usize = 10;
const ROLLBACK_NAME: &str = "rollback";

/// Lifecycle state recorded in a blob file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlobState {
    Old,
    New,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlobHeader {
    pub(crate) state: BlobState,
    pub(crate) originator: i64,
}

impl BlobHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = BLOB_VERSION;
        out[1] = match self.state {
            BlobState::Old => 0,
            BlobState::New => 1,
            BlobState::Deleted => 2,
        };
        out[2..].copy_from_slice(&self.originator.to_le_bytes());
        out
    }

    fn decode(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let version = reader.u8()?;
        if version != BLOB_VERSION {
            return Err(CoreError::storage_corruption(format!(
                "blob header version {version}, expected {BLOB_VERSION}"
            )));
        }
        let state = match reader.u8()? {
            0 => BlobState::Old,
            1 => BlobState::New,
            2 => BlobState::Deleted,
            other => {
                return Err(CoreError::storage_corruption(format!(
                    "unknown blob state {other}"
                )))
            }
        };
        Ok(Self {
            state,
            originator: reader.i64()?,
        })
    }
}

/// The content of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobContent {
    /// Writer of the content.
    pub originator: i64,
    /// The bytes.
    pub data: Vec<u8>,
}

fn read_file(path: &Path) -> CoreResult<Option<(BlobHeader, Vec<u8>)>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = ByteReader::new(&bytes, "blob file");
    let header = BlobHeader::decode(&mut reader)?;
    Ok(Some((header, reader.rest().to_vec())))
}

fn write_file(path: &Path, header: BlobHeader, data: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(&header.encode())?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn remove_if_present(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes `dir` once no transaction stages files in it.
fn remove_dir_if_empty(dir: &Path) -> CoreResult<()> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if entries.next().is_some() {
        return Ok(());
    }
    match fs::remove_dir(dir) {
        Ok(()) => sync_parent(dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Returns true when both paths name the same file.
#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> CoreResult<bool> {
    use std::os::unix::fs::MetadataExt;

    let (a, b) = match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        (Err(e), _) | (_, Err(e)) => return Err(e.into()),
    };
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> CoreResult<bool> {
    Ok(match (read_file(a)?, read_file(b)?) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    })
}

fn sync_parent(path: &Path) -> CoreResult<()> {
    match path.parent() {
        Some(parent) if parent.exists() => sync_dir(parent),
        _ => Ok(()),
    }
}

/// Creates the shared sentinel linked in for new blobs.
pub(crate) fn ensure_sentinel(locator: &BlobLocator) -> CoreResult<()> {
    let sentinel = locator.sentinel_file();
    if sentinel.exists() {
        return Ok(());
    }
    let header = BlobHeader {
        state: BlobState::New,
        originator: 0,
    };
    write_file(&sentinel, header, &[])?;
    sync_dir(locator.root())
}

/// Reads the committed content of a blob.
pub(crate) fn read_committed_blob(
    locator: &BlobLocator,
    id: &ItemId,
) -> CoreResult<Option<BlobContent>> {
    Ok(match read_file(&locator.target_file(id))? {
        Some((header, data)) if header.state == BlobState::Old => Some(BlobContent {
            originator: header.originator,
            data,
        }),
        _ => None,
    })
}

fn dirty_file(locator: &BlobLocator, id: &ItemId, stem: &str) -> PathBuf {
    locator.transaction_dir(id).join(format!("{stem}.dirty"))
}

fn rollback_file(locator: &BlobLocator, id: &ItemId) -> PathBuf {
    locator.transaction_dir(id).join(ROLLBACK_NAME)
}

/// Moves a staged file into place.
fn install(dirty: &Path, target: &Path) -> CoreResult<()> {
    match read_file(dirty)? {
        Some((header, _)) if header.state == BlobState::Deleted => {
            remove_if_present(target)?;
            remove_if_present(dirty)?;
        }
        Some(_) => fs::rename(dirty, target)?,
        None => return Ok(()),
    }
    sync_parent(target)
}

/// Puts the file saved at prepare back in place.
fn restore(rollback: &Path, target: &Path) -> CoreResult<()> {
    match read_file(rollback)? {
        Some((header, _)) if header.state == BlobState::New => {
            remove_if_present(target)?;
            remove_if_present(rollback)?;
        }
        // The link made at prepare still names the target.
        Some(_) if same_file(rollback, target)? => remove_if_present(rollback)?,
        Some(_) => fs::rename(rollback, target)?,
        None => return Ok(()),
    }
    sync_parent(target)
}

/// Finishes a blob left behind by transaction `stem`.
///
/// A committed transaction installs its staged file; any other transaction
/// restores the file saved at prepare.
pub(crate) fn recover_blob(
    locator: &BlobLocator,
    id: &ItemId,
    stem: &str,
    committed: bool,
) -> CoreResult<()> {
    let target = locator.target_file(id);
    let dirty = dirty_file(locator, id, stem);
    let rollback = rollback_file(locator, id);
    if committed {
        install(&dirty, &target)?;
        remove_if_present(&rollback)?;
    } else {
        remove_if_present(&dirty)?;
        restore(&rollback, &target)?;
    }
    remove_dir_if_empty(&locator.transaction_dir(id))
}

pub(crate) struct BlobTxState {
    flags: StateFlags,
    journals: Arc<dyn ItemJournals>,
    logged: AtomicBool,
}

impl TxState for BlobTxState {
    fn flags(&self) -> &StateFlags {
        &self.flags
    }
}

/// A whole-item blob.
pub struct BlobItem {
    core: ItemCore<BlobTxState>,
    locator: BlobLocator,
}

impl BlobItem {
    pub(crate) fn new(id: ItemId, locator: BlobLocator, timeout: Duration) -> Self {
        Self {
            core: ItemCore::new(ItemKey::new(ItemKind::Blob, id), timeout),
            locator,
        }
    }

    /// Returns the item identifier.
    #[must_use]
    pub fn id(&self) -> &ItemId {
        &self.core.key().id
    }

    pub(crate) fn begin(&self, xid: &Xid, journals: &Arc<dyn ItemJournals>) -> bool {
        self.core.begin(xid, || BlobTxState {
            flags: StateFlags::default(),
            journals: Arc::clone(journals),
            logged: AtomicBool::new(false),
        })
    }

    pub(crate) fn exists_for(&self, xid: &Xid) -> CoreResult<bool> {
        if let Ok(state) = self.core.state(xid) {
            if state.flags.deleted() {
                return Ok(false);
            }
            if state.flags.dirty() {
                return Ok(true);
            }
        }
        Ok(read_committed_blob(&self.locator, self.id())?.is_some())
    }

    pub(crate) fn create_for(&self, xid: &Xid) -> CoreResult<()> {
        let state = self.core.state(xid)?;
        self.core.hold(xid)?;
        self.stage(xid, &state, BlobState::Old, 0, &[])?;
        state.flags.mark_created();
        Ok(())
    }

    fn dirty_path(&self, xid: &Xid) -> PathBuf {
        dirty_file(&self.locator, self.id(), &xid.file_stem())
    }

    fn stage(
        &self,
        xid: &Xid,
        state: &BlobTxState,
        blob_state: BlobState,
        originator: i64,
        data: &[u8],
    ) -> CoreResult<()> {
        if !state.logged.load(Ordering::SeqCst) {
            state.journals.record_modified_blob(self.id())?;
            state.logged.store(true, Ordering::SeqCst);
        }
        let header = BlobHeader {
            state: blob_state,
            originator,
        };
        write_file(&self.dirty_path(xid), header, data)?;
        state.flags.mark_dirty();
        Ok(())
    }

    /// Replaces the blob content on behalf of `xid`.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the blob is deleted in `xid`'s view,
    /// `LockTimeout` if another transaction holds it, or an I/O error.
    pub fn write(&self, xid: &Xid, originator: i64, data: &[u8]) -> CoreResult<()> {
        let state = self.core.live_state(xid)?;
        self.core.hold(xid)?;
        let _guard = self.core.read_guard(xid)?;
        self.stage(xid, &state, BlobState::Old, originator, data)
    }

    /// Reads the blob as `xid` sees it.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the blob does not exist in `xid`'s view,
    /// `LockTimeout` if another transaction holds it, or an I/O error.
    pub fn read(&self, xid: &Xid) -> CoreResult<BlobContent> {
        let state = self.core.live_state(xid)?;
        let _guard = self.core.read_guard(xid)?;
        if state.flags.dirty() {
            if let Some((header, data)) = read_file(&self.dirty_path(xid))? {
                return Ok(BlobContent {
                    originator: header.originator,
                    data,
                });
            }
        }
        read_committed_blob(&self.locator, self.id())?
            .ok_or_else(|| CoreError::item_not_found(self.core.key()))
    }

    /// Returns the blob length as `xid` sees it.
    ///
    /// # Errors
    ///
    /// Same as [`BlobItem::read`].
    pub fn len(&self, xid: &Xid) -> CoreResult<usize> {
        Ok(self.read(xid)?.data.len())
    }
}

impl TransactionalItem for BlobItem {
    fn key(&self) -> &ItemKey {
        self.core.key()
    }

    fn item_lock(&self) -> &ItemLock {
        self.core.lock()
    }

    fn has_transactions(&self) -> bool {
        self.core.has_transactions()
    }

    fn knows_transaction(&self, xid: &Xid) -> bool {
        self.core.knows(xid)
    }

    fn is_dirty(&self, xid: &Xid) -> bool {
        self.core.flag(xid, StateFlags::dirty)
    }

    fn is_deleted(&self, xid: &Xid) -> bool {
        self.core.flag(xid, StateFlags::deleted)
    }

    fn delete(&self, xid: &Xid) -> CoreResult<()> {
        let state = self.core.live_state(xid)?;
        self.core.hold(xid)?;
        let _guard = self.core.read_guard(xid)?;
        self.stage(xid, &state, BlobState::Deleted, 0, &[])?;
        state.flags.mark_deleted();
        Ok(())
    }

    fn prepare_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.prepare(xid, |_| {
            let dir = self.locator.transaction_dir(self.id());
            fs::create_dir_all(&dir)?;
            let rollback = rollback_file(&self.locator, self.id());
            remove_if_present(&rollback)?;
            let target = self.locator.target_file(self.id());
            let source = if target.exists() {
                target
            } else {
                self.locator.sentinel_file()
            };
            fs::hard_link(&source, &rollback)?;
            sync_dir(&dir)
        })
    }

    fn commit_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.commit(xid, |state, others| {
            if state.flags.deleted() {
                ItemCore::propagate_delete(others);
            }
            recover_blob(&self.locator, self.id(), &xid.file_stem(), true)
        })
    }

    fn rollback_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.rollback(xid, |_| {
            recover_blob(&self.locator, self.id(), &xid.file_stem(), false)
        })
    }

    fn done_with(&self, xid: &Xid) -> CoreResult<bool> {
        self.core.done_with(xid)
    }

    fn created_in(&self, _xid: &Xid) -> Option<(Arc<dyn StorageAllocator>, ItemId)> {
        None
    }
}

impl fmt::Debug for BlobItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobItem")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
