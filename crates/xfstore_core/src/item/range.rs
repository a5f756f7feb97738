//! Range-addressable series.
//!
//! Writes overwrite byte ranges. Each write journals its bytes as a data entry
//! (destination = byte offset) followed by an OP entry describing it; reads
//! inside the transaction replay the OP list over the committed content.
//! Prepare journals the merged metadata as one META entry, and commit marks
//! the item's storage old.

use crate::error::{CoreError, CoreResult};
use crate::item::cache::RangeCaches;
use crate::item::intervals::{IntervalSet, TaggedIntervalSet};
use crate::item::{
    committed_in, ByteReader, ItemCore, ItemJournals, StateFlags, TransactionalItem, TxState,
};
use crate::lock::ItemLock;
use crate::types::{ItemKey, ItemKind, Xid};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use xfstore_storage::{ItemId, ItemStorage, StorageAllocator};

/// Journal destination of merged metadata.
pub(crate) const RANGE_META: i64 = -1;
/// Journal destination of a pending operation.
pub(crate) const RANGE_OP: i64 = -2;
/// Journal destination of an item deletion.
pub(crate) const RANGE_DELETE: i64 = -3;

const META_VERSION: u8 = 8;
const OP_WRITE: u8 = 1;
const OP_DELETE_INTERVAL: u8 = 2;
const OP_SET_DATA_TYPE: u8 = 3;

/// Committed description of a range item's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeMeta {
    /// Caller-defined data type tag.
    pub data_type: u8,
    /// Offsets holding valid data.
    pub valid: IntervalSet,
    /// Originator of every valid offset.
    pub origins: TaggedIntervalSet,
}

impl RangeMeta {
    /// Encodes the metadata region.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.valid.len() * 16);
        out.push(META_VERSION);
        out.push(self.data_type);
        push_count(&mut out, self.valid.len());
        for (start, end) in self.valid.iter() {
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
        }
        let origins: Vec<_> = self.origins.iter().collect();
        push_count(&mut out, origins.len());
        for (start, end, originator) in origins {
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
            out.extend_from_slice(&originator.to_le_bytes());
        }
        out
    }

    /// Decodes a metadata region. An empty region is an empty item.
    ///
    /// # Errors
    ///
    /// Returns `StorageCorruption` for an unknown version or a short region.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = ByteReader::new(bytes, "range metadata");
        let version = reader.u8()?;
        if version != META_VERSION {
            return Err(CoreError::storage_corruption(format!(
                "range metadata version {version}, expected {META_VERSION}"
            )));
        }
        let data_type = reader.u8()?;
        let mut valid = IntervalSet::new();
        for _ in 0..reader.u32()? {
            let (start, end) = (reader.i64()?, reader.i64()?);
            valid.insert(start, end);
        }
        let mut origins = TaggedIntervalSet::new();
        for _ in 0..reader.u32()? {
            let (start, end, originator) = (reader.i64()?, reader.i64()?, reader.i64()?);
            origins.insert(start, end, originator);
        }
        reader.finish()?;
        Ok(Self {
            data_type,
            valid,
            origins,
        })
    }

    pub(crate) fn apply(&mut self, op: &RangeOp) {
        match *op {
            RangeOp::Write {
                start,
                end,
                originator,
                ..
            } => {
                self.valid.insert(start, end);
                self.origins.insert(start, end, originator);
            }
            RangeOp::DeleteInterval { start, end } => {
                self.valid.remove(start, end);
                self.origins.remove(start, end);
            }
            RangeOp::SetDataType(data_type) => self.data_type = data_type,
        }
    }
}

fn push_count(out: &mut Vec<u8>, count: usize) {
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    out.extend_from_slice(&count.to_le_bytes());
}

/// One pending range operation, as journaled in an OP entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeOp {
    Write {
        start: i64,
        end: i64,
        originator: i64,
        data_offset: u64,
    },
    DeleteInterval {
        start: i64,
        end: i64,
    },
    SetDataType(u8),
}

impl RangeOp {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        match *self {
            Self::Write {
                start,
                end,
                originator,
                data_offset,
            } => {
                out.push(OP_WRITE);
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
                out.extend_from_slice(&originator.to_le_bytes());
                out.extend_from_slice(&data_offset.to_le_bytes());
            }
            Self::DeleteInterval { start, end } => {
                out.push(OP_DELETE_INTERVAL);
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            }
            Self::SetDataType(data_type) => {
                out.push(OP_SET_DATA_TYPE);
                out.push(data_type);
            }
        }
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes, "range operation");
        let op = match reader.u8()? {
            OP_WRITE => Self::Write {
                start: reader.i64()?,
                end: reader.i64()?,
                originator: reader.i64()?,
                data_offset: reader.u64()?,
            },
            OP_DELETE_INTERVAL => Self::DeleteInterval {
                start: reader.i64()?,
                end: reader.i64()?,
            },
            OP_SET_DATA_TYPE => Self::SetDataType(reader.u8()?),
            tag => {
                return Err(CoreError::journal_corruption(format!(
                    "unknown range operation tag {tag}"
                )))
            }
        };
        reader.finish()?;
        Ok(op)
    }
}

/// The result of reading a byte range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeRead {
    /// The requested bytes; offsets without valid data read as zero.
    pub data: Vec<u8>,
    /// Valid offsets inside the requested range.
    pub valid: IntervalSet,
    /// Originators inside the requested range.
    pub origins: TaggedIntervalSet,
}

/// Reads committed content from `storage` through `meta`.
pub(crate) fn read_committed(
    storage: &ItemStorage,
    meta: &RangeMeta,
    start: i64,
    len: usize,
) -> CoreResult<RangeRead> {
    let Some(end) = range_end(start, len)? else {
        return Ok(RangeRead::default());
    };
    let offset = u64::try_from(start)
        .map_err(|_| CoreError::invalid_operation("negative range offset"))?;
    let mut data = storage.read_data(offset, len)?;
    data.resize(len, 0);
    let mut invalid = IntervalSet::new();
    invalid.insert(start, end);
    for (s, e) in meta.valid.clip(start, end).iter() {
        invalid.remove(s, e);
    }
    for (s, e) in invalid.iter() {
        zero(&mut data, start, s, e);
    }
    Ok(RangeRead {
        data,
        valid: meta.valid.clip(start, end),
        origins: meta.origins.clip(start, end),
    })
}

/// Returns the last offset of `[start, start + len)`, or `None` if empty.
fn range_end(start: i64, len: usize) -> CoreResult<Option<i64>> {
    if start < 0 {
        return Err(CoreError::invalid_operation(format!(
            "range offset {start} is negative"
        )));
    }
    if len == 0 {
        return Ok(None);
    }
    i64::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len - 1))
        .map(Some)
        .ok_or_else(|| CoreError::invalid_operation("range end overflows"))
}

fn overlay(buf: &mut [u8], buf_start: i64, src: &[u8], src_start: i64) {
    let buf_end = buf_start + buf.len() as i64;
    let src_end = src_start + src.len() as i64;
    let (lo, hi) = (buf_start.max(src_start), buf_end.min(src_end));
    if lo >= hi {
        return;
    }
    buf[(lo - buf_start) as usize..(hi - buf_start) as usize]
        .copy_from_slice(&src[(lo - src_start) as usize..(hi - src_start) as usize]);
}

fn zero(buf: &mut [u8], buf_start: i64, start: i64, end: i64) {
    let buf_end = buf_start + buf.len() as i64 - 1;
    let (lo, hi) = (start.max(buf_start), end.min(buf_end));
    if lo > hi {
        return;
    }
    buf[(lo - buf_start) as usize..=(hi - buf_start) as usize].fill(0);
}

pub(crate) struct RangeState {
    flags: StateFlags,
    journals: Arc<dyn ItemJournals>,
    /// Offsets of this transaction's OP entries, in append order.
    ops: Mutex<Vec<u64>>,
    prepared: Mutex<Option<Arc<RangeMeta>>>,
}

impl TxState for RangeState {
    fn flags(&self) -> &StateFlags {
        &self.flags
    }
}

/// A range-addressable series item.
pub struct RangeItem {
    core: ItemCore<RangeState>,
    allocator: Arc<dyn StorageAllocator>,
    caches: Arc<RangeCaches>,
}

impl RangeItem {
    pub(crate) fn new(
        id: ItemId,
        allocator: Arc<dyn StorageAllocator>,
        caches: Arc<RangeCaches>,
        timeout: Duration,
    ) -> Self {
        Self {
            core: ItemCore::new(ItemKey::new(ItemKind::Range, id), timeout),
            allocator,
            caches,
        }
    }

    /// Returns the item identifier.
    #[must_use]
    pub fn id(&self) -> &ItemId {
        &self.core.key().id
    }

    pub(crate) fn begin(&self, xid: &Xid, journals: &Arc<dyn ItemJournals>) -> bool {
        self.core.begin(xid, || RangeState {
            flags: StateFlags::default(),
            journals: Arc::clone(journals),
            ops: Mutex::new(Vec::new()),
            prepared: Mutex::new(None),
        })
    }

    pub(crate) fn exists_for(&self, xid: &Xid) -> CoreResult<bool> {
        if let Ok(state) = self.core.state(xid) {
            if state.flags.deleted() {
                return Ok(false);
            }
            if state.flags.created() {
                return Ok(true);
            }
        }
        committed_in(self.allocator.as_ref(), self.id())
    }

    pub(crate) fn create_for(&self, xid: &Xid) -> CoreResult<()> {
        let state = self.core.state(xid)?;
        self.core.hold(xid)?;
        self.allocator.create(self.id())?;
        state.ops.lock().clear();
        state.flags.mark_created();
        Ok(())
    }

    /// Writes `bytes` at `start` on behalf of `xid`.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the item is deleted in `xid`'s view,
    /// `InvalidOperation` for a negative offset, `LockTimeout` if another
    /// transaction holds the item, or a journal error.
    pub fn write(&self, xid: &Xid, start: i64, bytes: &[u8], originator: i64) -> CoreResult<()> {
        let state = self.core.live_state(xid)?;
        let Some(end) = range_end(start, bytes.len())? else {
            return Ok(());
        };
        self.core.hold(xid)?;
        let _guard = self.core.read_guard(xid)?;
        let journal = state.journals.range_journal()?;

        let mut ops = state.ops.lock();
        let data_offset = journal.append(self.id(), start, bytes)?;
        let op = RangeOp::Write {
            start,
            end,
            originator,
            data_offset,
        };
        self.push_op(xid, &state, &mut ops, op)
    }

    /// Invalidates `[start, end]` on behalf of `xid`.
    ///
    /// # Errors
    ///
    /// Same as [`RangeItem::write`].
    pub fn delete_interval(&self, xid: &Xid, start: i64, end: i64) -> CoreResult<()> {
        if start < 0 || end < start {
            return Err(CoreError::invalid_operation(format!(
                "bad interval [{start}, {end}]"
            )));
        }
        let state = self.core.live_state(xid)?;
        self.core.hold(xid)?;
        let _guard = self.core.read_guard(xid)?;
        let mut ops = state.ops.lock();
        self.push_op(xid, &state, &mut ops, RangeOp::DeleteInterval { start, end })
    }

    /// Sets the item's data type tag on behalf of `xid`.
    ///
    /// # Errors
    ///
    /// Same as [`RangeItem::write`].
    pub fn set_data_type(&self, xid: &Xid, data_type: u8) -> CoreResult<()> {
        let state = self.core.live_state(xid)?;
        self.core.hold(xid)?;
        let _guard = self.core.read_guard(xid)?;
        let mut ops = state.ops.lock();
        self.push_op(xid, &state, &mut ops, RangeOp::SetDataType(data_type))
    }

    fn push_op(
        &self,
        xid: &Xid,
        state: &RangeState,
        ops: &mut Vec<u64>,
        op: RangeOp,
    ) -> CoreResult<()> {
        let journal = state.journals.range_journal()?;
        let offset = journal.append(self.id(), RANGE_OP, &op.encode())?;
        self.caches.operations.put((xid.clone(), offset), op);
        ops.push(offset);
        state.flags.mark_dirty();
        Ok(())
    }

    /// Reads `len` bytes at `start` as `xid` sees them.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the item is deleted in `xid`'s view,
    /// `LockTimeout` if another transaction holds the item, or a storage or
    /// journal error.
    pub fn read(&self, xid: &Xid, start: i64, len: usize) -> CoreResult<RangeRead> {
        let state = self.core.live_state(xid)?;
        let _guard = self.core.read_guard(xid)?;
        let Some(end) = range_end(start, len)? else {
            return Ok(RangeRead::default());
        };

        let (mut meta, mut data) = if state.flags.created() {
            (RangeMeta::default(), vec![0; len])
        } else {
            let meta = self.committed_meta()?;
            let data = match self.committed_storage()? {
                Some(storage) => read_committed(&storage, &meta, start, len)?.data,
                None => vec![0; len],
            };
            (meta.as_ref().clone(), data)
        };

        let offsets = state.ops.lock().clone();
        let journal = if offsets.is_empty() {
            None
        } else {
            Some(state.journals.range_journal()?)
        };
        for offset in offsets {
            let op = self.op(xid, &state, offset)?;
            match op {
                RangeOp::Write {
                    start: s,
                    end: e,
                    data_offset,
                    ..
                } if e >= start && s <= end => {
                    if let Some(journal) = &journal {
                        let entry = journal.read_entry(data_offset)?;
                        overlay(&mut data, start, &entry.payload, s);
                    }
                }
                RangeOp::DeleteInterval { start: s, end: e } => zero(&mut data, start, s, e),
                _ => {}
            }
            meta.apply(&op);
        }

        Ok(RangeRead {
            data,
            valid: meta.valid.clip(start, end),
            origins: meta.origins.clip(start, end),
        })
    }

    /// Returns the data type tag as `xid` sees it.
    ///
    /// # Errors
    ///
    /// Same as [`RangeItem::read`].
    pub fn data_type(&self, xid: &Xid) -> CoreResult<u8> {
        Ok(self.view_meta(xid)?.data_type)
    }

    /// Returns the valid intervals as `xid` sees them.
    ///
    /// # Errors
    ///
    /// Same as [`RangeItem::read`].
    pub fn valid_intervals(&self, xid: &Xid) -> CoreResult<IntervalSet> {
        Ok(self.view_meta(xid)?.valid)
    }

    /// Returns the originator intervals as `xid` sees them.
    ///
    /// # Errors
    ///
    /// Same as [`RangeItem::read`].
    pub fn origin_intervals(&self, xid: &Xid) -> CoreResult<TaggedIntervalSet> {
        Ok(self.view_meta(xid)?.origins)
    }

    fn view_meta(&self, xid: &Xid) -> CoreResult<RangeMeta> {
        let state = self.core.live_state(xid)?;
        let _guard = self.core.read_guard(xid)?;
        self.merged_meta(xid, &state)
    }

    fn merged_meta(&self, xid: &Xid, state: &RangeState) -> CoreResult<RangeMeta> {
        let mut meta = if state.flags.created() {
            RangeMeta::default()
        } else {
            self.committed_meta()?.as_ref().clone()
        };
        let offsets = state.ops.lock().clone();
        for offset in offsets {
            meta.apply(&self.op(xid, state, offset)?);
        }
        Ok(meta)
    }

    fn op(&self, xid: &Xid, state: &RangeState, offset: u64) -> CoreResult<RangeOp> {
        let key = (xid.clone(), offset);
        if let Some(op) = self.caches.operations.get(&key) {
            return Ok(op);
        }
        let entry = state.journals.range_journal()?.read_entry(offset)?;
        if entry.dest != RANGE_OP || entry.id != *self.id() {
            return Err(CoreError::journal_corruption(format!(
                "entry at offset {offset} is not an operation of {}",
                self.id()
            )));
        }
        let op = RangeOp::decode(&entry.payload)?;
        self.caches.operations.put(key, op);
        Ok(op)
    }

    fn committed_storage(&self) -> CoreResult<Option<Arc<ItemStorage>>> {
        if self.allocator.has_item(self.id())? {
            Ok(Some(self.allocator.storage(self.id())?))
        } else {
            Ok(None)
        }
    }

    fn committed_meta(&self) -> CoreResult<Arc<RangeMeta>> {
        if let Some(meta) = self.caches.metadata.get(self.id()) {
            return Ok(meta);
        }
        let meta = match self.committed_storage()? {
            Some(storage) => Arc::new(RangeMeta::decode(&storage.read_meta()?)?),
            None => Arc::new(RangeMeta::default()),
        };
        self.caches.metadata.put(self.id().clone(), Arc::clone(&meta));
        Ok(meta)
    }

    fn forget_ops(&self, xid: &Xid, state: &RangeState) {
        for offset in state.ops.lock().drain(..) {
            self.caches.operations.evict(&(xid.clone(), offset));
        }
    }
}

impl TransactionalItem for RangeItem {
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
        let mut ops = state.ops.lock();
        state
            .journals
            .range_journal()?
            .append(self.id(), RANGE_DELETE, &[])?;
        for offset in ops.drain(..) {
            self.caches.operations.evict(&(xid.clone(), offset));
        }
        state.flags.mark_deleted();
        state.flags.mark_dirty();
        Ok(())
    }

    fn prepare_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.prepare(xid, |state| {
            if state.flags.deleted() {
                return Ok(());
            }
            let meta = self.merged_meta(xid, state)?;
            state
                .journals
                .range_journal()?
                .append(self.id(), RANGE_META, &meta.encode())?;
            *state.prepared.lock() = Some(Arc::new(meta));
            Ok(())
        })
    }

    fn commit_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.commit(xid, |state, others| {
            self.forget_ops(xid, state);
            self.caches.metadata.evict(self.id());
            if state.flags.deleted() {
                ItemCore::propagate_delete(others);
                if others.is_empty() {
                    self.allocator.delete(self.id(), true)?;
                }
                return Ok(());
            }
            self.allocator.mark_old(self.id())?;
            if let Some(meta) = state.prepared.lock().take() {
                self.caches.metadata.put(self.id().clone(), meta);
            }
            Ok(())
        })
    }

    fn rollback_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.rollback(xid, |state| {
            self.forget_ops(xid, state);
            Ok(())
        })
    }

    fn done_with(&self, xid: &Xid) -> CoreResult<bool> {
        self.core.done_with(xid)
    }

    fn created_in(&self, xid: &Xid) -> Option<(Arc<dyn StorageAllocator>, ItemId)> {
        self.core
            .flag(xid, StateFlags::created)
            .then(|| (Arc::clone(&self.allocator), self.id().clone()))
    }
}

impl fmt::Debug for RangeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeItem")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::testing::MemoryJournals;
    use crate::journal::Journal;
    use tempfile::{tempdir, TempDir};
    use xfstore_storage::DirectoryAllocator;

    struct Fixture {
        _dir: TempDir,
        allocator: Arc<dyn StorageAllocator>,
        item: RangeItem,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let allocator: Arc<dyn StorageAllocator> =
            Arc::new(DirectoryAllocator::open("/ts", dir.path()).unwrap());
        let item = RangeItem::new(
            ItemId::parse("/ts/a").unwrap(),
            Arc::clone(&allocator),
            Arc::new(RangeCaches::new(16, 64)),
            Duration::from_millis(100),
        );
        Fixture {
            _dir: dir,
            allocator,
            item,
        }
    }

    fn enroll(item: &RangeItem, xid: &Xid) -> Arc<MemoryJournals> {
        let journals = MemoryJournals::shared();
        let shared: Arc<dyn ItemJournals> = journals.clone();
        assert!(item.begin(xid, &shared));
        journals
    }

    /// Applies data and META entries the way a commit merge does.
    fn merge(journal: &Journal, allocator: &dyn StorageAllocator) {
        let size = journal.size().unwrap();
        let mut offset = 0;
        while offset < size {
            let entry = journal.read_entry(offset).unwrap();
            offset += entry.encode().unwrap().len() as u64;
            let storage = allocator.create(&entry.id).unwrap();
            match entry.dest {
                RANGE_META => storage.replace_meta(&entry.payload).unwrap(),
                RANGE_OP | RANGE_DELETE => {}
                at => storage.write_data(at as u64, &entry.payload).unwrap(),
            }
        }
    }

    #[test]
    fn metadata_codec() {
        let mut meta = RangeMeta {
            data_type: 4,
            ..RangeMeta::default()
        };
        meta.apply(&RangeOp::Write {
            start: 0,
            end: 9,
            originator: 7,
            data_offset: 0,
        });
        meta.apply(&RangeOp::DeleteInterval { start: 3, end: 4 });
        assert_eq!(RangeMeta::decode(&meta.encode()).unwrap(), meta);
        assert_eq!(RangeMeta::decode(&[]).unwrap(), RangeMeta::default());
        assert!(RangeMeta::decode(&[7, 0]).is_err());
    }

    #[test]
    fn write_prepare_commit_roundtrip() {
        let f = fixture();
        let xid = Xid::Local(1);
        let journals = enroll(&f.item, &xid);
        f.item.create_for(&xid).unwrap();
        f.item.write(&xid, 0, b"ABCD", 11).unwrap();
        f.item.write(&xid, 2, b"xy", 12).unwrap();

        let view = f.item.read(&xid, 0, 6).unwrap();
        assert_eq!(view.data, b"ABxy\0\0");
        assert_eq!(view.valid.iter().collect::<Vec<_>>(), vec![(0, 3)]);
        assert_eq!(
            view.origins.iter().collect::<Vec<_>>(),
            vec![(0, 1, 11), (2, 3, 12)]
        );

        f.item.prepare_transaction(&xid).unwrap();
        merge(&journals.range, f.allocator.as_ref());
        f.item.commit_transaction(&xid).unwrap();
        assert!(!f.item.has_transactions());
        assert!(!f.allocator.is_new(f.item.id()).unwrap());

        let storage = f.allocator.storage(f.item.id()).unwrap();
        let meta = RangeMeta::decode(&storage.read_meta().unwrap()).unwrap();
        let read = read_committed(&storage, &meta, 0, 4).unwrap();
        assert_eq!(read.data, b"ABxy");
    }

    #[test]
    fn delete_interval_hides_bytes() {
        let f = fixture();
        let xid = Xid::Local(1);
        enroll(&f.item, &xid);
        f.item.create_for(&xid).unwrap();
        f.item.write(&xid, 0, b"ABCD", 1).unwrap();
        f.item.delete_interval(&xid, 1, 2).unwrap();
        f.item.set_data_type(&xid, 9).unwrap();
        let view = f.item.read(&xid, 0, 4).unwrap();
        assert_eq!(view.data, b"A\0\0D");
        assert_eq!(f.item.data_type(&xid).unwrap(), 9);
        assert_eq!(
            f.item.valid_intervals(&xid).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 0), (3, 3)]
        );
    }

    #[test]
    fn foreign_transaction_waits_for_holder() {
        let f = fixture();
        let (a, b) = (Xid::Local(1), Xid::Local(2));
        enroll(&f.item, &a);
        enroll(&f.item, &b);
        f.item.create_for(&a).unwrap();
        f.item.write(&a, 0, b"x", 0).unwrap();
        let journals: Arc<dyn ItemJournals> = MemoryJournals::shared();
        assert!(!f.item.begin(&Xid::Local(3), &journals));
        assert!(f.item.read(&b, 0, 1).unwrap_err().is_lock_timeout());
        assert!(f.item.write(&b, 0, b"y", 0).unwrap_err().is_lock_timeout());
        assert_eq!(f.item.read(&a, 0, 1).unwrap().data, b"x");
    }

    #[test]
    fn rollback_discards_pending_writes() {
        let f = fixture();
        let xid = Xid::Local(1);
        enroll(&f.item, &xid);
        f.item.create_for(&xid).unwrap();
        f.item.write(&xid, 0, b"ABCD", 0).unwrap();
        assert!(f.item.created_in(&xid).is_some());
        f.item.rollback_transaction(&xid).unwrap();
        f.item.rollback_transaction(&xid).unwrap();
        assert!(!f.item.has_transactions());
        assert_eq!(f.item.item_lock().transaction_lock_holder(), None);
        assert!(f.allocator.is_new(f.item.id()).unwrap());
    }

    #[test]
    fn delete_hides_item_from_its_transaction() {
        let f = fixture();
        let xid = Xid::Local(1);
        enroll(&f.item, &xid);
        f.item.create_for(&xid).unwrap();
        f.item.delete(&xid).unwrap();
        assert!(!f.item.exists_for(&xid).unwrap());
        assert!(matches!(
            f.item.read(&xid, 0, 1),
            Err(CoreError::ItemNotFound { .. })
        ));
        assert!(f.item.is_deleted(&xid));
    }

    #[test]
    fn negative_offsets_are_rejected() {
        let f = fixture();
        let xid = Xid::Local(1);
        enroll(&f.item, &xid);
        assert!(matches!(
            f.item.write(&xid, -1, b"x", 0),
            Err(CoreError::InvalidOperation { .. })
        ));
    }
}
