//! Sparse point series.
//!
//! Writes are batches of `(timestamp, value, originator)` points journaled as
//! USER_DATA entries. At prepare the batches are replayed over the committed
//! tree and the result is journaled as one TREE entry, which commit installs
//! as the item's data region.

use crate::error::{CoreError, CoreResult};
use crate::item::{
    committed_in, ByteReader, ItemCore, ItemJournals, StateFlags, TransactionalItem, TxState,
};
use crate::lock::ItemLock;
use crate::types::{ItemKey, ItemKind, Xid};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use xfstore_storage::{ItemId, ItemStorage, StorageAllocator};

/// Journal destination of an item deletion.
pub(crate) const POINTS_DELETED: i64 = -1;
/// Journal destination of a merged tree.
pub(crate) const POINTS_TREE: i64 = -2;
/// Journal destination of a written batch.
pub(crate) const POINTS_USER_DATA: i64 = -3;

const TREE_VERSION: u8 = 1;
const POINT_SIZE: usize = 20;

/// A Modified Julian Date timestamp with a total order.
#[derive(Debug, Clone, Copy)]
pub struct Mjd(pub f64);

impl PartialEq for Mjd {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Mjd {}

impl PartialOrd for Mjd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mjd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One stored point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Timestamp (MJD).
    pub timestamp: f64,
    /// Sample value.
    pub value: f32,
    /// Writer of the point.
    pub originator: i64,
}

impl Point {
    /// Creates a point.
    #[must_use]
    pub const fn new(timestamp: f64, value: f32, originator: i64) -> Self {
        Self {
            timestamp,
            value,
            originator,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_bits().to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.originator.to_le_bytes());
    }

    fn decode_from(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            timestamp: reader.f64()?,
            value: reader.f32()?,
            originator: reader.i64()?,
        })
    }
}

fn encode_count(out: &mut Vec<u8>, count: usize) -> CoreResult<()> {
    let count = u32::try_from(count)
        .map_err(|_| CoreError::invalid_operation("too many points in one payload"))?;
    out.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

/// A written batch, as journaled in a USER_DATA entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PointBatch {
    pub(crate) overwrite: bool,
    pub(crate) start: f64,
    pub(crate) end: f64,
    pub(crate) points: Vec<Point>,
}

impl PointBatch {
    pub(crate) fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(21 + self.points.len() * POINT_SIZE);
        out.push(u8::from(self.overwrite));
        out.extend_from_slice(&self.start.to_bits().to_le_bytes());
        out.extend_from_slice(&self.end.to_bits().to_le_bytes());
        encode_count(&mut out, self.points.len())?;
        for point in &self.points {
            point.encode_into(&mut out);
        }
        Ok(out)
    }

    pub(crate) fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes, "point batch");
        let overwrite = reader.u8()? != 0;
        let start = reader.f64()?;
        let end = reader.f64()?;
        let count = reader.u32()? as usize;
        let mut points = Vec::with_capacity(count.min(bytes.len() / POINT_SIZE));
        for _ in 0..count {
            points.push(Point::decode_from(&mut reader)?);
        }
        reader.finish()?;
        Ok(Self {
            overwrite,
            start,
            end,
            points,
        })
    }
}

/// Points of one item ordered by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PointTree {
    points: BTreeMap<Mjd, (f32, i64)>,
}

impl PointTree {
    pub(crate) fn apply(&mut self, batch: &PointBatch) {
        if batch.overwrite {
            let doomed: Vec<Mjd> = self
                .points
                .range(Mjd(batch.start)..=Mjd(batch.end))
                .map(|(ts, _)| *ts)
                .collect();
            for ts in doomed {
                self.points.remove(&ts);
            }
        }
        for point in &batch.points {
            self.points
                .insert(Mjd(point.timestamp), (point.value, point.originator));
        }
    }

    pub(crate) fn range(&self, start: f64, end: f64) -> Vec<Point> {
        if Mjd(start) > Mjd(end) {
            return Vec::new();
        }
        self.points
            .range(Mjd(start)..=Mjd(end))
            .map(|(ts, (value, originator))| Point::new(ts.0, *value, *originator))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.points.len()
    }

    pub(crate) fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(5 + self.points.len() * POINT_SIZE);
        out.push(TREE_VERSION);
        encode_count(&mut out, self.points.len())?;
        for (ts, (value, originator)) in &self.points {
            Point::new(ts.0, *value, *originator).encode_into(&mut out);
        }
        Ok(out)
    }

    /// Decodes a data region. An empty region is an empty tree.
    pub(crate) fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = ByteReader::new(bytes, "point tree");
        let version = reader.u8()?;
        if version != TREE_VERSION {
            return Err(CoreError::storage_corruption(format!(
                "point tree version {version}, expected {TREE_VERSION}"
            )));
        }
        let mut tree = Self::default();
        for _ in 0..reader.u32()? {
            let point = Point::decode_from(&mut reader)?;
            tree.points
                .insert(Mjd(point.timestamp), (point.value, point.originator));
        }
        reader.finish()?;
        Ok(tree)
    }
}

/// Reads committed points in `[start, end]` from `storage`.
pub(crate) fn read_committed_points(
    storage: &ItemStorage,
    start: f64,
    end: f64,
) -> CoreResult<Vec<Point>> {
    Ok(PointTree::decode(&storage.read_all_data()?)?.range(start, end))
}

pub(crate) struct PointState {
    flags: StateFlags,
    journals: Arc<dyn ItemJournals>,
    /// Offsets of this transaction's USER_DATA entries, in append order.
    batches: Mutex<Vec<u64>>,
}

impl TxState for PointState {
    fn flags(&self) -> &StateFlags {
        &self.flags
    }
}

/// A sparse point series item.
pub struct PointItem {
    core: ItemCore<PointState>,
    allocator: Arc<dyn StorageAllocator>,
}

impl PointItem {
    pub(crate) fn new(id: ItemId, allocator: Arc<dyn StorageAllocator>, timeout: Duration) -> Self {
        Self {
            core: ItemCore::new(ItemKey::new(ItemKind::Points, id), timeout),
            allocator,
        }
    }

    /// Returns the item identifier.
    #[must_use]
    pub fn id(&self) -> &ItemId {
        &self.core.key().id
    }

    pub(crate) fn begin(&self, xid: &Xid, journals: &Arc<dyn ItemJournals>) -> bool {
        self.core.begin(xid, || PointState {
            flags: StateFlags::default(),
            journals: Arc::clone(journals),
            batches: Mutex::new(Vec::new()),
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
        state.batches.lock().clear();
        state.flags.mark_created();
        Ok(())
    }

    /// Writes `points` on behalf of `xid`.
    ///
    /// With `overwrite`, points already stored in `[start, end]` are removed
    /// first. Every point must lie inside `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for a bad range or a point outside it,
    /// `ItemNotFound` if the item is deleted in `xid`'s view, `LockTimeout`
    /// if another transaction holds the item, or a journal error.
    pub fn write(
        &self,
        xid: &Xid,
        start: f64,
        end: f64,
        points: &[Point],
        overwrite: bool,
    ) -> CoreResult<()> {
        if !(start.is_finite() && end.is_finite() && start <= end) {
            return Err(CoreError::invalid_operation(format!(
                "bad point range [{start}, {end}]"
            )));
        }
        if let Some(outside) = points
            .iter()
            .find(|p| !(p.timestamp >= start && p.timestamp <= end))
        {
            return Err(CoreError::invalid_operation(format!(
                "point at {} lies outside [{start}, {end}]",
                outside.timestamp
            )));
        }
        let state = self.core.live_state(xid)?;
        self.core.hold(xid)?;
        let _guard = self.core.read_guard(xid)?;

        let batch = PointBatch {
            overwrite,
            start,
            end,
            points: points.to_vec(),
        };
        let mut batches = state.batches.lock();
        let offset = state
            .journals
            .points_journal()?
            .append(self.id(), POINTS_USER_DATA, &batch.encode()?)?;
        batches.push(offset);
        state.flags.mark_dirty();
        Ok(())
    }

    /// Reads the points in `[start, end]` as `xid` sees them.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the item is deleted in `xid`'s view,
    /// `LockTimeout` if another transaction holds the item, or a storage or
    /// journal error.
    pub fn read(&self, xid: &Xid, start: f64, end: f64) -> CoreResult<Vec<Point>> {
        let state = self.core.live_state(xid)?;
        let _guard = self.core.read_guard(xid)?;
        Ok(self.view_tree(&state)?.range(start, end))
    }

    /// Returns the number of points `xid` sees.
    ///
    /// # Errors
    ///
    /// Same as [`PointItem::read`].
    pub fn len(&self, xid: &Xid) -> CoreResult<usize> {
        let state = self.core.live_state(xid)?;
        let _guard = self.core.read_guard(xid)?;
        Ok(self.view_tree(&state)?.len())
    }

    fn view_tree(&self, state: &PointState) -> CoreResult<PointTree> {
        let mut tree = if state.flags.created() {
            PointTree::default()
        } else if self.allocator.has_item(self.id())? {
            PointTree::decode(&self.allocator.storage(self.id())?.read_all_data()?)?
        } else {
            PointTree::default()
        };
        let offsets = state.batches.lock().clone();
        if offsets.is_empty() {
            return Ok(tree);
        }
        let journal = state.journals.points_journal()?;
        for offset in offsets {
            let entry = journal.read_entry(offset)?;
            if entry.dest != POINTS_USER_DATA || entry.id != *self.id() {
                return Err(CoreError::journal_corruption(format!(
                    "entry at offset {offset} is not a point batch of {}",
                    self.id()
                )));
            }
            tree.apply(&PointBatch::decode(&entry.payload)?);
        }
        Ok(tree)
    }
}

impl TransactionalItem for PointItem {
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
        let mut batches = state.batches.lock();
        state
            .journals
            .points_journal()?
            .append(self.id(), POINTS_DELETED, &[])?;
        batches.clear();
        state.flags.mark_deleted();
        state.flags.mark_dirty();
        Ok(())
    }

    fn prepare_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.prepare(xid, |state| {
            if state.flags.deleted() {
                return Ok(());
            }
            let tree = self.view_tree(state)?;
            state
                .journals
                .points_journal()?
                .append(self.id(), POINTS_TREE, &tree.encode()?)?;
            Ok(())
        })
    }

    fn commit_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.commit(xid, |state, others| {
            if state.flags.deleted() {
                ItemCore::propagate_delete(others);
                if others.is_empty() {
                    self.allocator.delete(self.id(), true)?;
                }
                return Ok(());
            }
            Ok(self.allocator.mark_old(self.id())?)
        })
    }

    fn rollback_transaction(&self, xid: &Xid) -> CoreResult<()> {
        self.core.rollback(xid, |state| {
            state.batches.lock().clear();
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

impl fmt::Debug for PointItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointItem")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
