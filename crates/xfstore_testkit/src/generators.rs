//! Property-based test generators using proptest.
//!
//! Provides strategies for generating identifiers, range operations and
//! point batches that respect the engine's input rules.

use proptest::prelude::*;
use xfstore_core::{Point, RangeRead};
use xfstore_storage::ItemId;

/// Strategy for generating valid path segments.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,11}").expect("Invalid regex")
}

/// Strategy for generating valid item identifiers one to three levels deep.
pub fn item_id_strategy() -> impl Strategy<Value = ItemId> {
    (prop::collection::vec(segment_strategy(), 0..3), segment_strategy()).prop_map(
        |(dirs, name)| {
            let path = format!("/{}", dirs.join("/"));
            ItemId::new(&path, &name).expect("Generated id must be valid")
        },
    )
}

/// Strategy for generating range payloads.
pub fn range_bytes_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=max_len.max(1))
}

/// A change to a range item.
#[derive(Debug, Clone)]
pub enum RangeOperation {
    /// Write bytes at an offset.
    Write {
        /// First offset written.
        start: i64,
        /// Bytes written.
        bytes: Vec<u8>,
    },
    /// Invalidate an inclusive interval.
    Delete {
        /// First offset invalidated.
        start: i64,
        /// Last offset invalidated.
        end: i64,
    },
}

/// Strategy for range operations inside `[0, extent)`.
pub fn range_operation_strategy(extent: i64) -> impl Strategy<Value = RangeOperation> {
    let extent = extent.max(2);
    prop_oneof![
        3 => (0..extent - 1).prop_flat_map(move |start| {
            let room = (extent - start) as usize;
            range_bytes_strategy(room).prop_map(move |bytes| RangeOperation::Write { start, bytes })
        }),
        1 => (0..extent, 0..extent).prop_map(|(a, b)| RangeOperation::Delete {
            start: a.min(b),
            end: a.max(b),
        }),
    ]
}

/// Strategy for a sequence of range operations.
pub fn range_operation_sequence(
    extent: i64,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<RangeOperation>> {
    prop::collection::vec(range_operation_strategy(extent), min_ops..max_ops)
}

/// Expected content of a range item after a sequence of operations.
///
/// Each offset is either valid with a byte or invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeModel {
    cells: Vec<Option<u8>>,
}

impl RangeModel {
    /// Creates an all-invalid model covering `[0, extent)`.
    pub fn new(extent: usize) -> Self {
        Self {
            cells: vec![None; extent],
        }
    }

    /// Applies one operation.
    pub fn apply(&mut self, op: &RangeOperation) {
        match op {
            RangeOperation::Write { start, bytes } => {
                for (i, byte) in bytes.iter().enumerate() {
                    if let Some(cell) = self.cells.get_mut(*start as usize + i) {
                        *cell = Some(*byte);
                    }
                }
            }
            RangeOperation::Delete { start, end } => {
                for pos in *start..=*end {
                    if let Some(cell) = self.cells.get_mut(pos as usize) {
                        *cell = None;
                    }
                }
            }
        }
    }

    /// Returns the first offset where `read` disagrees with the model.
    ///
    /// `read` must cover the model from offset zero.
    pub fn mismatch(&self, read: &RangeRead) -> Option<usize> {
        self.cells.iter().enumerate().find_map(|(pos, cell)| {
            let valid = read.valid.contains(pos as i64);
            match cell {
                Some(byte) if valid && read.data.get(pos) == Some(byte) => None,
                None if !valid => None,
                _ => Some(pos),
            }
        })
    }
}

/// Strategy for points inside `[start, end]`, with distinct timestamps.
pub fn points_strategy(start: f64, end: f64, max: usize) -> impl Strategy<Value = Vec<Point>> {
    prop::collection::btree_set(0u32..10_000, 0..=max).prop_map(move |steps| {
        steps
            .into_iter()
            .map(|step| {
                let ts = start + (end - start) * f64::from(step) / 10_000.0;
                Point::new(ts, step as f32, i64::from(step))
            })
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for tests that touch the disk per case.
    #[must_use]
    pub fn disk() -> Self {
        Self {
            cases: 12,
            max_shrink_iters: 50,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_ids_parse_back(id in item_id_strategy()) {
            prop_assert_eq!(ItemId::parse(&id.to_string()).unwrap(), id);
        }

        #[test]
        fn points_stay_inside_window(points in points_strategy(10.0, 20.0, 16)) {
            for p in &points {
                prop_assert!((10.0..=20.0).contains(&p.timestamp));
            }
        }
    }

    proptest! {
        #![proptest_config(PropTestConfig::disk().to_proptest_config())]

        #[test]
        fn committed_range_matches_model(ops in range_operation_sequence(48, 1, 12)) {
            let store = TestStore::new();
            let tm = store.manager();
            let id = ItemId::parse("/ts/model").unwrap();
            let mut model = RangeModel::new(48);

            let xid = tm.begin().unwrap();
            let item = tm.open_range(&xid, &id, true).unwrap();
            for op in &ops {
                model.apply(op);
                match op {
                    RangeOperation::Write { start, bytes } => item.write(&xid, *start, bytes, 1).unwrap(),
                    RangeOperation::Delete { start, end } => item.delete_interval(&xid, *start, *end).unwrap(),
                }
            }
            let pending = item.read(&xid, 0, 48).unwrap();
            prop_assert_eq!(model.mismatch(&pending), None);
            tm.commit(&xid).unwrap();

            let committed = tm.read_committed_range(&id, 0, 48).unwrap();
            prop_assert_eq!(model.mismatch(&committed), None);
        }
    }
}
