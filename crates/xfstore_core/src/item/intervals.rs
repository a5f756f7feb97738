//! Closed interval sets over byte offsets.
//!
//! [`IntervalSet`] tracks which offsets of a range item hold valid data;
//! [`TaggedIntervalSet`] additionally remembers the originator that wrote each
//! offset. Both keep their intervals sorted, disjoint and maximally merged.

/// A set of closed `[start, end]` intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<(i64, i64)>,
}

impl IntervalSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set holds no offsets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Returns the number of disjoint intervals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Iterates over the intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.intervals.iter().copied()
    }

    /// Returns the first and last offset covered.
    #[must_use]
    pub fn span(&self) -> Option<(i64, i64)> {
        Some((self.intervals.first()?.0, self.intervals.last()?.1))
    }

    /// Returns true if `pos` is covered.
    #[must_use]
    pub fn contains(&self, pos: i64) -> bool {
        let idx = self.intervals.partition_point(|&(_, end)| end < pos);
        self.intervals.get(idx).is_some_and(|&(start, _)| start <= pos)
    }

    /// Adds `[start, end]`, merging with overlapping or adjacent intervals.
    pub fn insert(&mut self, start: i64, end: i64) {
        if start > end {
            return;
        }
        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        let mut placed = false;
        for &(s, e) in &self.intervals {
            if e.saturating_add(1) < merged.0 {
                out.push((s, e));
            } else if merged.1.saturating_add(1) < s {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push((s, e));
            } else {
                merged = (merged.0.min(s), merged.1.max(e));
            }
        }
        if !placed {
            out.push(merged);
        }
        self.intervals = out;
    }

    /// Removes `[start, end]`.
    pub fn remove(&mut self, start: i64, end: i64) {
        if start > end {
            return;
        }
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        for &(s, e) in &self.intervals {
            if e < start || s > end {
                out.push((s, e));
                continue;
            }
            if s < start {
                out.push((s, start - 1));
            }
            if e > end {
                out.push((end + 1, e));
            }
        }
        self.intervals = out;
    }

    /// Returns the part of the set inside `[start, end]`.
    #[must_use]
    pub fn clip(&self, start: i64, end: i64) -> Self {
        let intervals = self
            .intervals
            .iter()
            .filter(|&&(s, e)| e >= start && s <= end)
            .map(|&(s, e)| (s.max(start), e.min(end)))
            .collect();
        Self { intervals }
    }
}

impl FromIterator<(i64, i64)> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = (i64, i64)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (start, end) in iter {
            set.insert(start, end);
        }
        set
    }
}

/// A set of closed intervals, each tagged with an originator.
///
/// Inserting overwrites whatever tags covered the range before. Adjacent
/// intervals with the same tag are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedIntervalSet {
    intervals: Vec<(i64, i64, i64)>,
}

impl TaggedIntervalSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set holds no offsets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Iterates over `(start, end, tag)` in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, i64)> + '_ {
        self.intervals.iter().copied()
    }

    /// Returns the tag covering `pos`.
    #[must_use]
    pub fn tag_at(&self, pos: i64) -> Option<i64> {
        let idx = self.intervals.partition_point(|&(_, end, _)| end < pos);
        self.intervals
            .get(idx)
            .filter(|&&(start, _, _)| start <= pos)
            .map(|&(_, _, tag)| tag)
    }

    /// Tags `[start, end]` with `tag`, replacing earlier tags in that range.
    pub fn insert(&mut self, start: i64, end: i64, tag: i64) {
        if start > end {
            return;
        }
        self.remove(start, end);
        let idx = self.intervals.partition_point(|&(s, _, _)| s < start);
        self.intervals.insert(idx, (start, end, tag));

        // Merge with neighbours carrying the same tag.
        if idx + 1 < self.intervals.len() {
            let (ns, ne, nt) = self.intervals[idx + 1];
            if nt == tag && end.saturating_add(1) == ns {
                self.intervals[idx].1 = ne;
                self.intervals.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (_, pe, pt) = self.intervals[idx - 1];
            if pt == tag && pe.saturating_add(1) == start {
                self.intervals[idx - 1].1 = self.intervals[idx].1;
                self.intervals.remove(idx);
            }
        }
    }

    /// Removes `[start, end]`.
    pub fn remove(&mut self, start: i64, end: i64) {
        if start > end {
            return;
        }
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        for &(s, e, t) in &self.intervals {
            if e < start || s > end {
                out.push((s, e, t));
                continue;
            }
            if s < start {
                out.push((s, start - 1, t));
            }
            if e > end {
                out.push((end + 1, e, t));
            }
        }
        self.intervals = out;
    }

    /// Returns the part of the set inside `[start, end]`.
    #[must_use]
    pub fn clip(&self, start: i64, end: i64) -> Self {
        let intervals = self
            .intervals
            .iter()
            .filter(|&&(s, e, _)| e >= start && s <= end)
            .map(|&(s, e, t)| (s.max(start), e.min(end), t))
            .collect();
        Self { intervals }
    }
}

impl FromIterator<(i64, i64, i64)> for TaggedIntervalSet {
    fn from_iter<I: IntoIterator<Item = (i64, i64, i64)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (start, end, tag) in iter {
            set.insert(start, end, tag);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_merges_adjacent() {
        let mut set = IntervalSet::new();
        set.insert(0, 3);
        set.insert(4, 7);
        set.insert(10, 12);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 7), (10, 12)]);
        set.insert(5, 11);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 12)]);
    }

    #[test]
    fn remove_splits() {
        let mut set: IntervalSet = [(0, 9)].into_iter().collect();
        set.remove(3, 5);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 2), (6, 9)]);
        assert!(!set.contains(4));
        assert!(set.contains(6));
        assert_eq!(set.clip(1, 7).iter().collect::<Vec<_>>(), vec![(1, 2), (6, 7)]);
    }

    #[test]
    fn tags_overwrite_and_merge() {
        let mut set = TaggedIntervalSet::new();
        set.insert(0, 9, 1);
        set.insert(3, 5, 2);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![(0, 2, 1), (3, 5, 2), (6, 9, 1)]
        );
        set.insert(3, 5, 1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 9, 1)]);
        assert_eq!(set.tag_at(4), Some(1));
        assert_eq!(set.tag_at(10), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(i64, i64, i64),
        Remove(i64, i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..64, 0i64..16, 0i64..3).prop_map(|(s, l, t)| Op::Insert(s, s + l, t)),
            (0i64..64, 0i64..16).prop_map(|(s, l)| Op::Remove(s, s + l)),
        ]
    }

    proptest! {
        #[test]
        fn sets_match_a_flat_model(ops in prop::collection::vec(op(), 0..40)) {
            let mut model: [Option<i64>; 96] = [None; 96];
            let mut plain = IntervalSet::new();
            let mut tagged = TaggedIntervalSet::new();
            for op in &ops {
                match *op {
                    Op::Insert(s, e, t) => {
                        plain.insert(s, e);
                        tagged.insert(s, e, t);
                        for slot in &mut model[s as usize..=e as usize] {
                            *slot = Some(t);
                        }
                    }
                    Op::Remove(s, e) => {
                        plain.remove(s, e);
                        tagged.remove(s, e);
                        for slot in &mut model[s as usize..=e as usize] {
                            *slot = None;
                        }
                    }
                }
            }
            for (pos, expected) in model.iter().enumerate() {
                prop_assert_eq!(plain.contains(pos as i64), expected.is_some());
                prop_assert_eq!(tagged.tag_at(pos as i64), *expected);
            }
            let pairs: Vec<_> = plain.iter().collect();
            for pair in pairs.windows(2) {
                prop_assert!(pair[0].1 + 1 < pair[1].0);
            }
        }
    }
}
