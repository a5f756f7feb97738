//! Core identifier types.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use xfstore_storage::ItemId;

/// An externally supplied distributed transaction identifier.
///
/// Mirrors the X/Open XID: a format identifier, a global transaction id and a
/// branch qualifier. Ordering compares the fields in that order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalXid {
    /// Format identifier chosen by the external transaction manager.
    pub format_id: i32,
    /// Global transaction id bytes.
    pub gtrid: Vec<u8>,
    /// Branch qualifier bytes.
    pub bqual: Vec<u8>,
}

impl GlobalXid {
    /// Creates a distributed transaction identifier.
    #[must_use]
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            gtrid: gtrid.into(),
            bqual: bqual.into(),
        }
    }
}

/// A transaction identifier: either locally generated or distributed.
///
/// Identifiers are totally ordered so that every transaction acquires item
/// locks in the same order. Local ids sort before distributed ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Xid {
    /// A sequential id assigned by the engine.
    Local(u64),
    /// An id supplied by an external transaction manager.
    Global(GlobalXid),
}

impl Xid {
    /// Returns true for distributed transaction ids.
    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global(_))
    }

    /// Returns the file stem used for this transaction's recovery files.
    ///
    /// Local ids become `L<n>`; distributed ids become
    /// `X<format>-<hex gtrid>-<hex bqual>`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        match self {
            Self::Local(n) => format!("L{n}"),
            Self::Global(g) => {
                format!("X{}-{}-{}", g.format_id, to_hex(&g.gtrid), to_hex(&g.bqual))
            }
        }
    }

    /// Parses a file stem produced by [`Xid::file_stem`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the stem is malformed.
    pub fn from_file_stem(stem: &str) -> CoreResult<Self> {
        let bad = || CoreError::invalid_operation(format!("malformed transaction stem: {stem}"));
        if let Some(rest) = stem.strip_prefix('L') {
            return rest.parse().map(Self::Local).map_err(|_| bad());
        }
        let rest = stem.strip_prefix('X').ok_or_else(bad)?;
        // The format id may be negative, so split from the right.
        let mut parts = rest.rsplitn(3, '-');
        let bqual = parts.next().ok_or_else(bad)?;
        let gtrid = parts.next().ok_or_else(bad)?;
        let format = parts.next().ok_or_else(bad)?;
        Ok(Self::Global(GlobalXid {
            format_id: format.parse().map_err(|_| bad())?,
            gtrid: from_hex(gtrid).ok_or_else(bad)?,
            bqual: from_hex(bqual).ok_or_else(bad)?,
        }))
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

impl From<GlobalXid> for Xid {
    fn from(xid: GlobalXid) -> Self {
        Self::Global(xid)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// The three kinds of transactional items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemKind {
    /// Byte-addressable series.
    Range,
    /// Sparse point series.
    Points,
    /// Whole-item blob.
    Blob,
}

impl ItemKind {
    /// Returns the lowercase name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::Points => "points",
            Self::Blob => "blob",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An item identifier qualified by its kind.
///
/// Range, point and blob items live in separate namespaces, so `/ts/a` may
/// exist once per kind. This is the sort key for transaction-lock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    /// The item kind.
    pub kind: ItemKind,
    /// The item identifier.
    pub id: ItemId,
}

impl ItemKey {
    /// Creates an item key.
    #[must_use]
    pub fn new(kind: ItemKind, id: ItemId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_sort_before_global() {
        let local = Xid::Local(99);
        let global = Xid::Global(GlobalXid::new(1, b"g".to_vec(), b"b".to_vec()));
        assert!(local < global);
        assert!(Xid::Local(1) < Xid::Local(2));
    }

    #[test]
    fn file_stem_parses_back() {
        let ids = [
            Xid::Local(42),
            Xid::Global(GlobalXid::new(-7, vec![0xde, 0xad], Vec::new())),
            Xid::Global(GlobalXid::new(4660, b"gtrid".to_vec(), b"branch".to_vec())),
        ];
        for xid in ids {
            let stem = xid.file_stem();
            assert_eq!(Xid::from_file_stem(&stem).unwrap(), xid, "stem {stem}");
        }
    }

    #[test]
    fn malformed_stems_are_rejected() {
        for stem in ["", "L", "Lx", "X1-zz-00", "X1-0", "Q5"] {
            assert!(Xid::from_file_stem(stem).is_err(), "stem {stem}");
        }
    }

    #[test]
    fn item_keys_order_by_kind_then_id() {
        let a = ItemKey::new(ItemKind::Range, ItemId::parse("/b/z").unwrap());
        let b = ItemKey::new(ItemKind::Points, ItemId::parse("/a/a").unwrap());
        assert!(a < b);
        assert_eq!(a.to_string(), "range:/b/z");
    }
}
