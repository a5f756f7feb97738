//! Hierarchical item identifiers.

use crate::error::{StorageError, StorageResult};
use std::fmt;
use std::str::FromStr;

/// Identifies exactly one logical storage item: a path plus a leaf name.
///
/// Identifiers are written `/<segment>/.../<name>`. The path of `/ts/a` is
/// `/ts` and its name is `a`; the path of `/a` is `/`. Ordering compares the
/// path first, then the name, which gives the stable order used when a
/// transaction locks several items.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId {
    path: String,
    name: String,
}

impl ItemId {
    /// Creates an identifier from a path and a leaf name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidId`] if the path is not absolute or a
    /// segment is empty, `.`, `..` or contains characters outside
    /// `[A-Za-z0-9_.-]`.
    pub fn new(path: &str, name: &str) -> StorageResult<Self> {
        if !path.starts_with('/') {
            return Err(StorageError::InvalidId(format!(
                "path must be absolute: {path}"
            )));
        }
        let trimmed = path.trim_end_matches('/');
        for segment in trimmed.split('/').skip(1) {
            validate_segment(segment, path)?;
        }
        validate_segment(name, name)?;

        let path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        Ok(Self {
            path,
            name: name.to_string(),
        })
    }

    /// Parses a full identifier such as `/ts/a`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidId`] if the text is not a valid identifier.
    pub fn parse(text: &str) -> StorageResult<Self> {
        match text.rfind('/') {
            Some(0) => Self::new("/", &text[1..]),
            Some(split) => Self::new(&text[..split], &text[split + 1..]),
            None => Err(StorageError::InvalidId(format!(
                "identifier must be absolute: {text}"
            ))),
        }
    }

    /// Returns the path part, always starting with `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the leaf name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path relative to a storage root, without the leading `/`.
    #[must_use]
    pub fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    /// Returns a hash that is stable across processes and platforms.
    ///
    /// Used to pick open-table shards and router queues.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        let mut hash = FNV_OFFSET;
        for byte in self.path.bytes().chain([0u8]).chain(self.name.bytes()) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Returns the shard in `0..shards` this identifier belongs to.
    #[must_use]
    pub fn shard(&self, shards: usize) -> usize {
        (self.stable_hash() % shards.max(1) as u64) as usize
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn validate_segment(segment: &str, context: &str) -> StorageResult<()> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(format!(
            "bad segment {segment:?} in {context}"
        )))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path == "/" {
            write!(f, "/{}", self.name)
        } else {
            write!(f, "{}/{}", self.path, self.name)
        }
    }
}

impl FromStr for ItemId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
