//! Per-transaction journals.
//!
//! A journal is an append-only file of entries, each naming an item, a
//! destination marker and a payload. Items append their pending writes while a
//! transaction runs and read them back by offset; commit and recovery replay a
//! journal sequentially.
//!
//! ## Entry Format
//!
//! ```text
//! | magic (4) | version (2) | id len (2) | id | dest (8) | len (4) | payload | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! - A truncated final entry is a clean end of journal: it was never synced,
//!   so its transaction never reached prepare.
//! - Bad magic, an unsupported version or a CRC mismatch is fatal and reported
//!   as `JournalCorruption`.

mod entry;
mod iterator;
mod writer;

pub use entry::{compute_crc32, JournalEntry, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use iterator::JournalIterator;
pub use writer::Journal;
