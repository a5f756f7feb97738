//! # xfstore testkit
//!
//! Helpers for testing code built on the xfstore transaction engine:
//! [`TestStore`] owns a temporary data directory that can be crashed and
//! reopened, [`crash`] drives the engine's fault points, [`generators`]
//! holds proptest strategies, and [`stress`] runs concurrent workloads.
//!
//! ```rust,no_run
//! use xfstore_testkit::TestStore;
//!
//! let mut store = TestStore::new();
//! store.commit_range("/ts/a", 0, b"ABCD");
//! store.reopen();
//! assert_eq!(store.committed_range("/ts/a", 0, 4), b"ABCD");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
