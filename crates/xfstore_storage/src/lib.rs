//! # xfstore storage
//!
//! Storage collaborators for the xfstore transaction engine.
//!
//! This crate knows nothing about transactions. It provides:
//!
//! - [`StorageBackend`]: opaque byte stores ([`FileBackend`], [`MemoryBackend`])
//! - [`ItemId`]: hierarchical, totally ordered item identifiers
//! - [`ItemStorage`]: the data and metadata regions of one item
//! - [`StorageAllocator`]: the allocator contract, implemented by
//!   [`DirectoryAllocator`] and handed out by [`AllocatorFactory`]
//! - [`BlobLocator`]: where blob files and their staging directories live
//!
//! ## Example
//!
//! ```rust
//! use xfstore_storage::{ItemId, ItemStorage};
//!
//! let storage = ItemStorage::in_memory(ItemId::parse("/ts/cpu").unwrap());
//! storage.write_data(8, b"sample").unwrap();
//! assert_eq!(storage.data_len().unwrap(), 14);
//! assert_eq!(storage.read_data(8, 64).unwrap(), b"sample");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod allocator;
mod backend;
mod blob;
mod error;
mod file;
mod id;
mod item;
mod memory;

pub use allocator::{AllocatorFactory, DirectoryAllocator, StorageAllocator};
pub use backend::StorageBackend;
pub use blob::{BlobLocator, SENTINEL_NAME, TRANSACTION_DIR_SUFFIX};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, OpenMode};
pub use id::ItemId;
pub use item::ItemStorage;
pub use memory::MemoryBackend;
