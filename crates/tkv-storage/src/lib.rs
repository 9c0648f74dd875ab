//! Storage layer for tkv.
//!
//! This crate provides:
//! - Blob stores: named byte objects on disk or in memory
//! - Value log: append-only value storage with write and read phases
//! - Index directory: fixed-width, ordinal-addressable entry records

mod blob;
mod disk;
mod index;
mod value_log;

pub use blob::{BlobStore, MemStore};
pub use disk::{FileStore, FileStoreConfig};
pub use index::{IndexDirectory, RecordCodec, Relink};
pub use value_log::{LogPhase, ValueLog};
