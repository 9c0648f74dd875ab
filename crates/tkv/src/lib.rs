//! tkv: an append-only key-value store with a sorted, separately built index.
//!
//! Values are appended to a value log by [`Tkv::put`] and become visible once
//! [`Tkv::build_index`] sorts the pending entries and commits them to the index
//! directory. Entries sharing a tag name are threaded into a doubly linked
//! chain, in commit order, that [`Tkv::get_next`] and [`Tkv::get_previous`]
//! walk.

mod chain;
mod store;

pub use chain::{ChainPlan, TagChainBuilder};
pub use store::Tkv;
pub use tkv_common::{Meta, Record, Result, StoreConfig, Tag, TkvError};
pub use tkv_storage::{BlobStore, FileStore, LogPhase, MemStore};
