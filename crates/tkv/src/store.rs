//! The `Tkv` store: pending writes, index builds and tag navigation.

use crate::chain::TagChainBuilder;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tkv_common::{Meta, Record, Result, StoreConfig, TkvError};
use tkv_storage::{BlobStore, FileStore, IndexDirectory, LogPhase, RecordCodec, ValueLog};
use tracing::{debug, info, warn};

/// State mutated by `put` and `build_index`, guarded by the write lock.
struct WriteState {
    /// Entries written since the last successful build, in put order.
    pending: Vec<Meta>,
    /// Keys of `pending`.
    pending_keys: HashSet<String>,
    /// Tag chain tails.
    chain: TagChainBuilder,
}

impl WriteState {
    fn new(chain: TagChainBuilder) -> Self {
        Self {
            pending: Vec::new(),
            pending_keys: HashSet::new(),
            chain,
        }
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_keys.clear();
    }
}

/// Append-only key-value store with a separately built, sorted index.
///
/// Values become visible to lookups only after [`Tkv::build_index`]. Writes,
/// builds, close and delete are serialized by one write lock; lookups take no
/// store-level lock and see each built batch either completely or not at all.
///
/// ```text
/// store.start_write()?;
/// store.put("a", b"v1", &["color"])?;
/// store.put("b", b"v2", &["color"])?;
/// store.build_index()?;
/// store.end_write()?;
///
/// store.start_read()?;
/// assert_eq!(store.get_next("a", "color")?.as_deref(), Some(&b"v2"[..]));
/// store.end_read()?;
/// ```
pub struct Tkv {
    index: IndexDirectory,
    values: ValueLog,
    write: Mutex<WriteState>,
}

impl Tkv {
    /// Opens the store described by `config`, creating its directories.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let local: Arc<dyn BlobStore> =
            Arc::new(FileStore::open(config.local_dir.clone(), config.fsync_enabled)?);
        let durable: Arc<dyn BlobStore> =
            Arc::new(FileStore::open(config.remote_dir.clone(), config.fsync_enabled)?);
        Self::with_stores(config, local, durable)
    }

    /// Opens the store on explicit local mirror and durable backends.
    pub fn with_stores(
        config: StoreConfig,
        local: Arc<dyn BlobStore>,
        durable: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.validate()?;

        let index = IndexDirectory::open(
            config.index_filename.clone(),
            RecordCodec::new(&config),
            local.clone(),
            durable.clone(),
        )?;
        let values = ValueLog::open(
            config.data_filename.clone(),
            durable,
            local,
            config.write_buffer_bytes,
        )?;
        let chain = TagChainBuilder::from_tails(index.chain_tails());

        info!(
            entries = index.size(),
            chains = chain.len(),
            value_bytes = values.len(),
            "tkv store opened"
        );

        Ok(Self {
            index,
            values,
            write: Mutex::new(WriteState::new(chain)),
        })
    }

    /// Buffers `value` under `key` with the given tags.
    ///
    /// Returns `Ok(false)` without writing anything if `key` is already
    /// committed or pending. Repeated tag names collapse into one tag. The
    /// value log must be in the write phase.
    pub fn put(&self, key: &str, value: &[u8], tags: &[&str]) -> Result<bool> {
        let mut meta = Meta::new(key, 0, value.len() as u64);
        for name in tags {
            meta.add_tag(name);
        }
        self.index.codec().check(&meta)?;

        let mut write = self.write.lock();
        if write.pending_keys.contains(key) || self.index.contains(key) {
            debug!(key, "put rejected, key exists");
            return Ok(false);
        }

        meta.offset = self.values.append(value)?;
        debug!(key, offset = meta.offset, length = meta.length, "value buffered");

        write.pending_keys.insert(meta.key.clone());
        write.pending.push(meta);
        Ok(true)
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.index
            .lookup(key)
            .map(|meta| self.read_value(&meta))
            .transpose()
    }

    /// Returns the value stored under `key` if it carries `tag`.
    pub fn get_tagged(&self, key: &str, tag: &str) -> Result<Option<Bytes>> {
        self.index
            .lookup_tagged(key, tag)
            .map(|meta| self.read_value(&meta))
            .transpose()
    }

    /// Returns the value at ordinal `position`.
    pub fn get_at(&self, position: u64) -> Result<Option<Bytes>> {
        self.index
            .lookup_position(position)
            .map(|meta| self.read_value(&meta))
            .transpose()
    }

    /// Returns the entry stored under `key`.
    pub fn get_index(&self, key: &str) -> Option<Meta> {
        self.index.lookup(key)
    }

    /// Returns the entry stored under `key` if it carries `tag`.
    pub fn get_index_tagged(&self, key: &str, tag: &str) -> Option<Meta> {
        self.index.lookup_tagged(key, tag)
    }

    /// Returns the entry at ordinal `position`.
    pub fn get_index_at(&self, position: u64) -> Option<Meta> {
        self.index.lookup_position(position)
    }

    /// Returns the value of the entry after `key` in the chain of `tag`.
    pub fn get_next(&self, key: &str, tag: &str) -> Result<Option<Bytes>> {
        match self.next_position(key, tag) {
            Some(position) => self.get_at(position),
            None => Ok(None),
        }
    }

    /// Returns the value of the entry before `key` in the chain of `tag`.
    pub fn get_previous(&self, key: &str, tag: &str) -> Result<Option<Bytes>> {
        match self.previous_position(key, tag) {
            Some(position) => self.get_at(position),
            None => Ok(None),
        }
    }

    /// Returns the entry after `key` in the chain of `tag`.
    pub fn get_next_index(&self, key: &str, tag: &str) -> Option<Meta> {
        self.index.lookup_position(self.next_position(key, tag)?)
    }

    /// Returns the entry before `key` in the chain of `tag`.
    pub fn get_previous_index(&self, key: &str, tag: &str) -> Option<Meta> {
        self.index.lookup_position(self.previous_position(key, tag)?)
    }

    fn next_position(&self, key: &str, tag: &str) -> Option<u64> {
        self.index.lookup_tagged(key, tag)?.tag(tag)?.next
    }

    fn previous_position(&self, key: &str, tag: &str) -> Option<u64> {
        self.index.lookup_tagged(key, tag)?.tag(tag)?.previous
    }

    fn read_value(&self, meta: &Meta) -> Result<Bytes> {
        self.values.read(meta.offset, meta.length)
    }

    /// Record retrieval is not supported.
    pub fn get_record(&self, _key: &str, _tag: &str) -> Result<Record> {
        Err(TkvError::Unsupported("get_record".to_string()))
    }

    /// Sorts, links and commits all pending entries.
    ///
    /// Does nothing when nothing is pending. If the commit fails, the pending
    /// entries and chain tails are kept as they were and the call can be
    /// retried.
    pub fn build_index(&self) -> Result<()> {
        let mut write = self.write.lock();
        if write.pending.is_empty() {
            return Ok(());
        }

        let base = self.index.size();
        let plan = write.chain.plan(&write.pending, base);
        let count = plan.batch.len();
        self.index.commit(&plan.batch, &plan.relinks)?;

        write.chain.publish(plan.tails);
        write.clear_pending();
        info!(
            entries = count,
            relinked = plan.relinks.len(),
            size = base + count as u64,
            "index built"
        );
        Ok(())
    }

    /// Returns the number of committed entries.
    pub fn size(&self) -> u64 {
        self.index.size()
    }

    /// Returns the number of entries waiting for `build_index`.
    pub fn pending_len(&self) -> usize {
        self.write.lock().pending.len()
    }

    /// Returns the value log size, including staged bytes.
    pub fn value_log_len(&self) -> u64 {
        self.values.len()
    }

    /// Returns the value log phase.
    pub fn phase(&self) -> LogPhase {
        self.values.phase()
    }

    /// Returns all committed keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        self.index.keys()
    }

    /// Opens the value log for appending.
    pub fn start_write(&self) -> Result<()> {
        self.values.open_output()
    }

    /// Flushes the index, then flushes and closes the value log.
    ///
    /// Everything built before this call is durable once it returns. The log
    /// is closed even if the index flush fails.
    pub fn end_write(&self) -> Result<()> {
        let flushed = self.index.flush();
        let closed = self.values.flush_and_close_output();
        flushed.and(closed)
    }

    /// Opens the value log for reads.
    pub fn start_read(&self) -> Result<()> {
        self.values.open_input()
    }

    /// Closes the value log for reads.
    pub fn end_read(&self) -> Result<()> {
        self.values.close_input()
    }

    /// Runs `f` inside a write phase, ending it on every exit path.
    pub fn with_write<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.start_write()?;
        let result = f(self);
        let ended = self.end_write();
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Runs `f` inside a read phase, ending it on every exit path.
    pub fn with_read<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.start_read()?;
        let result = f(self);
        let ended = self.end_read();
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Closes the value log and flushes and closes the index.
    pub fn close(&self) -> Result<()> {
        let write = self.write.lock();
        if !write.pending.is_empty() {
            warn!(pending = write.pending.len(), "closing with unbuilt entries");
        }
        self.values.close()?;
        self.index.flush()?;
        self.index.close()?;
        info!(entries = self.index.size(), "tkv store closed");
        Ok(())
    }

    /// Deletes the local and durable copies of both stores.
    pub fn delete(&self) -> bool {
        let mut write = self.write.lock();
        let values = self.values.delete();
        let index = self.index.delete();
        write.clear_pending();
        write.chain = TagChainBuilder::from_tails(self.index.chain_tails());
        info!(deleted = values && index, "tkv store deleted");
        values && index
    }

    /// Deletes the local mirrors of both stores.
    pub fn delete_local(&self) -> bool {
        let _write = self.write.lock();
        let values = self.values.delete_local();
        let index = self.index.delete_local();
        info!(deleted = values && index, "tkv local mirrors deleted");
        values && index
    }

    /// Deletes the durable copies of both stores.
    ///
    /// Every committed and pending entry points into the deleted value log, so
    /// the index is dropped as well, local mirror included, and the store
    /// starts over empty.
    pub fn delete_remote(&self) -> bool {
        let mut write = self.write.lock();
        let values = self.values.delete_remote();
        let index = self.index.delete();
        write.clear_pending();
        write.chain = TagChainBuilder::from_tails(self.index.chain_tails());
        info!(deleted = values && index, "tkv durable copies deleted");
        values && index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tkv_storage::MemStore;

    fn create_test_store() -> (Tkv, Arc<MemStore>, Arc<MemStore>) {
        let local = Arc::new(MemStore::new());
        let durable = Arc::new(MemStore::new());
        let config = StoreConfig {
            key_length: 16,
            tag_length: 8,
            max_tags: 2,
            ..StoreConfig::with_root("unused")
        };
        let store = Tkv::with_stores(config, local.clone(), durable.clone()).unwrap();
        (store, local, durable)
    }

    #[test]
    fn test_put_requires_write_phase() {
        let (store, _, _) = create_test_store();
        assert!(matches!(
            store.put("a", b"v", &[]),
            Err(TkvError::InvalidPhase { .. })
        ));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_put_validates_key_and_tags() {
        let (store, _, _) = create_test_store();
        store.start_write().unwrap();

        assert!(matches!(store.put("", b"v", &[]), Err(TkvError::EmptyKey)));
        assert!(matches!(
            store.put(&"k".repeat(17), b"v", &[]),
            Err(TkvError::KeyTooLarge { size: 17, max: 16 })
        ));
        assert!(matches!(
            store.put("a", b"v", &["ninechars"]),
            Err(TkvError::TagTooLarge { size: 9, max: 8 })
        ));
        assert!(matches!(
            store.put("a", b"v", &["x", "y", "z"]),
            Err(TkvError::TooManyTags { count: 3, max: 2 })
        ));
        assert_eq!(store.value_log_len(), 0);

        // Repeats collapse
        assert!(store.put("a", b"v", &["x", "x", "y"]).unwrap());
    }

    #[test]
    fn test_put_rejects_pending_duplicate() {
        let (store, _, _) = create_test_store();
        store.start_write().unwrap();

        assert!(store.put("x", b"v", &[]).unwrap());
        assert!(!store.put("x", b"v2", &[]).unwrap());
        assert_eq!(store.pending_len(), 1);
        assert_eq!(store.value_log_len(), 1);
    }

    #[test]
    fn test_build_index_failure_keeps_pending() {
        let (store, local, _) = create_test_store();
        store.start_write().unwrap();
        store.put("a", b"1", &["t"]).unwrap();
        store.build_index().unwrap();
        store.put("b", b"2", &["t"]).unwrap();

        local.fail_writes_after(0);
        assert!(store.build_index().is_err());
        assert_eq!(store.pending_len(), 1);
        assert_eq!(store.size(), 1);
        assert_eq!(store.get_index("a").unwrap().tag("t").unwrap().next, None);

        local.clear_failures();
        store.build_index().unwrap();
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.get_index("a").unwrap().tag("t").unwrap().next, Some(1));
        assert_eq!(store.get_index("b").unwrap().tag("t").unwrap().previous, Some(0));
    }

    #[test]
    fn test_get_record_is_unsupported() {
        let (store, _, _) = create_test_store();
        let err = store.get_record("a", "t").unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_with_write_ends_phase_on_error() {
        let (store, _, _) = create_test_store();
        let result: Result<()> = store.with_write(|s| {
            s.put("a", b"v", &[])?;
            Err(TkvError::Internal("boom".to_string()))
        });
        assert!(matches!(result, Err(TkvError::Internal(_))));
        assert_eq!(store.phase(), LogPhase::Closed);
    }

    #[test]
    fn test_delete_resets_pending_and_chains() {
        let (store, local, durable) = create_test_store();
        store.start_write().unwrap();
        store.put("a", b"v", &["t"]).unwrap();
        store.build_index().unwrap();
        store.put("b", b"v", &["t"]).unwrap();
        store.end_write().unwrap();

        assert!(store.delete());
        assert_eq!(store.size(), 0);
        assert_eq!(store.pending_len(), 0);
        assert!(!local.exists("tkv.idx").unwrap());
        assert!(!durable.exists("tkv.dat").unwrap());

        store.start_write().unwrap();
        store.put("c", b"v", &["t"]).unwrap();
        store.build_index().unwrap();
        let c = store.get_index("c").unwrap();
        assert_eq!(c.position, 0);
        assert_eq!(c.tag("t").unwrap().previous, None);
    }
}
