//! Ordinal-addressable index directory.
//!
//! The directory keeps every committed `Meta` in memory, in ordinal order,
//! with a key map for point lookups. The on-medium copy is a local mirror file
//! of fixed-width records (see [`super::record`]) that `flush` uploads to the
//! durable store.

use super::record::RecordCodec;
use crate::blob::BlobStore;
use crate::value_log::remove;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tkv_common::{Meta, Result, Tag, TkvError};
use tracing::{debug, info, warn};

/// Sets `next` of tag `tag` on the already committed entry at `position`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relink {
    pub position: u64,
    pub tag: String,
    pub next: u64,
}

/// Committed entries as seen by readers.
#[derive(Default)]
struct Snapshot {
    /// Entries indexed by ordinal position.
    entries: Vec<Meta>,
    /// Key to ordinal position.
    by_key: BTreeMap<String, u64>,
}

/// Sorted, ordinal-addressable directory of committed entries.
///
/// Lookups take a shared lock on the snapshot; `commit` writes to the medium
/// first and then swaps the new entries in under the exclusive lock, so a
/// reader sees either the whole batch or none of it.
pub struct IndexDirectory {
    name: String,
    codec: RecordCodec,
    local: Arc<dyn BlobStore>,
    durable: Arc<dyn BlobStore>,
    snapshot: RwLock<Snapshot>,
    /// Serializes commit, flush and delete.
    commit_lock: Mutex<()>,
}

impl IndexDirectory {
    /// Opens the directory, restoring the local mirror from the durable copy
    /// if the mirror is missing.
    pub fn open(
        name: impl Into<String>,
        codec: RecordCodec,
        local: Arc<dyn BlobStore>,
        durable: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let name = name.into();

        if !local.exists(&name)? && durable.exists(&name)? {
            let contents = durable.read_all(&name)?;
            local.write_all(&name, &contents)?;
            info!(index = %name, bytes = contents.len(), "index mirror restored from durable copy");
        }

        let snapshot = Self::load(&name, &codec, local.as_ref())?;
        info!(index = %name, entries = snapshot.entries.len(), "index directory opened");

        Ok(Self {
            name,
            codec,
            local,
            durable,
            snapshot: RwLock::new(snapshot),
            commit_lock: Mutex::new(()),
        })
    }

    /// Decodes every record in the local mirror.
    ///
    /// A trailing partial record is cut off, and `next` pointers at or beyond
    /// the committed size are cleared; both are left behind by a commit that
    /// was interrupted.
    fn load(name: &str, codec: &RecordCodec, local: &dyn BlobStore) -> Result<Snapshot> {
        if !local.exists(name)? {
            return Ok(Snapshot::default());
        }

        let data = local.read_all(name)?;
        let record_size = codec.record_size();
        let whole = data.len() / record_size;
        if data.len() % record_size != 0 {
            warn!(
                index = name,
                bytes = data.len() % record_size,
                "dropping partial record at end of index"
            );
            local.truncate(name, codec.slot_offset(whole as u64))?;
        }

        let mut snapshot = Snapshot::default();
        for (i, record) in data.chunks_exact(record_size).enumerate() {
            let position = i as u64;
            let meta = codec.decode(record, position)?;
            if snapshot.by_key.insert(meta.key.clone(), position).is_some() {
                return Err(TkvError::IndexCorrupted {
                    position,
                    reason: format!("duplicate key {}", meta.key),
                });
            }
            snapshot.entries.push(meta);
        }

        let size = snapshot.entries.len() as u64;
        for meta in snapshot.entries.iter_mut() {
            let mut dangling = false;
            for tag in meta.tags.values_mut() {
                if tag.next.is_some_and(|next| next >= size) {
                    tag.next = None;
                    dangling = true;
                }
            }
            if dangling {
                warn!(index = name, position = meta.position, "cleared dangling tag link");
                local.write_at(name, codec.slot_offset(meta.position), &codec.encode(meta)?)?;
            }
        }

        Ok(snapshot)
    }

    /// Returns the number of committed entries.
    pub fn size(&self) -> u64 {
        self.snapshot.read().entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the record codec.
    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    /// Looks up an entry by key.
    pub fn lookup(&self, key: &str) -> Option<Meta> {
        let snapshot = self.snapshot.read();
        let position = *snapshot.by_key.get(key)?;
        snapshot.entries.get(position as usize).cloned()
    }

    /// Looks up an entry by key, only if it carries `tag`.
    pub fn lookup_tagged(&self, key: &str, tag: &str) -> Option<Meta> {
        self.lookup(key).filter(|meta| meta.has_tag(tag))
    }

    /// Looks up an entry by ordinal position.
    pub fn lookup_position(&self, position: u64) -> Option<Meta> {
        let index = usize::try_from(position).ok()?;
        self.snapshot.read().entries.get(index).cloned()
    }

    /// Returns true if `key` is committed.
    pub fn contains(&self, key: &str) -> bool {
        self.snapshot.read().by_key.contains_key(key)
    }

    /// Returns all committed keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        self.snapshot.read().by_key.keys().cloned().collect()
    }

    /// Returns, for every tag name, the tag of the last committed entry
    /// carrying it.
    pub fn chain_tails(&self) -> HashMap<String, Tag> {
        let snapshot = self.snapshot.read();
        let mut tails = HashMap::new();
        for meta in &snapshot.entries {
            for tag in meta.tags.values() {
                tails.insert(tag.name.clone(), tag.clone());
            }
        }
        tails
    }

    /// Appends `batch` and applies `relinks` to earlier entries.
    ///
    /// `batch` must already carry positions `size()..size() + batch.len()`.
    /// Relinked slots are rewritten before the batch is appended, so an
    /// interrupted commit leaves at worst `next` pointers past the end, which
    /// `open` clears. On error nothing becomes visible to readers and the local
    /// mirror is rolled back.
    pub fn commit(&self, batch: &[Meta], relinks: &[Relink]) -> Result<()> {
        let _guard = self.commit_lock.lock();
        if batch.is_empty() {
            return Ok(());
        }

        let base = self.size();
        let mut appended = BytesMut::with_capacity(batch.len() * self.codec.record_size());
        {
            let snapshot = self.snapshot.read();
            for (i, meta) in batch.iter().enumerate() {
                let expected = base + i as u64;
                if meta.position != expected {
                    return Err(TkvError::Internal(format!(
                        "entry {} has position {}, expected {}",
                        meta.key, meta.position, expected
                    )));
                }
                if snapshot.by_key.contains_key(&meta.key) {
                    return Err(TkvError::Internal(format!(
                        "key {} is already committed",
                        meta.key
                    )));
                }
                appended.extend_from_slice(&self.codec.encode(meta)?);
            }
        }

        let (original, relinked) = self.apply_relinks(relinks)?;
        self.restore_mirror()?;

        if let Err(e) = self.write_commit(base, &appended, &relinked) {
            self.roll_back(base, &original);
            return Err(e);
        }

        let mut snapshot = self.snapshot.write();
        for meta in relinked {
            let index = meta.position as usize;
            snapshot.entries[index] = meta;
        }
        for meta in batch {
            snapshot.by_key.insert(meta.key.clone(), meta.position);
            snapshot.entries.push(meta.clone());
        }
        debug!(
            index = %self.name,
            appended = batch.len(),
            relinked = relinks.len(),
            size = snapshot.entries.len(),
            "index batch committed"
        );
        Ok(())
    }

    /// Returns the affected committed entries before and after `relinks`.
    fn apply_relinks(&self, relinks: &[Relink]) -> Result<(Vec<Meta>, Vec<Meta>)> {
        let snapshot = self.snapshot.read();
        let mut updated: BTreeMap<u64, Meta> = BTreeMap::new();

        for relink in relinks {
            let meta = match updated.entry(relink.position) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let current = snapshot
                        .entries
                        .get(relink.position as usize)
                        .cloned()
                        .ok_or_else(|| {
                            TkvError::Internal(format!(
                                "relink of uncommitted position {}",
                                relink.position
                            ))
                        })?;
                    entry.insert(current)
                }
            };
            let tag = meta.tag_mut(&relink.tag).ok_or_else(|| {
                TkvError::Internal(format!(
                    "entry at position {} has no tag {}",
                    relink.position, relink.tag
                ))
            })?;
            tag.next = Some(relink.next);
        }

        let original = updated
            .keys()
            .map(|&position| snapshot.entries[position as usize].clone())
            .collect();
        Ok((original, updated.into_values().collect()))
    }

    fn write_commit(&self, base: u64, appended: &[u8], relinked: &[Meta]) -> Result<()> {
        for meta in relinked {
            let record = self.codec.encode(meta)?;
            self.local
                .write_at(&self.name, self.codec.slot_offset(meta.position), &record)?;
        }
        let expected = self.codec.slot_offset(base);
        let at = self.local.append(&self.name, appended)?;
        if at != expected {
            return Err(TkvError::IndexCorrupted {
                position: base,
                reason: format!("index file holds {} bytes, expected {}", at, expected),
            });
        }
        Ok(())
    }

    /// Rewrites a missing local mirror from the committed entries.
    fn restore_mirror(&self) -> Result<()> {
        if self.local.exists(&self.name)? {
            return Ok(());
        }
        let snapshot = self.snapshot.read();
        if snapshot.entries.is_empty() {
            return Ok(());
        }
        let mut contents =
            BytesMut::with_capacity(snapshot.entries.len() * self.codec.record_size());
        for meta in &snapshot.entries {
            contents.extend_from_slice(&self.codec.encode(meta)?);
        }
        self.local.write_all(&self.name, &contents)?;
        info!(index = %self.name, entries = snapshot.entries.len(), "index mirror rebuilt from memory");
        Ok(())
    }

    /// Best-effort restore of the local mirror to its state before a commit.
    fn roll_back(&self, base: u64, original: &[Meta]) {
        if let Err(e) = self.local.truncate(&self.name, self.codec.slot_offset(base)) {
            warn!(index = %self.name, error = %e, "failed to truncate index after failed commit");
        }
        for meta in original {
            let restored = self.codec.encode(meta).and_then(|record| {
                self.local
                    .write_at(&self.name, self.codec.slot_offset(meta.position), &record)
            });
            if let Err(e) = restored {
                warn!(
                    index = %self.name,
                    position = meta.position,
                    error = %e,
                    "failed to restore relinked entry after failed commit"
                );
            }
        }
    }

    /// Syncs the local mirror and uploads it to the durable store.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        self.restore_mirror()?;
        self.local.sync(&self.name)?;
        let contents = if self.local.exists(&self.name)? {
            self.local.read_all(&self.name)?
        } else {
            Vec::new()
        };
        self.durable.write_all(&self.name, &contents)?;
        debug!(index = %self.name, bytes = contents.len(), "index flushed to durable store");
        Ok(())
    }

    /// Releases the local mirror handle.
    pub fn close(&self) -> Result<()> {
        self.local.close(&self.name)
    }

    /// Deletes both copies and forgets all entries. True if both are gone.
    pub fn delete(&self) -> bool {
        let local = self.delete_local();
        let remote = self.delete_remote();
        if local && remote {
            *self.snapshot.write() = Snapshot::default();
        }
        local && remote
    }

    /// Deletes the local mirror.
    pub fn delete_local(&self) -> bool {
        let _guard = self.commit_lock.lock();
        remove(self.local.as_ref(), &self.name, "local")
    }

    /// Deletes the durable copy.
    pub fn delete_remote(&self) -> bool {
        let _guard = self.commit_lock.lock();
        remove(self.durable.as_ref(), &self.name, "remote")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemStore;
    use tkv_common::StoreConfig;

    fn codec() -> RecordCodec {
        RecordCodec::new(&StoreConfig {
            key_length: 16,
            tag_length: 8,
            max_tags: 2,
            ..Default::default()
        })
    }

    fn create_test_directory() -> (IndexDirectory, Arc<MemStore>, Arc<MemStore>) {
        let local = Arc::new(MemStore::new());
        let durable = Arc::new(MemStore::new());
        let dir = IndexDirectory::open("index", codec(), local.clone(), durable.clone()).unwrap();
        (dir, local, durable)
    }

    fn entry(key: &str, position: u64, tags: &[&str]) -> Meta {
        let mut meta = Meta::new(key, position * 10, 10);
        meta.position = position;
        for name in tags {
            meta.add_tag(name);
            meta.tag_mut(name).unwrap().pos = position;
        }
        meta
    }

    #[test]
    fn test_directory_open_empty() {
        let (dir, _, _) = create_test_directory();
        assert_eq!(dir.size(), 0);
        assert!(dir.is_empty());
        assert!(dir.lookup("a").is_none());
        assert!(dir.lookup_position(0).is_none());
    }

    #[test]
    fn test_directory_commit_and_lookup() {
        let (dir, local, _) = create_test_directory();
        dir.commit(&[entry("a", 0, &["color"]), entry("b", 1, &[])], &[])
            .unwrap();

        assert_eq!(dir.size(), 2);
        assert_eq!(local.size("index").unwrap(), 2 * codec().record_size() as u64);

        let a = dir.lookup("a").unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.position, 0);
        assert_eq!(dir.lookup_position(1).unwrap().key, "b");
        assert!(dir.lookup_position(2).is_none());
        assert!(dir.lookup_position(u64::MAX).is_none());

        assert!(dir.lookup_tagged("a", "color").is_some());
        assert!(dir.lookup_tagged("a", "size").is_none());
        assert!(dir.lookup_tagged("b", "color").is_none());
        assert!(dir.lookup_tagged("c", "color").is_none());
        assert_eq!(dir.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_directory_commit_rejects_bad_positions() {
        let (dir, _, _) = create_test_directory();
        let err = dir.commit(&[entry("a", 3, &[])], &[]).unwrap_err();
        assert!(matches!(err, TkvError::Internal(_)));
        assert_eq!(dir.size(), 0);
    }

    #[test]
    fn test_directory_commit_rejects_committed_key() {
        let (dir, _, _) = create_test_directory();
        dir.commit(&[entry("a", 0, &[])], &[]).unwrap();
        assert!(dir.commit(&[entry("a", 1, &[])], &[]).is_err());
        assert_eq!(dir.size(), 1);
    }

    #[test]
    fn test_directory_relink_updates_committed_entry() {
        let (dir, _, _) = create_test_directory();
        dir.commit(&[entry("a", 0, &["color"])], &[]).unwrap();

        let mut b = entry("b", 1, &["color"]);
        b.tag_mut("color").unwrap().previous = Some(0);
        let relink = Relink {
            position: 0,
            tag: "color".to_string(),
            next: 1,
        };
        dir.commit(&[b], &[relink]).unwrap();

        assert_eq!(dir.lookup("a").unwrap().tag("color").unwrap().next, Some(1));
        assert_eq!(dir.lookup("b").unwrap().tag("color").unwrap().previous, Some(0));
    }

    fn relink(position: u64, tag: &str, next: u64) -> Relink {
        Relink {
            position,
            tag: tag.to_string(),
            next,
        }
    }

    #[test]
    fn test_directory_failed_commit_is_invisible_and_rolled_back() {
        let (dir, local, _) = create_test_directory();
        dir.commit(&[entry("a", 0, &["color"])], &[]).unwrap();
        let before = local.read_all("index").unwrap();

        // The relink write succeeds, the append fails
        local.fail_one_write_after(1);
        let mut b = entry("b", 1, &["color"]);
        b.tag_mut("color").unwrap().previous = Some(0);
        assert!(dir.commit(&[b], &[relink(0, "color", 1)]).is_err());
        local.clear_failures();

        assert_eq!(dir.size(), 1);
        assert!(dir.lookup("b").is_none());
        assert_eq!(dir.lookup("a").unwrap().tag("color").unwrap().next, None);
        assert_eq!(local.read_all("index").unwrap(), before);
    }

    #[test]
    fn test_directory_reopen_restores_entries() {
        let local = Arc::new(MemStore::new());
        let durable = Arc::new(MemStore::new());
        {
            let dir =
                IndexDirectory::open("index", codec(), local.clone(), durable.clone()).unwrap();
            dir.commit(&[entry("a", 0, &["x"]), entry("b", 1, &["x", "y"])], &[])
                .unwrap();
        }

        let dir = IndexDirectory::open("index", codec(), local, durable).unwrap();
        assert_eq!(dir.size(), 2);
        assert_eq!(dir.lookup("b").unwrap().position, 1);

        let tails = dir.chain_tails();
        assert_eq!(tails.len(), 2);
        assert_eq!(tails["x"].pos, 1);
        assert_eq!(tails["y"].pos, 1);
    }

    #[test]
    fn test_directory_flush_uploads_and_restores_mirror() {
        let local = Arc::new(MemStore::new());
        let durable = Arc::new(MemStore::new());
        {
            let dir =
                IndexDirectory::open("index", codec(), local.clone(), durable.clone()).unwrap();
            dir.commit(&[entry("a", 0, &[])], &[]).unwrap();
            assert!(!durable.exists("index").unwrap());
            dir.flush().unwrap();
            assert_eq!(durable.read_all("index").unwrap(), local.read_all("index").unwrap());
        }

        // Lose the local mirror; reopening pulls it back from the durable copy
        local.delete("index").unwrap();
        let dir = IndexDirectory::open("index", codec(), local.clone(), durable).unwrap();
        assert_eq!(dir.size(), 1);
        assert!(local.exists("index").unwrap());
    }

    #[test]
    fn test_directory_open_repairs_interrupted_commit() {
        let local = Arc::new(MemStore::new());
        let durable = Arc::new(MemStore::new());
        let codec = codec();
        let linked_b = || {
            let mut b = entry("b", 1, &["x"]);
            b.tag_mut("x").unwrap().previous = Some(0);
            b
        };
        {
            let dir =
                IndexDirectory::open("index", codec, local.clone(), durable.clone()).unwrap();
            dir.commit(&[entry("a", 0, &["x"])], &[]).unwrap();

            // The relink lands, then the append and the rollback both fail
            local.fail_writes_after(1);
            assert!(dir.commit(&[linked_b()], &[relink(0, "x", 1)]).is_err());
            local.clear_failures();
        }
        // A partially written record
        local.append("index", &[0u8; 7]).unwrap();

        let on_disk = codec.decode(&local.read_all("index").unwrap()[..codec.record_size()], 0);
        assert_eq!(on_disk.unwrap().tag("x").unwrap().next, Some(1));

        let dir = IndexDirectory::open("index", codec, local.clone(), durable).unwrap();
        assert_eq!(dir.size(), 1);
        assert_eq!(dir.lookup("a").unwrap().tag("x").unwrap().next, None);
        assert_eq!(local.size("index").unwrap(), codec.record_size() as u64);
        let reloaded = codec.decode(&local.read_all("index").unwrap(), 0).unwrap();
        assert_eq!(reloaded.tag("x").unwrap().next, None);

        // Retrying the commit links both directions
        dir.commit(&[linked_b()], &[relink(0, "x", 1)]).unwrap();
        assert_eq!(dir.lookup("a").unwrap().tag("x").unwrap().next, Some(1));
        assert_eq!(dir.lookup("b").unwrap().tag("x").unwrap().previous, Some(0));
    }

    #[test]
    fn test_directory_flush_rebuilds_lost_mirror() {
        let (dir, local, durable) = create_test_directory();
        dir.commit(&[entry("a", 0, &["x"]), entry("b", 1, &["x"])], &[])
            .unwrap();
        dir.flush().unwrap();
        let flushed = durable.read_all("index").unwrap();

        assert!(dir.delete_local());
        dir.flush().unwrap();
        assert_eq!(durable.read_all("index").unwrap(), flushed);
        assert_eq!(local.read_all("index").unwrap(), flushed);
    }

    #[test]
    fn test_directory_commit_after_lost_mirror() {
        let (dir, local, durable) = create_test_directory();
        dir.commit(&[entry("a", 0, &[])], &[]).unwrap();
        assert!(dir.delete_local());

        dir.commit(&[entry("c", 1, &[])], &[]).unwrap();
        assert_eq!(dir.size(), 2);
        assert_eq!(local.size("index").unwrap(), 2 * codec().record_size() as u64);

        let reopened = IndexDirectory::open("index", codec(), local, durable).unwrap();
        assert_eq!(reopened.size(), 2);
        assert_eq!(reopened.lookup_position(1).unwrap().key, "c");
    }

    #[test]
    fn test_directory_open_detects_corruption() {
        let local = Arc::new(MemStore::new());
        let durable = Arc::new(MemStore::new());
        let mut record = codec().encode(&entry("a", 0, &[])).unwrap().to_vec();
        record[3] ^= 0x01;
        local.append("index", &record).unwrap();

        let result = IndexDirectory::open("index", codec(), local, durable);
        assert!(matches!(
            result,
            Err(TkvError::IndexCorrupted { position: 0, .. })
        ));
    }

    #[test]
    fn test_directory_delete() {
        let (dir, local, durable) = create_test_directory();
        dir.commit(&[entry("a", 0, &[])], &[]).unwrap();
        dir.flush().unwrap();

        assert!(dir.delete_remote());
        assert!(!durable.exists("index").unwrap());
        assert_eq!(dir.size(), 1);

        assert!(dir.delete());
        assert!(!local.exists("index").unwrap());
        assert_eq!(dir.size(), 0);
    }
}
