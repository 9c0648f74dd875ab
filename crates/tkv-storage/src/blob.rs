//! Byte-object backends.
//!
//! The value log and the index directory see their medium only through
//! [`BlobStore`]: named objects that can be appended to, read at an offset,
//! replaced wholesale, synced and deleted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tkv_common::{Result, TkvError};

/// A store of named byte objects.
pub trait BlobStore: Send + Sync {
    /// Returns true if the object exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Returns the object size in bytes, or 0 if it does not exist.
    fn size(&self, name: &str) -> Result<u64>;

    /// Appends bytes, creating the object if needed. Returns the offset the
    /// bytes were written at.
    fn append(&self, name: &str, data: &[u8]) -> Result<u64>;

    /// Overwrites bytes at `offset`. The range must lie within the object.
    fn write_at(&self, name: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Reads the whole object.
    fn read_all(&self, name: &str) -> Result<Vec<u8>>;

    /// Replaces the object contents.
    fn write_all(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Shrinks the object to `len` bytes.
    fn truncate(&self, name: &str, len: u64) -> Result<()>;

    /// Forces written bytes to the medium.
    fn sync(&self, name: &str) -> Result<()>;

    /// Releases any handle held for the object.
    fn close(&self, name: &str) -> Result<()>;

    /// Removes the object. Returns true if it existed.
    fn delete(&self, name: &str) -> Result<bool>;
}

/// In-memory [`BlobStore`] with optional write fault injection.
pub struct MemStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    /// Remaining successful writes before failures start; negative = unlimited.
    write_budget: AtomicI64,
    /// Failures to inject once the budget is spent; negative = unlimited.
    failures: AtomicI64,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            write_budget: AtomicI64::new(-1),
            failures: AtomicI64::new(-1),
        }
    }

    /// Makes every write fail after `writes` more successful ones.
    pub fn fail_writes_after(&self, writes: usize) {
        self.failures.store(-1, Ordering::SeqCst);
        self.write_budget.store(writes as i64, Ordering::SeqCst);
    }

    /// Makes the write after `writes` more successful ones fail, and only that one.
    pub fn fail_one_write_after(&self, writes: usize) {
        self.failures.store(1, Ordering::SeqCst);
        self.write_budget.store(writes as i64, Ordering::SeqCst);
    }

    /// Clears any injected failure.
    pub fn clear_failures(&self) {
        self.write_budget.store(-1, Ordering::SeqCst);
    }

    fn charge_write(&self, name: &str) -> Result<()> {
        let budget = self.write_budget.load(Ordering::SeqCst);
        if budget < 0 {
            return Ok(());
        }
        if budget > 0 {
            self.write_budget.store(budget - 1, Ordering::SeqCst);
            return Ok(());
        }
        match self.failures.load(Ordering::SeqCst) {
            0 => {
                self.clear_failures();
                Ok(())
            }
            failures => {
                if failures > 0 {
                    self.failures.store(failures - 1, Ordering::SeqCst);
                }
                Err(TkvError::IoError(format!("injected write failure on {}", name)))
            }
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemStore {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.objects.lock().contains_key(name))
    }

    fn size(&self, name: &str) -> Result<u64> {
        Ok(self
            .objects
            .lock()
            .get(name)
            .map(|data| data.len() as u64)
            .unwrap_or(0))
    }

    fn append(&self, name: &str, data: &[u8]) -> Result<u64> {
        self.charge_write(name)?;
        let mut objects = self.objects.lock();
        let object = objects.entry(name.to_string()).or_default();
        let offset = object.len() as u64;
        object.extend_from_slice(data);
        Ok(offset)
    }

    fn write_at(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.charge_write(name)?;
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(name)
            .ok_or_else(|| TkvError::IoError(format!("object {} does not exist", name)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > object.len() {
            return Err(TkvError::ReadOutOfBounds {
                offset,
                length: data.len() as u64,
                size: object.len() as u64,
            });
        }
        object[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let objects = self.objects.lock();
        let object = objects
            .get(name)
            .ok_or_else(|| TkvError::IoError(format!("object {} does not exist", name)))?;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if end > object.len() {
            return Err(TkvError::ReadOutOfBounds {
                offset,
                length: len as u64,
                size: object.len() as u64,
            });
        }
        Ok(object[start..end].to_vec())
    }

    fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| TkvError::IoError(format!("object {} does not exist", name)))
    }

    fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        self.charge_write(name)?;
        self.objects.lock().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn truncate(&self, name: &str, len: u64) -> Result<()> {
        if let Some(object) = self.objects.lock().get_mut(name) {
            object.truncate(len as usize);
        }
        Ok(())
    }

    fn sync(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn close(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.objects.lock().remove(name).is_some())
    }
}
