//! Directory-backed blob store.

use crate::blob::BlobStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tkv_common::{Result, TkvError};

/// Configuration for a file store.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Directory holding the objects.
    pub dir: PathBuf,
    /// Enable fsync on `sync`, `write_all` and `close`.
    pub fsync_enabled: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Stores each named object as a file in one directory.
///
/// Open handles are cached per name and shared under a mutex, so reads and
/// writes against the same object are serialized.
pub struct FileStore {
    /// Configuration.
    config: FileStoreConfig,
    /// Open file handles keyed by object name.
    files: Mutex<HashMap<String, FileHandle>>,
}

/// Handle for an open object file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Current file size in bytes.
    size: u64,
}

impl FileStore {
    /// Creates a file store, creating its directory if needed.
    pub fn new(config: FileStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Shorthand for a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, fsync_enabled: bool) -> Result<Self> {
        Self::new(FileStoreConfig {
            dir: dir.into(),
            fsync_enabled,
        })
    }

    /// Returns the directory path.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Generates the file path for an object name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.config.dir.join(name)
    }

    /// Runs `f` against the cached handle for `name`, opening the file first
    /// if needed. Missing files are only created when `create` is set.
    fn with_handle<T>(
        &self,
        name: &str,
        create: bool,
        f: impl FnOnce(&mut FileHandle) -> Result<T>,
    ) -> Result<T> {
        let mut files = self.files.lock();

        if !files.contains_key(name) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(self.file_path(name))?;
            let size = file.metadata()?.len();
            files.insert(name.to_string(), FileHandle { file, size });
        }

        let handle = files
            .get_mut(name)
            .ok_or_else(|| TkvError::IoError(format!("file {} not open", name)))?;
        f(handle)
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            if self.config.fsync_enabled {
                handle.file.sync_all()?;
            }
        }
        Ok(())
    }
}

impl BlobStore for FileStore {
    fn exists(&self, name: &str) -> Result<bool> {
        if self.files.lock().contains_key(name) {
            return Ok(true);
        }
        Ok(self.file_path(name).exists())
    }

    fn size(&self, name: &str) -> Result<u64> {
        if let Some(handle) = self.files.lock().get(name) {
            return Ok(handle.size);
        }
        match std::fs::metadata(self.file_path(name)) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, name: &str, data: &[u8]) -> Result<u64> {
        self.with_handle(name, true, |handle| {
            let offset = handle.size;
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(data)?;
            handle.size = offset + data.len() as u64;
            Ok(offset)
        })
    }

    fn write_at(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.with_handle(name, false, |handle| {
            if offset + data.len() as u64 > handle.size {
                return Err(TkvError::ReadOutOfBounds {
                    offset,
                    length: data.len() as u64,
                    size: handle.size,
                });
            }
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(data)?;
            Ok(())
        })
    }

    fn read_at(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_handle(name, false, |handle| {
            if offset.saturating_add(len as u64) > handle.size {
                return Err(TkvError::ReadOutOfBounds {
                    offset,
                    length: len as u64,
                    size: handle.size,
                });
            }
            handle.file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; len];
            handle.file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
    }

    fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        self.with_handle(name, false, |handle| {
            handle.file.seek(SeekFrom::Start(0))?;
            let mut buffer = Vec::with_capacity(handle.size as usize);
            handle.file.read_to_end(&mut buffer)?;
            Ok(buffer)
        })
    }

    /// Writes to a temporary file and renames it over the object, so a crash
    /// leaves either the old or the new contents.
    fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut files = self.files.lock();
        files.remove(name);

        let path = self.file_path(name);
        let tmp_path = self.file_path(&format!("{}.tmp", name));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(data)?;
        file.flush()?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn truncate(&self, name: &str, len: u64) -> Result<()> {
        self.with_handle(name, false, |handle| {
            handle.file.set_len(len)?;
            handle.size = len;
            Ok(())
        })
    }

    fn sync(&self, name: &str) -> Result<()> {
        if !self.config.fsync_enabled {
            return Ok(());
        }
        let files = self.files.lock();
        if let Some(handle) = files.get(name) {
            handle.file.sync_data()?;
        }
        Ok(())
    }

    fn close(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(name) {
            if self.config.fsync_enabled {
                handle.file.sync_all()?;
            }
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        self.files.lock().remove(name);
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
