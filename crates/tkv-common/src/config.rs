//! Configuration structures for tkv.

use crate::error::{Result, TkvError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Size of the fixed part of an index record: key_len, offset, length,
/// position, tag_count and the trailing checksum.
const RECORD_FIXED_BYTES: usize = 2 + 8 + 8 + 8 + 2 + 4;

/// Size of a tag slot excluding the name: name_len, pos, previous, next.
const TAG_FIXED_BYTES: usize = 2 + 8 + 8 + 8;

/// Storage configuration for a tkv store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the local index mirror and the local value mirror.
    pub local_dir: PathBuf,
    /// Directory standing in for the durable backing store.
    pub remote_dir: PathBuf,
    /// Index file name, identical in both directories.
    pub index_filename: String,
    /// Value log file name, identical in both directories.
    pub data_filename: String,
    /// Maximum key length in bytes.
    pub key_length: usize,
    /// Maximum tag name length in bytes.
    pub tag_length: usize,
    /// Maximum number of tags carried by one key.
    pub max_tags: usize,
    /// Value bytes staged in memory before they are spilled to the backend.
    pub write_buffer_bytes: usize,
    /// Enable fsync when flushing.
    pub fsync_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("./data/local"),
            remote_dir: PathBuf::from("./data/remote"),
            index_filename: "tkv.idx".to_string(),
            data_filename: "tkv.dat".to_string(),
            key_length: 64,
            tag_length: 32,
            max_tags: 8,
            write_buffer_bytes: 1024 * 1024, // 1 MB
            fsync_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Returns a default config whose local and remote directories live under `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            local_dir: root.join("local"),
            remote_dir: root.join("remote"),
            ..Default::default()
        }
    }

    /// Loads a config from a JSON file. Missing fields are an error.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&text)
            .map_err(|e| TkvError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the config describes a usable store.
    pub fn validate(&self) -> Result<()> {
        check_length("key_length", self.key_length)?;
        check_length("tag_length", self.tag_length)?;
        check_length("max_tags", self.max_tags)?;

        if self.write_buffer_bytes == 0 {
            return Err(invalid("write_buffer_bytes", self.write_buffer_bytes));
        }
        if self.index_filename.is_empty() {
            return Err(TkvError::ConfigError("index_filename is empty".to_string()));
        }
        if self.data_filename.is_empty() {
            return Err(TkvError::ConfigError("data_filename is empty".to_string()));
        }
        if self.index_filename == self.data_filename {
            return Err(TkvError::ConfigError(
                "index_filename and data_filename must differ".to_string(),
            ));
        }
        if self.local_dir == self.remote_dir {
            return Err(TkvError::ConfigError(
                "local_dir and remote_dir must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the size in bytes of one fixed-width index record.
    pub fn record_size(&self) -> usize {
        RECORD_FIXED_BYTES
            + self.key_length
            + self.max_tags * (TAG_FIXED_BYTES + self.tag_length)
    }
}

fn check_length(name: &str, value: usize) -> Result<()> {
    if value == 0 || value > u16::MAX as usize {
        return Err(invalid(name, value));
    }
    Ok(())
}

fn invalid(name: &str, value: usize) -> TkvError {
    TkvError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
