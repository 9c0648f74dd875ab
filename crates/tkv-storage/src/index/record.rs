//! Fixed-width index record format.
//!
//! Every committed `Meta` occupies one slot of `record_size` bytes, so the
//! slot for ordinal `n` starts at `n * record_size`:
//!
//! ```text
//! +--------------------------------------------+
//! | key_len: u16                               |
//! | key: [u8; key_length] (zero padded)        |
//! | offset: u64                                |
//! | length: u64                                |
//! | position: u64                              |
//! | tag_count: u16                             |
//! +--------------------------------------------+
//! | tag slot * max_tags:                       |
//! |   name_len: u16                            |
//! |   name: [u8; tag_length] (zero padded)     |
//! |   pos: u64                                 |
//! |   previous: u64 (u64::MAX = none)          |
//! |   next: u64     (u64::MAX = none)          |
//! +--------------------------------------------+
//! | checksum: u32 (CRC32 of everything above)  |
//! +--------------------------------------------+
//! ```
//!
//! All integers are little-endian. Tags are written in name order; unused tag
//! slots are zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tkv_common::{Meta, Result, StoreConfig, Tag, TkvError};

/// Encoded form of "no link".
const NONE: u64 = u64::MAX;

/// Size of the trailing checksum in bytes.
const CHECKSUM_SIZE: usize = 4;

/// Encodes and decodes index records for one key/tag geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCodec {
    key_length: usize,
    tag_length: usize,
    max_tags: usize,
    record_size: usize,
}

impl RecordCodec {
    /// Creates a codec for the geometry described by `config`.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            key_length: config.key_length,
            tag_length: config.tag_length,
            max_tags: config.max_tags,
            record_size: config.record_size(),
        }
    }

    /// Size of one record in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Byte offset of the slot holding ordinal `position`.
    pub fn slot_offset(&self, position: u64) -> u64 {
        position * self.record_size as u64
    }

    /// Checks that `meta` fits the fixed-width framing.
    pub fn check(&self, meta: &Meta) -> Result<()> {
        if meta.key.is_empty() {
            return Err(TkvError::EmptyKey);
        }
        if meta.key.len() > self.key_length {
            return Err(TkvError::KeyTooLarge {
                size: meta.key.len(),
                max: self.key_length,
            });
        }
        if meta.tags.len() > self.max_tags {
            return Err(TkvError::TooManyTags {
                count: meta.tags.len(),
                max: self.max_tags,
            });
        }
        for name in meta.tags.keys() {
            if name.len() > self.tag_length {
                return Err(TkvError::TagTooLarge {
                    size: name.len(),
                    max: self.tag_length,
                });
            }
        }
        Ok(())
    }

    /// Encodes `meta` into one record.
    pub fn encode(&self, meta: &Meta) -> Result<Bytes> {
        self.check(meta)?;

        let mut buf = BytesMut::with_capacity(self.record_size);
        put_padded(&mut buf, meta.key.as_bytes(), self.key_length);
        buf.put_u64_le(meta.offset);
        buf.put_u64_le(meta.length);
        buf.put_u64_le(meta.position);
        buf.put_u16_le(meta.tags.len() as u16);

        for tag in meta.tags.values() {
            put_padded(&mut buf, tag.name.as_bytes(), self.tag_length);
            buf.put_u64_le(tag.pos);
            buf.put_u64_le(tag.previous.unwrap_or(NONE));
            buf.put_u64_le(tag.next.unwrap_or(NONE));
        }
        let unused = self.max_tags - meta.tags.len();
        buf.put_bytes(0, unused * (2 + self.tag_length + 24));

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        debug_assert_eq!(buf.len(), self.record_size);
        Ok(buf.freeze())
    }

    /// Decodes the record expected at ordinal `position`.
    pub fn decode(&self, record: &[u8], position: u64) -> Result<Meta> {
        let corrupted = |reason: String| TkvError::IndexCorrupted { position, reason };

        if record.len() != self.record_size {
            return Err(corrupted(format!(
                "record is {} bytes, expected {}",
                record.len(),
                self.record_size
            )));
        }

        let (body, mut trailer) = record.split_at(self.record_size - CHECKSUM_SIZE);
        let stored = trailer.get_u32_le();
        if crc32fast::hash(body) != stored {
            return Err(corrupted("checksum mismatch".to_string()));
        }

        let mut buf = body;
        let key = get_padded(&mut buf, self.key_length)
            .map_err(|reason| corrupted(format!("key: {}", reason)))?;
        let offset = buf.get_u64_le();
        let length = buf.get_u64_le();
        let stored_position = buf.get_u64_le();
        if stored_position != position {
            return Err(corrupted(format!(
                "record claims position {}",
                stored_position
            )));
        }

        let tag_count = buf.get_u16_le() as usize;
        if tag_count > self.max_tags {
            return Err(corrupted(format!("{} tags (max {})", tag_count, self.max_tags)));
        }

        let mut meta = Meta::new(key, offset, length);
        meta.position = position;
        for _ in 0..tag_count {
            let name = get_padded(&mut buf, self.tag_length)
                .map_err(|reason| corrupted(format!("tag name: {}", reason)))?;
            let pos = buf.get_u64_le();
            let previous = link(buf.get_u64_le());
            let next = link(buf.get_u64_le());
            meta.tags.insert(
                name.clone(),
                Tag {
                    name,
                    pos,
                    next,
                    previous,
                },
            );
        }
        if meta.tags.len() != tag_count {
            return Err(corrupted("duplicate tag name".to_string()));
        }

        Ok(meta)
    }
}

fn link(raw: u64) -> Option<u64> {
    if raw == NONE {
        None
    } else {
        Some(raw)
    }
}

/// Writes a u16 length followed by `bytes` padded with zeros to `width`.
fn put_padded(buf: &mut BytesMut, bytes: &[u8], width: usize) {
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
}

fn get_padded(buf: &mut &[u8], width: usize) -> std::result::Result<String, String> {
    let len = buf.get_u16_le() as usize;
    if len > width {
        return Err(format!("length {} exceeds {}", len, width));
    }
    let text = String::from_utf8(buf[..len].to_vec()).map_err(|e| e.to_string())?;
    buf.advance(width);
    Ok(text)
}
