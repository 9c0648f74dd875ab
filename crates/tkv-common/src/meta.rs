//! Index entry types: `Meta` describes one stored value, `Tag` links it into
//! the chain of values sharing a tag name.

use std::collections::BTreeMap;

/// Membership of a `Meta` in the chain of entries carrying the same tag name.
///
/// `pos`, `previous` and `next` are ordinal positions in the index directory.
/// They are assigned when the owning entry is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag name.
    pub name: String,
    /// Ordinal position of the owning entry.
    pub pos: u64,
    /// Position of the next entry carrying this tag, or `None` at the chain tail.
    pub next: Option<u64>,
    /// Position of the previous entry carrying this tag, or `None` at the chain head.
    pub previous: Option<u64>,
}

impl Tag {
    /// Creates an unlinked tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pos: 0,
            next: None,
            previous: None,
        }
    }
}

/// Directory entry describing one stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Unique key.
    pub key: String,
    /// Offset of the value in the value log.
    pub offset: u64,
    /// Length of the value in bytes.
    pub length: u64,
    /// Ordinal position in the directory. Meaningless until committed.
    pub position: u64,
    /// Tags keyed by name.
    pub tags: BTreeMap<String, Tag>,
}

impl Meta {
    /// Creates an untagged, uncommitted entry.
    pub fn new(key: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            key: key.into(),
            offset,
            length,
            position: 0,
            tags: BTreeMap::new(),
        }
    }

    /// Adds an unlinked tag. Adding an existing name is a no-op.
    pub fn add_tag(&mut self, name: &str) {
        if !self.tags.contains_key(name) {
            self.tags.insert(name.to_string(), Tag::new(name));
        }
    }

    /// Returns the tag with the given name.
    pub fn tag(&self, name: &str) -> Option<&Tag> {
        self.tags.get(name)
    }

    pub fn tag_mut(&mut self, name: &str) -> Option<&mut Tag> {
        self.tags.get_mut(name)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }
}

/// A value together with its index entry.
///
/// Record retrieval is not supported; the type exists so that
/// `Tkv::get_record` has a concrete signature.
#[derive(Debug, Clone)]
pub struct Record {
    pub meta: Meta,
    pub value: Vec<u8>,
}
