//! Tag chain linking.
//!
//! Every tag name threads a doubly linked chain through the directory, in
//! commit order. The builder keeps the chain tails (the holder table) and turns
//! a pending batch into a [`ChainPlan`]: the sorted, positioned, linked batch,
//! plus the `next` pointers of earlier tails that must be rewritten in place.
//!
//! Planning does not touch the builder. The new tails only replace the current
//! ones through [`TagChainBuilder::publish`], after the plan has been committed.

use std::collections::HashMap;
use tkv_common::{Meta, Tag};
use tkv_storage::Relink;

/// Linking mutations for one batch.
#[derive(Debug, Clone, Default)]
pub struct ChainPlan {
    /// Pending entries sorted by key, with positions and tag links assigned.
    pub batch: Vec<Meta>,
    /// Updates to tails that were committed by earlier batches.
    pub relinks: Vec<Relink>,
    /// Holder table as it will be once the batch is committed.
    pub tails: HashMap<String, Tag>,
}

/// Tracks the tail of every tag chain across batches.
#[derive(Debug, Default)]
pub struct TagChainBuilder {
    tails: HashMap<String, Tag>,
}

impl TagChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from tails recovered from a committed directory.
    pub fn from_tails(tails: HashMap<String, Tag>) -> Self {
        Self { tails }
    }

    /// Returns the current tail of the chain for `name`.
    pub fn tail(&self, name: &str) -> Option<&Tag> {
        self.tails.get(name)
    }

    /// Number of tag names with a chain.
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }

    /// Plans the commit of `pending` at positions starting from `base`.
    ///
    /// The batch is stable-sorted by key. Tags are linked in sorted order, so
    /// a tag name carried twice within one batch chains the later key after
    /// the earlier one.
    pub fn plan(&self, pending: &[Meta], base: u64) -> ChainPlan {
        let mut batch = pending.to_vec();
        batch.sort_by(|a, b| a.key.cmp(&b.key));

        let mut tails = self.tails.clone();
        let mut relinks = Vec::new();

        for i in 0..batch.len() {
            let position = base + i as u64;
            batch[i].position = position;

            let names: Vec<String> = batch[i].tags.keys().cloned().collect();
            for name in names {
                let previous = tails.get(&name).map(|holder| holder.pos);

                match previous {
                    Some(holder) if holder >= base => {
                        let index = (holder - base) as usize;
                        if let Some(tag) = batch[index].tag_mut(&name) {
                            tag.next = Some(position);
                        }
                    }
                    Some(holder) => relinks.push(Relink {
                        position: holder,
                        tag: name.clone(),
                        next: position,
                    }),
                    None => {}
                }

                if let Some(tag) = batch[i].tag_mut(&name) {
                    tag.pos = position;
                    tag.previous = previous;
                    tag.next = None;
                    tails.insert(name, tag.clone());
                }
            }
        }

        ChainPlan {
            batch,
            relinks,
            tails,
        }
    }

    /// Replaces the holder table with the tails of a committed plan.
    pub fn publish(&mut self, tails: HashMap<String, Tag>) {
        self.tails = tails;
    }
}
