//! Per-partition document storage seen by the join engine.
//!
//! Persistence belongs to the storage layer; the engine only needs to scan
//! the resident documents of a partition in position order, which is what
//! [`DocumentSource`] captures. [`PartitionStore`] is the in-memory source
//! the engine uses for its own partitions.

#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::document::JoinDocument;
use crate::error::BuildError;
use crate::types::{DocPosition, PartitionId};

/// Document resident in a partition.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredDocument {
    /// Join identity.
    pub doc: JoinDocument,
    /// Routing key the document was stored under.
    pub routing: String,
    /// Original source, used by inner predicates.
    pub source: Value,
}

/// Scannable set of documents belonging to one partition.
pub trait DocumentSource {
    /// Partition the documents belong to.
    fn partition(&self) -> PartitionId;

    /// Upper bound on positions handed out so far.
    fn position_bound(&self) -> usize;

    /// Visits every live document in increasing position order.
    fn scan(&self, visit: &mut dyn FnMut(DocPosition, &JoinDocument)) -> Result<(), BuildError>;
}

/// In-memory partition store with stable, never reused positions.
#[derive(Debug)]
pub struct PartitionStore {
    id: PartitionId,
    slots: Vec<Option<StoredDocument>>,
    by_id: FxHashMap<String, DocPosition>,
    live: usize,
}

impl PartitionStore {
    /// Empty store for partition `id`.
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            slots: Vec::new(),
            by_id: FxHashMap::default(),
            live: 0,
        }
    }

    /// Appends a document, replacing any live document with the same id.
    ///
    /// Returns the new position and the replaced document, if any.
    pub fn insert(
        &mut self,
        stored: StoredDocument,
    ) -> (DocPosition, Option<(DocPosition, StoredDocument)>) {
        let replaced = self.remove(&stored.doc.id);
        debug_assert!(self.slots.len() < u32::MAX as usize, "position space exhausted");
        let position = DocPosition(self.slots.len() as u32);
        self.by_id.insert(stored.doc.id.clone(), position);
        self.slots.push(Some(stored));
        self.live += 1;
        (position, replaced)
    }

    /// Removes the live document `id`, leaving its slot empty.
    pub fn remove(&mut self, id: &str) -> Option<(DocPosition, StoredDocument)> {
        let position = self.by_id.remove(id)?;
        let stored = self.slots.get_mut(position.index())?.take()?;
        self.live -= 1;
        Some((position, stored))
    }

    /// Document at `position`, if still live.
    pub fn get(&self, position: DocPosition) -> Option<&StoredDocument> {
        self.slots.get(position.index()).and_then(Option::as_ref)
    }

    /// Position of the live document `id`.
    pub fn position_of(&self, id: &str) -> Option<DocPosition> {
        self.by_id.get(id).copied()
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true when no document is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live documents in position order.
    pub fn iter(&self) -> impl Iterator<Item = (DocPosition, &StoredDocument)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|doc| (DocPosition(idx as u32), doc)))
    }
}

impl DocumentSource for PartitionStore {
    fn partition(&self) -> PartitionId {
        self.id
    }

    fn position_bound(&self) -> usize {
        self.slots.len()
    }

    fn scan(&self, visit: &mut dyn FnMut(DocPosition, &JoinDocument)) -> Result<(), BuildError> {
        for (position, stored) in self.iter() {
            visit(position, &stored.doc);
        }
        Ok(())
    }
}
