//! Identifier newtypes shared by every layer of the join engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical partition (shard) inside which joins are resolved.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// Dense integer standing in for an identifier inside one relation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Ordinal(pub u32);

/// Internal position of a document inside its partition's store.
///
/// Positions are handed out in increasing order and never reused, so a
/// position identifies one stored revision of a document.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct DocPosition(pub u32);

/// Generation of a [`RelationSchema`](crate::schema::RelationSchema).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct SchemaGeneration(pub u64);

/// Build generation of a partition's ordinal index.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct IndexGeneration(pub u64);

impl Ordinal {
    /// Returns the ordinal as a slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl DocPosition {
    /// Returns the position as a slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl SchemaGeneration {
    /// Returns the generation that follows `self`.
    pub fn next(self) -> Self {
        SchemaGeneration(self.0.saturating_add(1))
    }
}

impl IndexGeneration {
    /// Returns the generation that follows `self`.
    pub fn next(self) -> Self {
        IndexGeneration(self.0.saturating_add(1))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DocPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SchemaGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(value: PartitionId) -> Self {
        value.0
    }
}
