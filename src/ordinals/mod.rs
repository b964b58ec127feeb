//! Per-partition ordinal index resolving parent/child links.
//!
//! Every parent role owns one ordinal space ([`RelationOrdinals`]). For each
//! document position the index keeps its role, the ordinal of its own id
//! when the role is a parent role, and the ordinal of its parent identifier
//! when the role is a child role. Forward lookups (identifier → children)
//! and backward lookups (position → parent identifier) are both array
//! indexed once the ordinal is known.

#![forbid(unsafe_code)]

use std::mem::size_of;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::document::JoinDocument;
use crate::error::BuildError;
use crate::partition::DocumentSource;
use crate::schema::{RelationSchema, Role};
use crate::types::{DocPosition, IndexGeneration, Ordinal, PartitionId, SchemaGeneration};

mod relation;

pub use relation::RelationOrdinals;

#[derive(Clone, Debug, Default)]
struct PositionLinks {
    role: Option<Role>,
    own: Option<Ordinal>,
    parent: Option<Ordinal>,
}

/// Backward-join answer for a child position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentRef<'a> {
    /// Parent role of the relation the link lives in.
    pub parent_role: &'a str,
    /// Declared parent identifier.
    pub identifier: &'a str,
    /// Ordinal of the identifier.
    pub ordinal: Ordinal,
    /// Position of the parent document, `None` when the child is an orphan.
    pub document: Option<DocPosition>,
}

/// Shape counters of an index snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrdinalIndexStats {
    /// Number of relations (parent roles).
    pub relations: usize,
    /// Ordinals across all relations.
    pub ordinals: usize,
    /// Child links across all relations.
    pub links: usize,
    /// Ordinals with neither children nor a parent document.
    pub tombstoned: usize,
    /// Incremental updates applied since the build.
    pub updates_since_build: usize,
}

/// Ordinal join index of one partition, for one schema and build generation.
#[derive(Clone, Debug)]
pub struct OrdinalJoinIndex {
    partition: PartitionId,
    generation: IndexGeneration,
    schema: Arc<RelationSchema>,
    relations: Vec<RelationOrdinals>,
    relation_by_role: FxHashMap<Role, usize>,
    links: Vec<PositionLinks>,
    updates_since_build: usize,
}

impl OrdinalJoinIndex {
    /// Empty index with one ordinal space per parent role of `schema`.
    pub fn empty(
        partition: PartitionId,
        schema: Arc<RelationSchema>,
        generation: IndexGeneration,
    ) -> Self {
        let mut relations = Vec::new();
        let mut relation_by_role = FxHashMap::default();
        for (parent, _) in schema.relations() {
            relation_by_role.insert(Arc::clone(parent), relations.len());
            relations.push(RelationOrdinals::new(Arc::clone(parent)));
        }
        Self {
            partition,
            generation,
            schema,
            relations,
            relation_by_role,
            links: Vec::new(),
            updates_since_build: 0,
        }
    }

    /// Builds the index by scanning every resident document of `source`.
    pub fn build(
        source: &dyn DocumentSource,
        schema: Arc<RelationSchema>,
        generation: IndexGeneration,
    ) -> Result<Self, BuildError> {
        let mut index = Self::empty(source.partition(), schema, generation);
        index.links.resize_with(source.position_bound(), PositionLinks::default);
        let mut failure = None;
        source.scan(&mut |position, doc| {
            if failure.is_none() {
                if let Err(err) = index.link(position, doc) {
                    failure = Some(err);
                }
            }
        })?;
        if let Some(err) = failure {
            return Err(err);
        }
        debug!(
            partition = %index.partition,
            generation = %index.generation,
            schema_generation = %index.schema_generation(),
            ordinals = index.relations.iter().map(RelationOrdinals::len).sum::<usize>(),
            "built ordinal join index"
        );
        Ok(index)
    }

    /// Links a newly stored document without rebuilding.
    pub fn insert(&mut self, position: DocPosition, doc: &JoinDocument) -> Result<(), BuildError> {
        self.link(position, doc)?;
        self.updates_since_build += 1;
        Ok(())
    }

    /// Unlinks the document at `position`. Its ordinals stay assigned.
    pub fn remove(&mut self, position: DocPosition) {
        let Some(links) = self.links.get_mut(position.index()).map(std::mem::take) else {
            return;
        };
        self.updates_since_build += 1;
        let Some(role) = links.role else {
            return;
        };
        if let Some(ordinal) = links.own {
            if let Some(rel) = self.relation_index(&role) {
                self.relations[rel].clear_parent_document(ordinal, position);
            }
        }
        if let Some(ordinal) = links.parent {
            let parent_rel = self
                .schema
                .parent_role_of(&role)
                .and_then(|parent| self.relation_index(parent));
            if let Some(rel) = parent_rel {
                self.relations[rel].remove_child(ordinal, position);
            }
        }
    }

    fn link(&mut self, position: DocPosition, doc: &JoinDocument) -> Result<(), BuildError> {
        let Ok(role) = self.schema.require_role(&doc.role).map(Arc::clone) else {
            return Ok(());
        };
        if self.links.len() <= position.index() {
            self.links.resize_with(position.index() + 1, PositionLinks::default);
        }
        let mut links = PositionLinks {
            role: Some(Arc::clone(&role)),
            ..PositionLinks::default()
        };
        if let Some(rel) = self.relation_index(&role) {
            let relation = &mut self.relations[rel];
            let ordinal = relation.resolve_or_create(&doc.id)?;
            relation.set_parent_document(ordinal, position);
            links.own = Some(ordinal);
        }
        if let Some(parent_id) = doc.parent_id.as_deref() {
            let parent_rel = self
                .schema
                .parent_role_of(&role)
                .and_then(|parent| self.relation_index(parent));
            if let Some(rel) = parent_rel {
                let relation = &mut self.relations[rel];
                let ordinal = relation.resolve_or_create(parent_id)?;
                relation.add_child(ordinal, position);
                links.parent = Some(ordinal);
            }
        }
        self.links[position.index()] = links;
        Ok(())
    }

    fn relation_index(&self, parent_role: &str) -> Option<usize> {
        self.relation_by_role.get(parent_role).copied()
    }

    /// Ordinal space of `parent_role`.
    pub fn relation(&self, parent_role: &str) -> Option<&RelationOrdinals> {
        self.relation_index(parent_role).map(|rel| &self.relations[rel])
    }

    /// Child positions of `identifier` in the relation of `parent_role`.
    ///
    /// Includes children of identifiers with no parent document.
    pub fn children_of(&self, parent_role: &str, identifier: &str) -> &[DocPosition] {
        self.relation(parent_role)
            .and_then(|rel| rel.ordinal_of(identifier).map(|ord| rel.children(ord)))
            .unwrap_or(&[])
    }

    /// Backward join: the parent link of the document at `position`.
    pub fn resolve_parent(&self, position: DocPosition) -> Option<ParentRef<'_>> {
        let links = self.links.get(position.index())?;
        let ordinal = links.parent?;
        let role = links.role.as_deref()?;
        let parent_role = self.schema.parent_role_of(role)?;
        let relation = self.relation(parent_role)?;
        Some(ParentRef {
            parent_role: relation.parent_role().as_ref(),
            identifier: relation.identifier(ordinal)?,
            ordinal,
            document: relation.parent_document(ordinal),
        })
    }

    /// Ordinal of the document's own id, for parent-role documents.
    pub fn own_ordinal(&self, position: DocPosition) -> Option<Ordinal> {
        self.links.get(position.index()).and_then(|links| links.own)
    }

    /// Role the document at `position` was linked with.
    pub fn role_of(&self, position: DocPosition) -> Option<&str> {
        self.links
            .get(position.index())
            .and_then(|links| links.role.as_deref())
    }

    /// Forward join: ordinals of `parent_role` whose children intersect
    /// `inner_matches`, with the number of matching children each.
    ///
    /// Runs in O(|inner_matches|) plus sorting the matched ordinals.
    pub fn resolve_children<I>(&self, parent_role: &str, inner_matches: I) -> Vec<(Ordinal, u32)>
    where
        I: IntoIterator<Item = DocPosition>,
    {
        let Some(rel) = self.relation_index(parent_role) else {
            return Vec::new();
        };
        let relation_role = self.relations[rel].parent_role();
        let mut counts: FxHashMap<Ordinal, u32> = FxHashMap::default();
        for position in inner_matches {
            let Some(links) = self.links.get(position.index()) else {
                continue;
            };
            let (Some(ordinal), Some(role)) = (links.parent, links.role.as_deref()) else {
                continue;
            };
            if self.schema.parent_role_of(role) == Some(relation_role) {
                *counts.entry(ordinal).or_insert(0) += 1;
            }
        }
        let mut matched: Vec<(Ordinal, u32)> = counts.into_iter().collect();
        matched.sort_unstable_by_key(|(ordinal, _)| *ordinal);
        matched
    }

    /// Partition this index belongs to.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Build generation.
    pub fn generation(&self) -> IndexGeneration {
        self.generation
    }

    /// Generation of the schema the index was built against.
    pub fn schema_generation(&self) -> SchemaGeneration {
        self.schema.generation()
    }

    /// Schema the index was built against.
    pub fn schema(&self) -> &Arc<RelationSchema> {
        &self.schema
    }

    /// Incremental updates applied since the build.
    pub fn updates_since_build(&self) -> usize {
        self.updates_since_build
    }

    /// Shape counters.
    pub fn stats(&self) -> OrdinalIndexStats {
        OrdinalIndexStats {
            relations: self.relations.len(),
            ordinals: self.relations.iter().map(RelationOrdinals::len).sum(),
            links: self.relations.iter().map(RelationOrdinals::link_count).sum(),
            tombstoned: self.relations.iter().map(RelationOrdinals::tombstoned).sum(),
            updates_since_build: self.updates_since_build,
        }
    }

    /// Approximate heap footprint, charged against the cache budget.
    pub fn estimated_bytes(&self) -> usize {
        size_of::<Self>()
            + self.links.capacity() * size_of::<PositionLinks>()
            + self
                .relations
                .iter()
                .map(RelationOrdinals::estimated_bytes)
                .sum::<usize>()
    }
}
