#![forbid(unsafe_code)]

//! Evaluates compiled join queries over one partition.
//!
//! Results are document positions in ascending order. Join forms go through
//! the partition's ordinal index: `has_child` resolves matching children to
//! parent ordinals, `has_parent` walks the child sets of matching parents and
//! `parent_id` reads one child set directly.

use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::ordinals::OrdinalJoinIndex;
use crate::partition::PartitionStore;
use crate::query::analyze::CompiledQuery;
use crate::types::{DocPosition, Ordinal};

/// Executes queries against a partition store and a consistent index
/// snapshot of the same partition.
pub struct JoinQueryExecutor<'a> {
    store: &'a PartitionStore,
    index: &'a OrdinalJoinIndex,
}

impl<'a> JoinQueryExecutor<'a> {
    /// Binds the executor to a partition.
    pub fn new(store: &'a PartitionStore, index: &'a OrdinalJoinIndex) -> Self {
        Self { store, index }
    }

    /// Forward join: ordinals of `parent_role` whose child sets intersect
    /// `inner_matches`.
    pub fn resolve_children<I>(&self, parent_role: &str, inner_matches: I) -> Vec<Ordinal>
    where
        I: IntoIterator<Item = DocPosition>,
    {
        self.index
            .resolve_children(parent_role, inner_matches)
            .into_iter()
            .map(|(ordinal, _)| ordinal)
            .collect()
    }

    /// Backward join: parent identifier of `child`, including orphans.
    pub fn resolve_parent(&self, child: DocPosition) -> Option<&'a str> {
        self.index.resolve_parent(child).map(|parent| parent.identifier)
    }

    /// Evaluates `query`, returning matching positions in ascending order.
    pub fn execute(&self, query: &CompiledQuery) -> Vec<DocPosition> {
        match query {
            CompiledQuery::MatchAll => self.store.iter().map(|(position, _)| position).collect(),
            CompiledQuery::Ids(ids) => {
                let mut positions: Vec<DocPosition> = ids
                    .iter()
                    .filter_map(|id| self.store.position_of(id))
                    .collect();
                positions.sort_unstable();
                positions
            }
            CompiledQuery::Term { field, value } => self
                .store
                .iter()
                .filter(|(_, stored)| {
                    stored
                        .source
                        .get(field)
                        .is_some_and(|found| term_matches(found, value))
                })
                .map(|(position, _)| position)
                .collect(),
            CompiledQuery::And(clauses) => self.intersect(clauses),
            CompiledQuery::HasChild {
                parent_role,
                child_role,
                inner,
                min_children,
                max_children,
            } => {
                let children = self
                    .execute(inner)
                    .into_iter()
                    .filter(|position| self.index.role_of(*position) == Some(child_role.as_ref()));
                let Some(relation) = self.index.relation(parent_role) else {
                    return Vec::new();
                };
                let mut parents: Vec<DocPosition> = self
                    .index
                    .resolve_children(parent_role, children)
                    .into_iter()
                    .filter(|(_, count)| {
                        *count >= *min_children && max_children.map_or(true, |max| *count <= max)
                    })
                    .filter_map(|(ordinal, _)| relation.parent_document(ordinal))
                    .filter(|position| self.store.get(*position).is_some())
                    .collect();
                parents.sort_unstable();
                parents
            }
            CompiledQuery::HasParent { parent_role, inner } => {
                let Some(relation) = self.index.relation(parent_role) else {
                    return Vec::new();
                };
                let mut children: Vec<DocPosition> = self
                    .execute(inner)
                    .into_iter()
                    .filter(|position| self.index.role_of(*position) == Some(parent_role.as_ref()))
                    .filter_map(|position| self.index.own_ordinal(position))
                    .flat_map(|ordinal| relation.children(ordinal).iter().copied())
                    .collect();
                children.sort_unstable();
                children.dedup();
                children
            }
            CompiledQuery::ParentId {
                parent_role,
                child_role,
                id,
            } => self
                .index
                .children_of(parent_role, id)
                .iter()
                .copied()
                .filter(|position| self.index.role_of(*position) == Some(child_role.as_ref()))
                .collect(),
        }
    }

    fn intersect(&self, clauses: &[CompiledQuery]) -> Vec<DocPosition> {
        let mut clauses = clauses.iter();
        let Some(first) = clauses.next() else {
            return self.execute(&CompiledQuery::MatchAll);
        };
        let mut matched = self.execute(first);
        for clause in clauses {
            if matched.is_empty() {
                break;
            }
            let keep: FxHashSet<DocPosition> = self.execute(clause).into_iter().collect();
            matched.retain(|position| keep.contains(position));
        }
        matched
    }
}

fn term_matches(found: &Value, expected: &Value) -> bool {
    match found {
        Value::Array(items) => items.iter().any(|item| item == expected),
        other => other == expected,
    }
}
