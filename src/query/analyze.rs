#![forbid(unsafe_code)]

//! Compiles a [`JoinQuery`] against a relation schema.
//!
//! Every role named by a join form is resolved here, so a query that names
//! a role outside the relation it needs fails before any partition is read.

use crate::error::QueryError;
use crate::query::ast::JoinQuery;
use crate::schema::{RelationSchema, Role};
use crate::types::SchemaGeneration;
use serde_json::Value;
use std::sync::Arc;

/// Query with every join role resolved against one schema generation.
#[derive(Clone, Debug, PartialEq)]
pub enum CompiledQuery {
    /// Every live document.
    MatchAll,
    /// Documents with one of the given ids.
    Ids(Vec<String>),
    /// Documents whose source field equals or contains `value`.
    Term {
        /// Source field.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Intersection of the clauses.
    And(Vec<CompiledQuery>),
    /// Parents of `parent_role` with a bounded number of matching children.
    HasChild {
        /// Role of the returned documents.
        parent_role: Role,
        /// Role the inner query is restricted to.
        child_role: Role,
        /// Inner query over children.
        inner: Box<CompiledQuery>,
        /// Inclusive lower bound on matching children.
        min_children: u32,
        /// Inclusive upper bound on matching children.
        max_children: Option<u32>,
    },
    /// Children of `parent_role` documents matching the inner query.
    HasParent {
        /// Role the inner query is restricted to.
        parent_role: Role,
        /// Inner query over parents.
        inner: Box<CompiledQuery>,
    },
    /// Children of `child_role` linked to the parent identifier `id`.
    ParentId {
        /// Relation the identifier lives in.
        parent_role: Role,
        /// Role of the returned documents.
        child_role: Role,
        /// Parent identifier.
        id: String,
    },
}

/// Compiled query together with the schema generation it was checked
/// against.
#[derive(Clone, Debug)]
pub struct CompiledJoin {
    root: CompiledQuery,
    schema: Arc<RelationSchema>,
}

impl CompiledJoin {
    /// Root of the compiled tree.
    pub fn root(&self) -> &CompiledQuery {
        &self.root
    }

    /// Schema generation the query is valid for.
    pub fn schema_generation(&self) -> SchemaGeneration {
        self.schema.generation()
    }

    /// Schema the query was compiled against.
    pub fn schema(&self) -> &Arc<RelationSchema> {
        &self.schema
    }

    /// Whether the tree contains a join form.
    pub fn uses_join(&self) -> bool {
        self.root.uses_join()
    }
}

impl CompiledQuery {
    fn uses_join(&self) -> bool {
        match self {
            CompiledQuery::MatchAll | CompiledQuery::Ids(_) | CompiledQuery::Term { .. } => false,
            CompiledQuery::And(clauses) => clauses.iter().any(CompiledQuery::uses_join),
            CompiledQuery::HasChild { .. }
            | CompiledQuery::HasParent { .. }
            | CompiledQuery::ParentId { .. } => true,
        }
    }
}

/// Resolves `query` against `schema`.
pub fn compile(query: &JoinQuery, schema: &Arc<RelationSchema>) -> Result<CompiledJoin, QueryError> {
    Ok(CompiledJoin {
        root: lower(query, schema)?,
        schema: Arc::clone(schema),
    })
}

fn lower(query: &JoinQuery, schema: &RelationSchema) -> Result<CompiledQuery, QueryError> {
    match query {
        JoinQuery::MatchAll {} => Ok(CompiledQuery::MatchAll),
        JoinQuery::Ids { values } => {
            let mut ids = values.clone();
            ids.sort_unstable();
            ids.dedup();
            Ok(CompiledQuery::Ids(ids))
        }
        JoinQuery::Term { field, value } => Ok(CompiledQuery::Term {
            field: field.clone(),
            value: value.clone(),
        }),
        JoinQuery::Bool { must } => {
            let clauses = must
                .iter()
                .map(|clause| lower(clause, schema))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match clauses.len() {
                0 => CompiledQuery::MatchAll,
                _ => CompiledQuery::And(clauses),
            })
        }
        JoinQuery::HasChild {
            child_role,
            query: inner,
            min_children,
            max_children,
        } => {
            let (parent_role, child_role) = child_relation(schema, query.kind(), child_role)?;
            let min = min_children.unwrap_or(1).max(1);
            if let Some(max) = *max_children {
                if min > max {
                    return Err(QueryError::InvalidChildBounds { min, max });
                }
            }
            Ok(CompiledQuery::HasChild {
                parent_role,
                child_role,
                inner: Box::new(lower(inner, schema)?),
                min_children: min,
                max_children: *max_children,
            })
        }
        JoinQuery::HasParent {
            parent_role,
            query: inner,
        } => {
            if !schema.is_parent_role(parent_role) {
                return Err(not_a_join_role(query.kind(), parent_role));
            }
            let parent_role = schema
                .require_role(parent_role)
                .map_err(|_| not_a_join_role(query.kind(), parent_role))?;
            Ok(CompiledQuery::HasParent {
                parent_role: Arc::clone(parent_role),
                inner: Box::new(lower(inner, schema)?),
            })
        }
        JoinQuery::ParentId { child_role, id } => {
            let (parent_role, child_role) = child_relation(schema, query.kind(), child_role)?;
            Ok(CompiledQuery::ParentId {
                parent_role,
                child_role,
                id: id.clone(),
            })
        }
    }
}

fn child_relation(
    schema: &RelationSchema,
    kind: &'static str,
    child_role: &str,
) -> Result<(Role, Role), QueryError> {
    let parent = schema
        .parent_role_of(child_role)
        .ok_or_else(|| not_a_join_role(kind, child_role))?;
    let child = schema
        .require_role(child_role)
        .map_err(|_| not_a_join_role(kind, child_role))?;
    Ok((Arc::clone(parent), Arc::clone(child)))
}

fn not_a_join_role(query: &'static str, role: &str) -> QueryError {
    QueryError::NotAJoinRole {
        query,
        role: role.to_string(),
    }
}
