//! Join query tree as accepted at the query boundary.
//!
//! The JSON shape follows the usual search DSL: each node is an object with
//! a single key naming the query form, e.g.
//! `{"has_child": {"type": "answer", "query": {"match_all": {}}}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;

/// A query over the documents of one index, possibly joining across roles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinQuery {
    /// Matches every document.
    MatchAll {},
    /// Matches documents by id.
    Ids {
        /// Document identifiers.
        values: Vec<String>,
    },
    /// Matches documents whose source field equals `value`, or contains it
    /// when the field holds an array.
    Term {
        /// Top-level source field.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Conjunction of sub-queries. An empty list matches every document.
    Bool {
        /// Clauses that must all match.
        #[serde(default)]
        must: Vec<JoinQuery>,
    },
    /// Matches parent documents whose children of `child_role` match `query`.
    HasChild {
        /// Child role the inner query runs against.
        #[serde(rename = "type")]
        child_role: String,
        /// Inner query over children.
        query: Box<JoinQuery>,
        /// Minimum number of matching children (default 1).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_children: Option<u32>,
        /// Maximum number of matching children (unbounded by default).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_children: Option<u32>,
    },
    /// Matches child documents whose parent document of `parent_role`
    /// matches `query`.
    HasParent {
        /// Parent role the inner query runs against.
        #[serde(rename = "parent_type")]
        parent_role: String,
        /// Inner query over parents.
        query: Box<JoinQuery>,
    },
    /// Matches children of `child_role` that declare `id` as their parent.
    ParentId {
        /// Child role to return.
        #[serde(rename = "type")]
        child_role: String,
        /// Parent identifier.
        id: String,
    },
}

impl JoinQuery {
    /// `match_all`.
    pub fn match_all() -> Self {
        JoinQuery::MatchAll {}
    }

    /// `ids` over the given identifiers.
    pub fn ids<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JoinQuery::Ids {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `term` on a source field.
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        JoinQuery::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Conjunction of `must` clauses.
    pub fn all_of(must: Vec<JoinQuery>) -> Self {
        JoinQuery::Bool { must }
    }

    /// `has_child` with default bounds.
    pub fn has_child(child_role: impl Into<String>, query: JoinQuery) -> Self {
        JoinQuery::HasChild {
            child_role: child_role.into(),
            query: Box::new(query),
            min_children: None,
            max_children: None,
        }
    }

    /// `has_parent`.
    pub fn has_parent(parent_role: impl Into<String>, query: JoinQuery) -> Self {
        JoinQuery::HasParent {
            parent_role: parent_role.into(),
            query: Box::new(query),
        }
    }

    /// `parent_id`.
    pub fn parent_id(child_role: impl Into<String>, id: impl Into<String>) -> Self {
        JoinQuery::ParentId {
            child_role: child_role.into(),
            id: id.into(),
        }
    }

    /// Sets child-count bounds on a `has_child` query; other forms are
    /// returned unchanged.
    pub fn with_child_bounds(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        if let JoinQuery::HasChild {
            min_children,
            max_children,
            ..
        } = &mut self
        {
            *min_children = min;
            *max_children = max;
        }
        self
    }

    /// Parses a query from its JSON form.
    pub fn from_json_str(text: &str) -> Result<Self, QueryError> {
        serde_json::from_str(text).map_err(|err| QueryError::Malformed(err.to_string()))
    }

    /// Name of the query form, as used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            JoinQuery::MatchAll {} => "match_all",
            JoinQuery::Ids { .. } => "ids",
            JoinQuery::Term { .. } => "term",
            JoinQuery::Bool { .. } => "bool",
            JoinQuery::HasChild { .. } => "has_child",
            JoinQuery::HasParent { .. } => "has_parent",
            JoinQuery::ParentId { .. } => "parent_id",
        }
    }
}
