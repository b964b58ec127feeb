//! Error taxonomy for the join engine.
//!
//! Each concern gets its own enum so callers can tell apart definition-time
//! failures (schema), per-document rejections (routing, document shape),
//! compile-time query failures and retryable index build failures.

use thiserror::Error;
use tracing::warn;

use crate::config::ConfigError;
use crate::types::PartitionId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, JoinError>;

/// Relation schema violations, detected while a schema is being defined.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The proposed edge closes a cycle in the relation graph.
    #[error("relation '{parent}' -> '{child}' would introduce a cycle")]
    CycleDetected {
        /// Parent side of the rejected edge.
        parent: String,
        /// Child side of the rejected edge.
        child: String,
    },
    /// The child role is already declared under a different parent role.
    #[error("role '{child}' is already a child of '{existing}', cannot also be a child of '{proposed}'")]
    MultipleParentRoles {
        /// Child role named twice.
        child: String,
        /// Parent role that already owns the child.
        existing: String,
        /// Parent role of the rejected declaration.
        proposed: String,
    },
    /// Role name is not part of the schema.
    #[error("unknown join role '{role}'")]
    UnknownRole {
        /// Offending role name.
        role: String,
    },
    /// Role names must be non-empty.
    #[error("join role names must not be empty")]
    InvalidRoleName,
}

/// Per-document routing violations, detected at indexing time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Caller-supplied routing disagrees with the key required by the join.
    #[error("document '{id}' declares routing '{declared}' but the join requires '{expected}'")]
    Mismatch {
        /// Document identifier.
        id: String,
        /// Routing key computed by the enforcer.
        expected: String,
        /// Routing key supplied by the caller.
        declared: String,
    },
    /// A child-role document did not name its parent.
    #[error("document '{id}' has child role '{role}' but no parent")]
    MissingParent {
        /// Document identifier.
        id: String,
        /// Child role of the document.
        role: String,
    },
    /// An intermediate ancestor is not indexed, so the chain root is unknown
    /// and no routing was declared.
    #[error("document '{id}' cannot be routed: ancestor '{ancestor}' is not indexed and no routing was declared")]
    UnresolvedAncestor {
        /// Document identifier.
        id: String,
        /// First ancestor whose document is unknown.
        ancestor: String,
    },
    /// A parent was supplied for a role that has no parent role.
    #[error("document '{id}' has role '{role}' which cannot have a parent")]
    UnexpectedParent {
        /// Document identifier.
        id: String,
        /// Role of the document.
        role: String,
    },
}

/// Errors raised while compiling a join query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The role does not take part in the relation required by the query.
    #[error("[{query}] role '{role}' is not a join role for this query")]
    NotAJoinRole {
        /// Query form that rejected the role.
        query: &'static str,
        /// Offending role.
        role: String,
    },
    /// `min_children` exceeds `max_children`.
    #[error("[has_child] min_children {min} is greater than max_children {max}")]
    InvalidChildBounds {
        /// Lower bound.
        min: u32,
        /// Upper bound.
        max: u32,
    },
    /// The query payload could not be decoded.
    #[error("malformed query: {0}")]
    Malformed(String),
}

/// Failures while materializing an ordinal index. Always retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The document source failed while being scanned.
    #[error("partition {partition} scan failed: {reason}")]
    Source {
        /// Partition being built.
        partition: PartitionId,
        /// Source-provided failure reason.
        reason: String,
    },
    /// No more ordinals can be handed out in a relation.
    #[error("ordinal space exhausted for relation '{relation}'")]
    OrdinalSpaceExhausted {
        /// Parent role of the relation.
        relation: String,
    },
}

/// Problems with the join-field object carried by a document source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Source carries no join field.
    #[error("document '{id}' is missing join field '{field}'")]
    MissingJoinField {
        /// Document identifier.
        id: String,
        /// Expected join field name.
        field: String,
    },
    /// Join field value has the wrong shape.
    #[error("document '{id}' has invalid join field '{field}': {reason}")]
    InvalidJoinField {
        /// Document identifier.
        id: String,
        /// Join field name.
        field: String,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// Errors raised while reading a mapping declaration.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Mapping was not valid JSON for the expected shape.
    #[error("invalid mapping JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Mapping declares no field of type `join`.
    #[error("mapping declares no join field")]
    NoJoinField,
    /// Mapping declares more than one join field.
    #[error("mapping declares more than one join field ('{first}' and '{second}')")]
    MultipleJoinFields {
        /// First join field found.
        first: String,
        /// Second join field found.
        second: String,
    },
    /// Relations were rejected by the schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Mapping names a different join field than the engine serves.
    #[error("mapping declares join field '{found}' but the engine uses '{expected}'")]
    FieldMismatch {
        /// Field configured on the engine.
        expected: String,
        /// Field named by the mapping.
        found: String,
    },
}

/// Top-level error type returned by the engine.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Schema definition failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Document rejected by routing.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// Query rejected at compile time.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// Index build failed; retry the operation.
    #[error("retryable join execution failure: {0}")]
    Build(#[from] BuildError),
    /// Document join field malformed.
    #[error(transparent)]
    Document(#[from] DocumentError),
    /// Mapping declaration malformed.
    #[error(transparent)]
    Mapping(#[from] MappingError),
    /// Configuration malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Partition id outside the configured range.
    #[error("partition {0} does not exist")]
    UnknownPartition(PartitionId),
    /// Engine has been closed.
    #[error("join engine is closed")]
    Closed,
}

impl JoinError {
    /// Returns true when repeating the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JoinError::Build(_))
    }
}

/// Logs a rejected document at `warn` and passes the error through.
pub(crate) fn rejected(id: &str, err: JoinError) -> JoinError {
    warn!(doc = id, error = %err, "join document rejected");
    err
}
