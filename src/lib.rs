//! Parent/child join field for a partitioned document index.
//!
//! Documents carry a role and, for child roles, the id of their parent.
//! The crate validates the role graph ([`RelationSchema`]), routes every
//! document of an ancestry chain to one partition ([`RoutingEnforcer`]) and
//! answers parent/child queries through a per-partition ordinal index
//! ([`OrdinalJoinIndex`]) kept in a shared snapshot cache ([`OrdinalCache`]).
//! [`JoinEngine`] owns all of it.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod ordinals;
pub mod partition;
pub mod query;
pub mod routing;
pub mod schema;
pub mod types;

pub use cache::{CacheKey, CacheStats, OrdinalCache, SnapshotGuard};
pub use config::{ConfigError, JoinConfig};
pub use document::{IndexRequest, JoinDocument};
pub use engine::{Hit, IndexOutcome, JoinEngine, PartitionStats};
pub use error::{
    BuildError, DocumentError, JoinError, MappingError, QueryError, Result, RoutingError,
    SchemaError,
};
pub use ordinals::{OrdinalIndexStats, OrdinalJoinIndex, ParentRef, RelationOrdinals};
pub use partition::{DocumentSource, PartitionStore, StoredDocument};
pub use query::{compile, CompiledJoin, CompiledQuery, JoinQuery, JoinQueryExecutor};
pub use routing::{Route, RoutingCheckError, RoutingDecision, RoutingEnforcer};
pub use schema::{JoinFieldMapping, RelationSchema, Role};
pub use types::{DocPosition, IndexGeneration, Ordinal, PartitionId, SchemaGeneration};
