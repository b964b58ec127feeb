#![forbid(unsafe_code)]

//! Join queries: tree, compilation against the schema, and execution.

/// Query tree and its JSON form.
pub mod ast;

/// Role resolution and validation ahead of execution.
pub mod analyze;

/// Per-partition evaluation over an ordinal index snapshot.
pub mod executor;

pub use analyze::{compile, CompiledJoin, CompiledQuery};
pub use ast::JoinQuery;
pub use executor::JoinQueryExecutor;
