//! Co-location routing for join documents.
//!
//! Documents without a parent are routed by their own id. Children are routed
//! by their parent, and the parent's own routing applies transitively, so a
//! whole ancestry chain lands on the partition of its root document. The
//! enforcer is the source of truth: a caller-declared routing value is only
//! accepted if it equals the computed key. When an intermediate ancestor is
//! not indexed yet the root cannot be computed, so the declared routing is
//! taken as is and an undeclared one is rejected.

#![forbid(unsafe_code)]

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;
use xxhash_rust::xxh64::xxh64;

use crate::document::JoinDocument;
use crate::error::{RoutingError, SchemaError};
use crate::schema::RelationSchema;
use crate::types::PartitionId;

const ROUTING_SEED: u64 = 0;

/// Where a document was routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Routing key (the id of the root of the document's ancestry chain).
    pub key: String,
    /// Partition derived from `key`.
    pub partition: PartitionId,
}

/// Registry entry for an indexed document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Role the document was indexed with.
    pub role: String,
    /// Declared parent identifier.
    pub parent_id: Option<String>,
    /// Routing decision taken at indexing time.
    pub decision: RoutingDecision,
}

/// Computes and validates partition keys for join documents.
pub struct RoutingEnforcer {
    partitions: u32,
    routes: RwLock<FxHashMap<String, Route>>,
}

impl RoutingEnforcer {
    /// Creates an enforcer over `partitions` partitions (at least one).
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            routes: RwLock::new(FxHashMap::default()),
        }
    }

    /// Number of partitions keys are spread over.
    pub fn partition_count(&self) -> u32 {
        self.partitions
    }

    /// Maps a routing key onto a partition.
    pub fn partition_for(&self, key: &str) -> PartitionId {
        PartitionId((xxh64(key.as_bytes(), ROUTING_SEED) % u64::from(self.partitions)) as u32)
    }

    /// Checks the document's role and parent against the schema.
    pub fn check_shape(
        &self,
        schema: &RelationSchema,
        doc: &JoinDocument,
    ) -> Result<(), RoutingCheckError> {
        schema.require_role(&doc.role)?;
        match (&doc.parent_id, schema.is_child_role(&doc.role)) {
            (None, true) => Err(RoutingError::MissingParent {
                id: doc.id.clone(),
                role: doc.role.clone(),
            }
            .into()),
            (Some(_), false) => Err(RoutingError::UnexpectedParent {
                id: doc.id.clone(),
                role: doc.role.clone(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Computes the routing key the join requires for `doc`.
    pub fn partition_key_for(
        &self,
        schema: &RelationSchema,
        doc: &JoinDocument,
    ) -> Result<String, RoutingCheckError> {
        self.check_shape(schema, doc)?;
        let routes = self.routes.read();
        match chain_key(schema, &routes, doc) {
            ChainKey::Root(key) => Ok(key),
            ChainKey::Unresolved(ancestor) => Err(unresolved(doc, ancestor)),
        }
    }

    /// Computes the routing for `doc` and rejects a disagreeing declaration.
    pub fn validate(
        &self,
        schema: &RelationSchema,
        doc: &JoinDocument,
        declared: Option<&str>,
    ) -> Result<RoutingDecision, RoutingCheckError> {
        self.check_shape(schema, doc)?;
        let routes = self.routes.read();
        let key = chain_key(schema, &routes, doc);
        self.decide(doc, key, declared)
    }

    /// Validates `doc` and records its route in one step.
    ///
    /// Returns the decision together with the route previously recorded for
    /// the same id, if any.
    pub fn admit(
        &self,
        schema: &RelationSchema,
        doc: &JoinDocument,
        declared: Option<&str>,
    ) -> Result<(RoutingDecision, Option<Route>), RoutingCheckError> {
        self.check_shape(schema, doc)?;
        let mut routes = self.routes.write();
        let key = chain_key(schema, &routes, doc);
        let decision = self.decide(doc, key, declared)?;
        let previous = routes.insert(
            doc.id.clone(),
            Route {
                role: doc.role.clone(),
                parent_id: doc.parent_id.clone(),
                decision: decision.clone(),
            },
        );
        Ok((decision, previous))
    }

    /// Route recorded for `id`.
    pub fn route_of(&self, id: &str) -> Option<Route> {
        self.routes.read().get(id).cloned()
    }

    /// Drops the route of `id`, returning it.
    pub fn forget(&self, id: &str) -> Option<Route> {
        self.routes.write().remove(id)
    }

    /// Number of routed documents.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Returns true when no document has been routed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decide(
        &self,
        doc: &JoinDocument,
        key: ChainKey,
        declared: Option<&str>,
    ) -> Result<RoutingDecision, RoutingCheckError> {
        let key = match (key, declared) {
            (ChainKey::Root(key), Some(declared)) if declared != key => {
                return Err(RoutingError::Mismatch {
                    id: doc.id.clone(),
                    expected: key,
                    declared: declared.to_string(),
                }
                .into());
            }
            (ChainKey::Root(key), _) => key,
            (ChainKey::Unresolved(_), Some(declared)) => declared.to_string(),
            (ChainKey::Unresolved(ancestor), None) => return Err(unresolved(doc, ancestor)),
        };
        let partition = self.partition_for(&key);
        trace!(doc = %doc.id, key = %key, partition = %partition, "routed join document");
        Ok(RoutingDecision { key, partition })
    }
}

/// Outcome of walking an ancestry chain.
#[derive(Debug, PartialEq, Eq)]
enum ChainKey {
    /// Id of the chain root. A root-role parent needs no document to be known.
    Root(String),
    /// Id of the first intermediate ancestor that is not indexed.
    Unresolved(String),
}

/// Walks the ancestry of `doc` through recorded routes up to the root id.
fn chain_key(schema: &RelationSchema, routes: &FxHashMap<String, Route>, doc: &JoinDocument) -> ChainKey {
    let Some(parent_id) = doc.parent_id.as_deref() else {
        return ChainKey::Root(doc.id.clone());
    };
    let mut current = parent_id;
    for ancestor_role in schema.ancestors_of(&doc.role) {
        if !schema.is_child_role(ancestor_role) {
            break;
        }
        let next = routes
            .get(current)
            .filter(|route| route.role.as_str() == ancestor_role.as_ref())
            .and_then(|route| route.parent_id.as_deref());
        match next {
            Some(grandparent) => current = grandparent,
            None => return ChainKey::Unresolved(current.to_string()),
        }
    }
    ChainKey::Root(current.to_string())
}

fn unresolved(doc: &JoinDocument, ancestor: String) -> RoutingCheckError {
    RoutingError::UnresolvedAncestor {
        id: doc.id.clone(),
        ancestor,
    }
    .into()
}

/// Rejections raised by the enforcer: unknown roles or routing violations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RoutingCheckError {
    /// Role is not part of the schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Routing or parent shape violation.
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl From<RoutingCheckError> for crate::error::JoinError {
    fn from(err: RoutingCheckError) -> Self {
        match err {
            RoutingCheckError::Schema(err) => err.into(),
            RoutingCheckError::Routing(err) => err.into(),
        }
    }
}
