//! Join engine: the owned context wiring schema, routing, partitions and the
//! ordinal cache.
//!
//! Writes to a partition hold its store lock exclusively, so same-partition
//! writes are linearized and always observe the snapshot they update. Writes
//! of one id also hold that id's write shard from routing until the store is
//! updated, so a replace that moves a document never races another write of
//! the same id. Reads
//! hold the store lock shared while they evaluate, and keep the snapshot they
//! acquired even if a later write copies it.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

use crate::cache::{CacheKey, CacheStats, OrdinalCache, SnapshotGuard};
use crate::config::JoinConfig;
use crate::document::{IndexRequest, JoinDocument};
use crate::error::{rejected, BuildError, JoinError, MappingError, Result};
use crate::ordinals::OrdinalJoinIndex;
use crate::partition::{PartitionStore, StoredDocument};
use crate::query::{compile, JoinQuery, JoinQueryExecutor};
use crate::routing::RoutingEnforcer;
use crate::schema::{JoinFieldMapping, RelationSchema};
use crate::types::{DocPosition, IndexGeneration, PartitionId};

const WRITE_SHARDS: usize = 64;

/// Result of indexing one document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Document identifier.
    pub id: String,
    /// Routing key the document was stored under.
    pub routing: String,
    /// Partition holding the document.
    pub partition: PartitionId,
    /// Position assigned inside the partition.
    pub position: DocPosition,
    /// Whether a document with the same id was replaced.
    pub replaced: bool,
}

/// One matching document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hit {
    /// Partition the document lives in.
    pub partition: PartitionId,
    /// Position inside the partition.
    pub position: DocPosition,
    /// Document identifier.
    pub id: String,
    /// Join role of the document.
    pub role: String,
}

/// Per-partition counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionStats {
    /// Partition described.
    pub partition: PartitionId,
    /// Live documents.
    pub documents: usize,
    /// Current build generation.
    pub index_generation: IndexGeneration,
}

struct SchemaState {
    mapping: JoinFieldMapping,
    schema: Arc<RelationSchema>,
    eager: bool,
}

struct Partition {
    id: PartitionId,
    store: RwLock<PartitionStore>,
    generation: Mutex<IndexGeneration>,
}

impl Partition {
    fn key(&self, schema: &RelationSchema) -> CacheKey {
        CacheKey {
            partition: self.id,
            schema_generation: schema.generation(),
            index_generation: *self.generation.lock(),
        }
    }
}

/// Join-field engine over a fixed set of partitions.
pub struct JoinEngine {
    config: JoinConfig,
    state: RwLock<SchemaState>,
    routing: RoutingEnforcer,
    partitions: Vec<Partition>,
    write_shards: Vec<Mutex<()>>,
    cache: OrdinalCache,
    closed: AtomicBool,
}

impl JoinEngine {
    /// Creates an engine serving `mapping` with the given configuration.
    pub fn new(config: JoinConfig, mapping: JoinFieldMapping) -> Result<Self> {
        config.validate()?;
        check_field(&config, &mapping)?;
        let schema = mapping.schema()?;
        let eager = config
            .eager_global_ordinals
            .unwrap_or(mapping.eager_global_ordinals);
        let partitions = (0..config.partitions)
            .map(|id| Partition {
                id: PartitionId(id),
                store: RwLock::new(PartitionStore::new(PartitionId(id))),
                generation: Mutex::new(IndexGeneration::default()),
            })
            .collect();
        info!(
            field = %mapping.field,
            partitions = config.partitions,
            roles = schema.roles().count(),
            eager,
            "join.engine.opened"
        );
        Ok(Self {
            routing: RoutingEnforcer::new(config.partitions),
            cache: OrdinalCache::new(config.cache_memory_budget_bytes),
            state: RwLock::new(SchemaState {
                mapping,
                schema: Arc::new(schema),
                eager,
            }),
            partitions,
            write_shards: (0..WRITE_SHARDS).map(|_| Mutex::new(())).collect(),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Indexes one document, replacing any document with the same id.
    pub fn index(&self, request: &IndexRequest) -> Result<IndexOutcome> {
        self.ensure_open()?;
        let state = self.state.read();
        self.index_with(&state, request)
            .map_err(|err| rejected(&request.id, err))
    }

    /// Indexes documents one by one; a rejected document does not stop the
    /// rest of the batch.
    pub fn index_batch(&self, requests: &[IndexRequest]) -> Vec<Result<IndexOutcome>> {
        if self.is_closed() {
            return requests.iter().map(|_| Err(JoinError::Closed)).collect();
        }
        let state = self.state.read();
        requests
            .iter()
            .map(|request| {
                self.index_with(&state, request)
                    .map_err(|err| rejected(&request.id, err))
            })
            .collect()
    }

    fn index_with(&self, state: &SchemaState, request: &IndexRequest) -> Result<IndexOutcome> {
        let doc = request.join_document(&self.config.join_field)?;
        let _write = self.write_shard_for(&doc.id).lock();
        let (decision, previous) =
            self.routing
                .admit(&state.schema, &doc, request.routing.as_deref())?;
        if let Some(previous) = previous {
            if previous.decision.partition != decision.partition {
                self.remove_from(state, previous.decision.partition, &doc.id);
            }
        }
        let partition = self.partition(decision.partition)?;
        let mut store = partition.store.write();
        let (position, replaced) = store.insert(StoredDocument {
            doc: doc.clone(),
            routing: decision.key.clone(),
            source: request.source.clone(),
        });
        let replaced_position = replaced.map(|(position, _)| position);
        self.update_index(state, partition, &store, |index| {
            if let Some(old) = replaced_position {
                index.remove(old);
            }
            index.insert(position, &doc)
        });
        debug!(
            doc = %doc.id,
            role = %doc.role,
            partition = %partition.id,
            position = %position,
            "indexed join document"
        );
        Ok(IndexOutcome {
            id: doc.id,
            routing: decision.key,
            partition: partition.id,
            position,
            replaced: replaced_position.is_some(),
        })
    }

    /// Deletes the document `id`. Descendants are left in place as orphans.
    ///
    /// Returns whether a document was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        let state = self.state.read();
        let _write = self.write_shard_for(id).lock();
        let Some(route) = self.routing.forget(id) else {
            return Ok(false);
        };
        Ok(self.remove_from(&state, route.decision.partition, id))
    }

    fn remove_from(&self, state: &SchemaState, partition: PartitionId, id: &str) -> bool {
        let Ok(partition) = self.partition(partition) else {
            return false;
        };
        let mut store = partition.store.write();
        let Some((position, _)) = store.remove(id) else {
            return false;
        };
        self.update_index(state, partition, &store, |index| {
            index.remove(position);
            Ok(())
        });
        debug!(doc = id, partition = %partition.id, "deleted join document");
        true
    }

    /// Applies a write to the partition's resident snapshot, building one in
    /// eager mode and forcing a rebuild once too many updates accumulated.
    ///
    /// The caller holds the partition's store lock exclusively.
    fn update_index<F>(&self, state: &SchemaState, partition: &Partition, store: &PartitionStore, update: F)
    where
        F: FnOnce(&mut OrdinalJoinIndex) -> std::result::Result<(), BuildError>,
    {
        let key = partition.key(&state.schema);
        let mut updates = 0;
        let applied = self.cache.apply(key, |index| {
            update(index)?;
            updates = index.updates_since_build();
            Ok(())
        });
        match applied {
            Ok(true) if updates > self.config.incremental_update_threshold => {
                self.bump_generation(partition);
                debug!(
                    partition = %partition.id,
                    updates,
                    threshold = self.config.incremental_update_threshold,
                    "incremental update threshold exceeded"
                );
            }
            Ok(true) => {}
            Ok(false) if state.eager => {
                if let Err(err) = self.load(partition, &state.schema, store) {
                    debug!(partition = %partition.id, error = %err, "eager ordinal build failed");
                }
            }
            Ok(false) => {}
            Err(err) => {
                self.bump_generation(partition);
                debug!(partition = %partition.id, error = %err, "incremental update failed");
            }
        }
    }

    fn bump_generation(&self, partition: &Partition) {
        {
            let mut generation = partition.generation.lock();
            *generation = generation.next();
        }
        self.cache.invalidate(partition.id);
    }

    fn load(
        &self,
        partition: &Partition,
        schema: &Arc<RelationSchema>,
        store: &PartitionStore,
    ) -> std::result::Result<SnapshotGuard, BuildError> {
        let key = partition.key(schema);
        self.cache.get(key, || {
            OrdinalJoinIndex::build(store, Arc::clone(schema), key.index_generation)
        })
    }

    /// Replaces the relation schema. Every cached snapshot is dropped; each
    /// partition rebuilds once on its next use.
    pub fn redefine(&self, mapping: JoinFieldMapping) -> Result<()> {
        self.ensure_open()?;
        check_field(&self.config, &mapping)?;
        let mut state = self.state.write();
        let schema = mapping.schema()?.succeeding(state.schema.generation());
        let eager = self
            .config
            .eager_global_ordinals
            .unwrap_or(mapping.eager_global_ordinals);
        let dropped = self.cache.invalidate_all();
        info!(
            generation = %schema.generation(),
            dropped,
            "join.schema.redefined"
        );
        *state = SchemaState {
            mapping,
            schema: Arc::new(schema),
            eager,
        };
        Ok(())
    }

    /// Runs `query` over every partition.
    ///
    /// The query is compiled first; a query naming a role outside the
    /// relation it needs fails before any partition is read.
    pub fn search(&self, query: &JoinQuery) -> Result<Vec<Hit>> {
        self.ensure_open()?;
        let state = self.state.read();
        let compiled = compile(query, &state.schema)?;
        let mut hits = Vec::new();
        for partition in &self.partitions {
            let store = partition.store.read();
            if store.is_empty() {
                continue;
            }
            let positions = if compiled.uses_join() {
                let snapshot = self.load(partition, &state.schema, &store)?;
                JoinQueryExecutor::new(&store, &snapshot).execute(compiled.root())
            } else {
                let empty = OrdinalJoinIndex::empty(
                    partition.id,
                    Arc::clone(&state.schema),
                    IndexGeneration::default(),
                );
                JoinQueryExecutor::new(&store, &empty).execute(compiled.root())
            };
            hits.extend(positions.into_iter().filter_map(|position| {
                store.get(position).map(|stored| Hit {
                    partition: partition.id,
                    position,
                    id: stored.doc.id.clone(),
                    role: stored.doc.role.clone(),
                })
            }));
        }
        Ok(hits)
    }

    /// Acquires the current ordinal snapshot of `partition`, building it if
    /// needed. The snapshot stays valid while the guard is held.
    pub fn snapshot(&self, partition: PartitionId) -> Result<SnapshotGuard> {
        self.ensure_open()?;
        let state = self.state.read();
        let partition = self.partition(partition)?;
        let store = partition.store.read();
        Ok(self.load(partition, &state.schema, &store)?)
    }

    /// Stored copy of the document `id`.
    pub fn document(&self, id: &str) -> Option<StoredDocument> {
        let route = self.routing.route_of(id)?;
        let partition = self.partition(route.decision.partition).ok()?;
        let store = partition.store.read();
        store
            .position_of(id)
            .and_then(|position| store.get(position))
            .cloned()
    }

    /// Join identity of the document `id`.
    pub fn join_document(&self, id: &str) -> Option<JoinDocument> {
        self.document(id).map(|stored| stored.doc)
    }

    /// Current relation schema.
    pub fn schema(&self) -> Arc<RelationSchema> {
        Arc::clone(&self.state.read().schema)
    }

    /// Current mapping.
    pub fn mapping(&self) -> JoinFieldMapping {
        self.state.read().mapping.clone()
    }

    /// Routing enforcer used for every write.
    pub fn routing(&self) -> &RoutingEnforcer {
        &self.routing
    }

    /// Engine configuration.
    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.routing.partition_count()
    }

    /// Counters of `partition`.
    pub fn partition_stats(&self, partition: PartitionId) -> Result<PartitionStats> {
        let partition = self.partition(partition)?;
        let documents = partition.store.read().len();
        Ok(PartitionStats {
            partition: partition.id,
            documents,
            index_generation: *partition.generation.lock(),
        })
    }

    /// Ordinal cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Shared handle on the ordinal cache.
    pub fn cache(&self) -> &OrdinalCache {
        &self.cache
    }

    /// Stops accepting operations and releases every cached snapshot.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.drain();
        info!(documents = self.routing.len(), "join.engine.closed");
    }

    /// Returns whether [`JoinEngine::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(JoinError::Closed);
        }
        Ok(())
    }

    fn write_shard_for(&self, id: &str) -> &Mutex<()> {
        let idx = (xxh64(id.as_bytes(), 0) as usize) % self.write_shards.len();
        &self.write_shards[idx]
    }

    fn partition(&self, id: PartitionId) -> Result<&Partition> {
        self.partitions
            .get(id.0 as usize)
            .ok_or(JoinError::UnknownPartition(id))
    }
}

fn check_field(config: &JoinConfig, mapping: &JoinFieldMapping) -> Result<()> {
    if mapping.field != config.join_field {
        return Err(MappingError::FieldMismatch {
            expected: config.join_field.clone(),
            found: mapping.field.clone(),
        }
        .into());
    }
    Ok(())
}
