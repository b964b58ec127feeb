//! Shared, generation-keyed cache of ordinal join index snapshots.
//!
//! Entries are keyed by partition, schema generation and index generation.
//! A miss builds the snapshot through the caller-supplied builder; concurrent
//! requesters of the same key wait on a single in-flight build instead of
//! building again. Readers hold a [`SnapshotGuard`]; entries with live guards
//! are never evicted, only flagged so that the last guard drops them.

#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::BuildError;
use crate::ordinals::OrdinalJoinIndex;
use crate::types::{IndexGeneration, PartitionId, SchemaGeneration};

/// Identity of a cached snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Partition the snapshot indexes.
    pub partition: PartitionId,
    /// Schema generation the snapshot was built against.
    pub schema_generation: SchemaGeneration,
    /// Build generation of the partition.
    pub index_generation: IndexGeneration,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.partition, self.schema_generation, self.index_generation
        )
    }
}

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a resident snapshot.
    pub hits: u64,
    /// Lookups that started a build.
    pub misses: u64,
    /// Successful builds.
    pub builds: u64,
    /// Failed builds.
    pub build_failures: u64,
    /// Snapshots dropped to stay within the memory budget.
    pub evictions: u64,
    /// Snapshots dropped by invalidation.
    pub invalidations: u64,
    /// Incremental updates applied to resident snapshots.
    pub updates: u64,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    updates: AtomicU64,
}

impl CacheMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
        }
    }
}

struct CacheEntry {
    snapshot: Arc<OrdinalJoinIndex>,
    readers: usize,
    evict_on_release: bool,
    bytes: usize,
}

enum SlotState {
    Building,
    Ready,
    Failed(BuildError),
}

struct BuildSlot {
    state: Mutex<SlotState>,
    done: Condvar,
    stale: AtomicBool,
}

impl BuildSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Building),
            done: Condvar::new(),
            stale: AtomicBool::new(false),
        }
    }

    fn publish(&self, state: SlotState) {
        *self.state.lock() = state;
        self.done.notify_all();
    }

    fn wait(&self) -> Result<(), BuildError> {
        let mut state = self.state.lock();
        while matches!(*state, SlotState::Building) {
            self.done.wait(&mut state);
        }
        match &*state {
            SlotState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    in_flight: FxHashMap<CacheKey, Arc<BuildSlot>>,
    bytes: usize,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.bytes);
        Some(entry)
    }

    fn mark_in_flight_stale(&self, partition: PartitionId) {
        for (key, slot) in &self.in_flight {
            if key.partition == partition {
                slot.stale.store(true, Ordering::Release);
            }
        }
    }

    /// Drops least recently used idle entries until `budget` is met. Entries
    /// with readers are flagged instead.
    fn enforce_budget(&mut self, budget: usize, metrics: &CacheMetrics) {
        if self.bytes <= budget {
            return;
        }
        let mut excess = self.bytes - budget;
        let mut victims = Vec::new();
        for (key, entry) in self.entries.iter_mut().rev() {
            if excess == 0 {
                break;
            }
            if entry.readers == 0 {
                victims.push(*key);
            } else {
                entry.evict_on_release = true;
            }
            excess = excess.saturating_sub(entry.bytes);
        }
        for key in victims {
            if self.remove(&key).is_some() {
                CacheMetrics::bump(&metrics.evictions);
                debug!(key = %key, "evicted ordinal snapshot");
            }
        }
    }
}

struct Shared {
    state: Mutex<CacheState>,
    metrics: CacheMetrics,
    budget: usize,
}

impl Shared {
    fn release(&self, key: &CacheKey, snapshot: &Arc<OrdinalJoinIndex>) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.peek_mut(key) else {
            return;
        };
        if !Arc::ptr_eq(&entry.snapshot, snapshot) {
            return;
        }
        entry.readers = entry.readers.saturating_sub(1);
        if entry.readers == 0 && entry.evict_on_release {
            state.remove(key);
            CacheMetrics::bump(&self.metrics.evictions);
            debug!(key = %key, "evicted ordinal snapshot on release");
        }
    }
}

/// Cache of ordinal join index snapshots with single-flight builds.
#[derive(Clone)]
pub struct OrdinalCache {
    shared: Arc<Shared>,
}

impl OrdinalCache {
    /// Creates a cache that tries to keep resident snapshots within
    /// `budget_bytes`.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    in_flight: FxHashMap::default(),
                    bytes: 0,
                }),
                metrics: CacheMetrics::default(),
                budget: budget_bytes,
            }),
        }
    }

    /// Returns the snapshot for `key`, building it with `build` on a miss.
    ///
    /// At most one build per key runs at a time; other callers block until
    /// it finishes and then share its result. A failed build is not cached;
    /// every caller waiting on it receives the error and the next call
    /// builds again.
    pub fn get<F>(&self, key: CacheKey, build: F) -> Result<SnapshotGuard, BuildError>
    where
        F: FnOnce() -> Result<OrdinalJoinIndex, BuildError>,
    {
        let slot = loop {
            let (slot, leader) = {
                let mut state = self.shared.state.lock();
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.readers += 1;
                    let snapshot = Arc::clone(&entry.snapshot);
                    CacheMetrics::bump(&self.shared.metrics.hits);
                    return Ok(self.guard(key, snapshot));
                }
                match state.in_flight.get(&key) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot = Arc::new(BuildSlot::new());
                        state.in_flight.insert(key, Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };
            if leader {
                break slot;
            }
            trace!(key = %key, "waiting on in-flight ordinal build");
            slot.wait()?;
        };
        CacheMetrics::bump(&self.shared.metrics.misses);
        let mut leader = BuildLeader {
            cache: self,
            key,
            slot: Some(slot),
        };
        let result = build();
        match leader.slot.take() {
            Some(slot) => self.finish_build(key, &slot, result),
            None => Err(abandoned(key)),
        }
    }

    fn finish_build(
        &self,
        key: CacheKey,
        slot: &BuildSlot,
        result: Result<OrdinalJoinIndex, BuildError>,
    ) -> Result<SnapshotGuard, BuildError> {
        let mut state = self.shared.state.lock();
        state.in_flight.remove(&key);
        match result {
            Ok(index) => {
                CacheMetrics::bump(&self.shared.metrics.builds);
                let snapshot = Arc::new(index);
                if slot.stale.load(Ordering::Acquire) {
                    debug!(key = %key, "discarding ordinal snapshot overtaken by a write");
                } else {
                    let bytes = snapshot.estimated_bytes();
                    state.entries.put(
                        key,
                        CacheEntry {
                            snapshot: Arc::clone(&snapshot),
                            readers: 1,
                            evict_on_release: false,
                            bytes,
                        },
                    );
                    state.bytes += bytes;
                    state.enforce_budget(self.shared.budget, &self.shared.metrics);
                }
                slot.publish(SlotState::Ready);
                drop(state);
                Ok(self.guard(key, snapshot))
            }
            Err(err) => {
                CacheMetrics::bump(&self.shared.metrics.build_failures);
                debug!(key = %key, error = %err, "ordinal build failed");
                slot.publish(SlotState::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Applies an incremental update to the resident snapshot for `key`.
    ///
    /// Readers holding the previous snapshot keep it unchanged. Builds in
    /// flight for the partition are marked stale so their result is not
    /// cached. Returns whether a resident snapshot was updated. If `update`
    /// fails the snapshot is dropped and the next lookup rebuilds it.
    pub fn apply<F>(&self, key: CacheKey, update: F) -> Result<bool, BuildError>
    where
        F: FnOnce(&mut OrdinalJoinIndex) -> Result<(), BuildError>,
    {
        let mut state = self.shared.state.lock();
        state.mark_in_flight_stale(key.partition);
        let Some(entry) = state.entries.peek_mut(&key) else {
            return Ok(false);
        };
        let fresh = Arc::get_mut(&mut entry.snapshot).is_none();
        let index = Arc::make_mut(&mut entry.snapshot);
        if let Err(err) = update(index) {
            state.remove(&key);
            debug!(key = %key, error = %err, "dropped ordinal snapshot after failed update");
            return Err(err);
        }
        let bytes = entry.snapshot.estimated_bytes();
        let previous = std::mem::replace(&mut entry.bytes, bytes);
        if fresh {
            entry.readers = 0;
            entry.evict_on_release = false;
        }
        state.bytes = state.bytes.saturating_sub(previous) + bytes;
        CacheMetrics::bump(&self.shared.metrics.updates);
        state.enforce_budget(self.shared.budget, &self.shared.metrics);
        Ok(true)
    }

    /// Drops every snapshot of `partition` and marks its in-flight builds
    /// stale. Returns the number of snapshots dropped.
    pub fn invalidate(&self, partition: PartitionId) -> usize {
        let mut state = self.shared.state.lock();
        state.mark_in_flight_stale(partition);
        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| key.partition == partition)
            .collect();
        for key in &keys {
            state.remove(key);
            CacheMetrics::bump(&self.shared.metrics.invalidations);
        }
        if !keys.is_empty() {
            debug!(partition = %partition, dropped = keys.len(), "invalidated ordinal snapshots");
        }
        keys.len()
    }

    /// Drops every snapshot and marks all in-flight builds stale.
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.shared.state.lock();
        for slot in state.in_flight.values() {
            slot.stale.store(true, Ordering::Release);
        }
        let dropped = state.entries.len();
        state.entries.clear();
        state.bytes = 0;
        self.shared
            .metrics
            .invalidations
            .fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            debug!(dropped, "invalidated all ordinal snapshots");
        }
        dropped
    }

    /// Releases every resident snapshot. Outstanding guards stay valid.
    pub fn drain(&self) {
        let dropped = self.invalidate_all();
        debug!(dropped, "drained ordinal cache");
    }

    /// Returns whether a snapshot for `key` is resident.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shared.state.lock().entries.contains(key)
    }

    /// Number of live guards on the resident snapshot for `key`.
    pub fn readers(&self, key: &CacheKey) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .peek(key)
            .map_or(0, |entry| entry.readers)
    }

    /// Number of resident snapshots.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Returns true when no snapshot is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes held by resident snapshots.
    pub fn resident_bytes(&self) -> usize {
        self.shared.state.lock().bytes
    }

    /// Configured memory budget.
    pub fn budget_bytes(&self) -> usize {
        self.shared.budget
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.metrics.snapshot()
    }

    fn guard(&self, key: CacheKey, snapshot: Arc<OrdinalJoinIndex>) -> SnapshotGuard {
        SnapshotGuard {
            key,
            snapshot,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Publishes a failure to waiters if the builder unwinds.
struct BuildLeader<'a> {
    cache: &'a OrdinalCache,
    key: CacheKey,
    slot: Option<Arc<BuildSlot>>,
}

impl Drop for BuildLeader<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.cache.shared.state.lock().in_flight.remove(&self.key);
            slot.publish(SlotState::Failed(abandoned(self.key)));
        }
    }
}

fn abandoned(key: CacheKey) -> BuildError {
    BuildError::Source {
        partition: key.partition,
        reason: "ordinal build abandoned".to_string(),
    }
}

impl fmt::Debug for OrdinalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OrdinalCache")
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .field("bytes", &state.bytes)
            .field("budget", &self.shared.budget)
            .finish()
    }
}

/// Read handle on a cached snapshot. Dropping it releases the reader count.
pub struct SnapshotGuard {
    key: CacheKey,
    snapshot: Arc<OrdinalJoinIndex>,
    shared: Arc<Shared>,
}

impl SnapshotGuard {
    /// Key the snapshot was served under.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Shared handle on the snapshot.
    pub fn snapshot(&self) -> &Arc<OrdinalJoinIndex> {
        &self.snapshot
    }
}

impl Deref for SnapshotGuard {
    type Target = OrdinalJoinIndex;

    fn deref(&self) -> &Self::Target {
        &self.snapshot
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.shared.release(&self.key, &self.snapshot);
    }
}

impl fmt::Debug for SnapshotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotGuard").field("key", &self.key).finish()
    }
}
