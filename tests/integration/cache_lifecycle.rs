#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parent_join::{
    BuildError, CacheKey, IndexGeneration, IndexRequest, JoinConfig, JoinDocument, JoinEngine,
    JoinFieldMapping, JoinQuery, OrdinalCache, OrdinalJoinIndex, PartitionId, PartitionStore,
    RelationSchema, SchemaGeneration, StoredDocument,
};
use serde_json::{json, Map};

const THREADS: usize = 8;

fn schema() -> Arc<RelationSchema> {
    Arc::new(
        RelationSchema::from_relations([("question", vec!["answer"])]).expect("schema"),
    )
}

fn store(partition: u32, questions: usize) -> PartitionStore {
    let mut store = PartitionStore::new(PartitionId(partition));
    for q in 0..questions {
        let qid = format!("q{q}");
        store.insert(StoredDocument {
            doc: JoinDocument::root(qid.clone(), "question"),
            routing: qid.clone(),
            source: json!({}),
        });
        store.insert(StoredDocument {
            doc: JoinDocument::child(format!("a{q}"), "answer", qid.clone()),
            routing: qid,
            source: json!({}),
        });
    }
    store
}

fn key(partition: u32) -> CacheKey {
    CacheKey {
        partition: PartitionId(partition),
        schema_generation: SchemaGeneration(1),
        index_generation: IndexGeneration(0),
    }
}

#[test]
fn concurrent_misses_share_one_build() {
    let cache = OrdinalCache::new(usize::MAX);
    let store = Arc::new(store(0, 64));
    let schema = schema();
    let builds = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = cache.clone();
            let store = Arc::clone(&store);
            let schema = Arc::clone(&schema);
            let builds = Arc::clone(&builds);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let guard = cache
                    .get(key(0), || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        OrdinalJoinIndex::build(&*store, schema, IndexGeneration(0))
                    })
                    .expect("snapshot");
                guard.stats().ordinals
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().expect("thread"), 64);
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(cache.readers(&key(0)), 0);
}

#[test]
fn waiters_see_failure_and_next_access_retries() {
    let cache = OrdinalCache::new(usize::MAX);
    let barrier = Arc::new(Barrier::new(2));
    let leader = {
        let cache = cache.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            cache.get(key(0), || {
                barrier.wait();
                thread::sleep(Duration::from_millis(200));
                Err(BuildError::Source {
                    partition: PartitionId(0),
                    reason: "disk went away".into(),
                })
            })
        })
    };
    barrier.wait();
    let follower = cache.get(key(0), || panic!("follower must not build while leader runs"));
    assert!(matches!(follower, Err(BuildError::Source { .. })));
    assert!(leader.join().expect("leader").is_err());
    assert!(!cache.contains(&key(0)));

    let store = store(0, 2);
    let guard = cache
        .get(key(0), || OrdinalJoinIndex::build(&store, schema(), IndexGeneration(0)))
        .expect("retry succeeds");
    assert_eq!(guard.stats().ordinals, 2);
    let stats = cache.stats();
    assert_eq!((stats.build_failures, stats.builds), (1, 1));
}

#[test]
fn panicking_builder_releases_waiters() {
    let cache = OrdinalCache::new(usize::MAX);
    let barrier = Arc::new(Barrier::new(2));
    let leader = {
        let cache = cache.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let _ = cache.get(key(0), || {
                barrier.wait();
                thread::sleep(Duration::from_millis(200));
                panic!("builder crashed");
            });
        })
    };
    barrier.wait();
    let follower = cache.get(key(0), || panic!("follower must not build while leader runs"));
    assert!(matches!(follower, Err(BuildError::Source { .. })));
    assert!(leader.join().is_err());
    assert!(!cache.contains(&key(0)));

    let store = store(0, 3);
    let guard = cache
        .get(key(0), || OrdinalJoinIndex::build(&store, schema(), IndexGeneration(0)))
        .expect("rebuild after panic");
    assert_eq!(guard.stats().ordinals, 3);
    assert_eq!(cache.stats().builds, 1);
}

#[test]
fn readers_keep_their_snapshot_across_writes() {
    let mapping = JoinFieldMapping::from_simplified("join_field", true, &[("question", "answer")]);
    let engine = JoinEngine::new(
        JoinConfig {
            partitions: 1,
            ..JoinConfig::default()
        },
        mapping,
    )
    .expect("engine");
    let request =
        |id: &str, role: &str, parent: Option<&str>| IndexRequest::for_role("join_field", id, role, parent, Map::new());
    engine.index(&request("1", "question", None)).unwrap();
    engine.index(&request("a", "answer", Some("1"))).unwrap();

    let before = engine.snapshot(PartitionId(0)).unwrap();
    engine.index(&request("b", "answer", Some("1"))).unwrap();
    engine.delete("a").unwrap();
    let after = engine.snapshot(PartitionId(0)).unwrap();

    assert_eq!(before.children_of("question", "1").len(), 1);
    assert_eq!(after.children_of("question", "1").len(), 1);
    assert_ne!(
        before.children_of("question", "1"),
        after.children_of("question", "1")
    );
    assert!(!Arc::ptr_eq(before.snapshot(), after.snapshot()));
    assert_eq!(before.key(), after.key());
}

#[test]
fn eviction_waits_for_readers() {
    let one = OrdinalJoinIndex::build(&store(0, 128), schema(), IndexGeneration(0)).unwrap();
    let budget = one.estimated_bytes() + one.estimated_bytes() / 2;
    let cache = OrdinalCache::new(budget);

    let held = cache
        .get(key(0), || OrdinalJoinIndex::build(&store(0, 128), schema(), IndexGeneration(0)))
        .unwrap();
    for partition in 1..4 {
        let guard = cache
            .get(key(partition), || {
                OrdinalJoinIndex::build(&store(partition, 128), schema(), IndexGeneration(0))
            })
            .unwrap();
        drop(guard);
        assert!(cache.contains(&key(0)), "held snapshot must stay resident");
    }
    assert!(cache.stats().evictions >= 2);
    let evictions = cache.stats().evictions;
    drop(held);
    assert!(!cache.contains(&key(0)));
    assert_eq!(cache.stats().evictions, evictions + 1);
}

#[test]
fn concurrent_writers_and_readers_agree_at_quiescence() {
    let mapping = JoinFieldMapping::from_simplified("join_field", false, &[("question", "answer")]);
    let engine = Arc::new(
        JoinEngine::new(
            JoinConfig {
                partitions: 4,
                incremental_update_threshold: 16,
                ..JoinConfig::default()
            },
            mapping,
        )
        .expect("engine"),
    );
    for q in 0..THREADS {
        engine
            .index(&IndexRequest::for_role(
                "join_field",
                format!("q{q}"),
                "question",
                None,
                Map::new(),
            ))
            .unwrap();
    }
    let barrier = Arc::new(Barrier::new(THREADS * 2));
    let mut handles = Vec::new();
    for q in 0..THREADS {
        let writer_engine = Arc::clone(&engine);
        let writer_barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            writer_barrier.wait();
            let parent = format!("q{q}");
            for a in 0..50 {
                writer_engine
                    .index(&IndexRequest::for_role(
                        "join_field",
                        format!("a{q}-{a}"),
                        "answer",
                        Some(&parent),
                        Map::new(),
                    ))
                    .unwrap();
            }
        }));
        let reader_engine = Arc::clone(&engine);
        let reader_barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            reader_barrier.wait();
            for _ in 0..20 {
                let hits = reader_engine
                    .search(&JoinQuery::has_child("answer", JoinQuery::match_all()))
                    .unwrap();
                assert!(hits.len() <= THREADS);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("thread");
    }
    for q in 0..THREADS {
        let hits = engine
            .search(&JoinQuery::parent_id("answer", format!("q{q}")))
            .unwrap();
        assert_eq!(hits.len(), 50);
    }
    let hits = engine
        .search(&JoinQuery::has_child("answer", JoinQuery::match_all()).with_child_bounds(Some(50), Some(50)))
        .unwrap();
    assert_eq!(hits.len(), THREADS);
}
