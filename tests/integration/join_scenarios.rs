#![allow(missing_docs)]

use parent_join::{
    IndexRequest, JoinConfig, JoinEngine, JoinError, JoinFieldMapping, JoinQuery, QueryError,
    RoutingError,
};
use serde_json::{json, Map, Value};

const FIELD: &str = "join_field";

fn engine_with(relations: &[(&str, &str)], eager: bool, partitions: u32) -> JoinEngine {
    let mapping = JoinFieldMapping::from_simplified(FIELD, eager, relations);
    let config = JoinConfig {
        partitions,
        ..JoinConfig::default()
    };
    JoinEngine::new(config, mapping).expect("engine")
}

fn doc(id: &str, role: &str, parent: Option<&str>) -> IndexRequest {
    IndexRequest::for_role(FIELD, id, role, parent, Map::new())
}

fn doc_with(id: &str, role: &str, parent: Option<&str>, fields: Value) -> IndexRequest {
    let Value::Object(fields) = fields else {
        panic!("fields must be an object");
    };
    IndexRequest::for_role(FIELD, id, role, parent, fields)
}

fn ids(engine: &JoinEngine, query: JoinQuery) -> Vec<String> {
    let mut ids: Vec<String> = engine
        .search(&query)
        .expect("search")
        .into_iter()
        .map(|hit| hit.id)
        .collect();
    ids.sort();
    ids
}

#[test]
fn simple_parent_child_round_trip() {
    let engine = engine_with(&[("parent", "child")], true, 4);
    engine.index(&doc("1", "parent", None)).unwrap();
    let child = engine.index(&doc("10", "child", Some("1"))).unwrap();

    let snapshot = engine.snapshot(child.partition).unwrap();
    let parent = snapshot.resolve_parent(child.position).expect("linked child");
    assert_eq!(parent.identifier, "1");
    assert!(parent.document.is_some());

    assert_eq!(
        ids(&engine, JoinQuery::has_parent("parent", JoinQuery::ids(["1"]))),
        vec!["10"]
    );
    assert_eq!(ids(&engine, JoinQuery::parent_id("child", "1")), vec!["10"]);
    assert_eq!(
        ids(&engine, JoinQuery::has_child("child", JoinQuery::match_all())),
        vec!["1"]
    );
}

#[test]
fn orphan_child_keeps_identifier() {
    let engine = engine_with(&[("parent", "child")], true, 4);
    let orphan = engine.index(&doc("11", "child", Some("999"))).unwrap();
    assert_eq!(orphan.routing, "999");

    let snapshot = engine.snapshot(orphan.partition).unwrap();
    let parent = snapshot.resolve_parent(orphan.position).expect("orphan link");
    assert_eq!(parent.identifier, "999");
    assert_eq!(parent.document, None);
    assert_eq!(snapshot.children_of("parent", "999"), &[orphan.position]);
    drop(snapshot);

    assert_eq!(ids(&engine, JoinQuery::parent_id("child", "999")), vec!["11"]);
    assert!(ids(&engine, JoinQuery::has_child("child", JoinQuery::match_all())).is_empty());
    assert!(ids(&engine, JoinQuery::has_parent("parent", JoinQuery::match_all())).is_empty());
}

#[test]
fn three_levels_share_the_grandparent_partition() {
    let engine = engine_with(&[("grandparent", "parent"), ("parent", "child")], true, 16);
    let mut partitions = Vec::new();
    for g in 0..8 {
        let gid = format!("g{g}");
        let pid = format!("p{g}");
        let cid = format!("c{g}");
        let grand = engine.index(&doc(&gid, "grandparent", None)).unwrap();
        let parent = engine.index(&doc(&pid, "parent", Some(&gid))).unwrap();
        // Routed by the immediate parent id, as a client would.
        let child = engine
            .index(&doc(&cid, "child", Some(&pid)).with_routing(gid.clone()))
            .unwrap();
        assert_eq!(parent.partition, grand.partition);
        assert_eq!(child.partition, grand.partition);
        assert_eq!(child.routing, gid);
        partitions.push(grand.partition);
    }
    partitions.sort();
    partitions.dedup();
    assert!(partitions.len() > 1, "keys should spread over partitions");

    assert_eq!(
        ids(
            &engine,
            JoinQuery::has_child("parent", JoinQuery::has_child("child", JoinQuery::match_all()))
        )
        .len(),
        8
    );
    assert_eq!(
        ids(
            &engine,
            JoinQuery::has_parent("parent", JoinQuery::has_parent("grandparent", JoinQuery::ids(["g3"])))
        ),
        vec!["c3"]
    );
}

#[test]
fn grandchild_routing_must_name_the_root() {
    let engine = engine_with(&[("grandparent", "parent"), ("parent", "child")], true, 4);
    engine.index(&doc("g1", "grandparent", None)).unwrap();
    engine.index(&doc("p1", "parent", Some("g1"))).unwrap();
    // `for_role` routes by the immediate parent, which is wrong one level down.
    let err = engine.index(&doc("c1", "child", Some("p1"))).unwrap_err();
    assert!(matches!(
        err,
        JoinError::Routing(RoutingError::Mismatch { ref expected, ref declared, .. })
            if expected == "g1" && declared == "p1"
    ));
    let mut undeclared = doc("c1", "child", Some("p1"));
    undeclared.routing = None;
    assert_eq!(engine.index(&undeclared).unwrap().routing, "g1");
}

#[test]
fn grandchild_indexed_before_its_parent_stays_with_the_root() {
    let engine = engine_with(&[("grandparent", "parent"), ("parent", "child")], true, 16);
    for g in 0..8 {
        let gid = format!("g{g}");
        let pid = format!("p{g}");
        let cid = format!("c{g}");
        let grand = engine.index(&doc(&gid, "grandparent", None)).unwrap();

        let mut undeclared = doc(&cid, "child", Some(&pid));
        undeclared.routing = None;
        let err = engine.index(&undeclared).unwrap_err();
        assert!(matches!(
            err,
            JoinError::Routing(RoutingError::UnresolvedAncestor { ref ancestor, .. }) if *ancestor == pid
        ));

        let child = engine
            .index(&doc(&cid, "child", Some(&pid)).with_routing(gid.clone()))
            .unwrap();
        let parent = engine.index(&doc(&pid, "parent", Some(&gid))).unwrap();
        assert_eq!(child.routing, gid);
        assert_eq!(child.partition, grand.partition);
        assert_eq!(parent.partition, grand.partition);
    }
    assert_eq!(
        ids(
            &engine,
            JoinQuery::has_child("parent", JoinQuery::has_child("child", JoinQuery::match_all()))
        )
        .len(),
        8
    );
}

#[test]
fn redefinition_rebuilds_each_touched_partition_once() {
    let relations = [("question", "answer")];
    let engine = engine_with(&relations, false, 8);
    for q in 0..16 {
        let qid = format!("q{q}");
        engine.index(&doc(&qid, "question", None)).unwrap();
        engine
            .index(&doc(&format!("a{q}"), "answer", Some(&qid)))
            .unwrap();
    }
    let touched = (0..engine.partition_count())
        .filter(|p| {
            engine
                .partition_stats(parent_join::PartitionId(*p))
                .unwrap()
                .documents
                > 0
        })
        .count() as u64;

    let query = JoinQuery::has_child("answer", JoinQuery::match_all());
    assert_eq!(ids(&engine, query.clone()).len(), 16);
    let first = engine.cache_stats().builds;
    assert_eq!(first, touched);
    ids(&engine, query.clone());
    assert_eq!(engine.cache_stats().builds, first);

    let before = engine.schema().generation();
    engine
        .redefine(JoinFieldMapping::from_simplified(FIELD, false, &relations))
        .unwrap();
    assert!(engine.schema().generation() > before);
    assert!(engine.cache().is_empty());

    assert_eq!(ids(&engine, query.clone()).len(), 16);
    assert_eq!(engine.cache_stats().builds, first + touched);
    ids(&engine, query);
    assert_eq!(engine.cache_stats().builds, first + touched);
}

#[test]
fn batch_continues_past_rejected_documents() {
    let engine = engine_with(&[("question", "answer,comment")], true, 4);
    let requests = vec![
        doc("1", "question", None),
        doc("2", "answer", Some("1")).with_routing("7"),
        doc("3", "answer", Some("1")),
        IndexRequest::new("4", json!({FIELD: {"name": "answer"}})),
        IndexRequest::new("5", json!({FIELD: "unknown"})),
        IndexRequest::new("6", json!({"title": "no join field"})),
        doc("7", "comment", Some("1")),
    ];
    let outcomes = engine.index_batch(&requests);
    let accepted: Vec<&str> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().ok().map(|o| o.id.as_str()))
        .collect();
    assert_eq!(accepted, vec!["1", "3", "7"]);
    assert!(matches!(outcomes[1], Err(JoinError::Routing(RoutingError::Mismatch { .. }))));
    assert!(matches!(
        outcomes[3],
        Err(JoinError::Routing(RoutingError::MissingParent { .. }))
    ));
    assert!(matches!(outcomes[4], Err(JoinError::Schema(_))));
    assert!(matches!(outcomes[5], Err(JoinError::Document(_))));
    assert_eq!(
        ids(&engine, JoinQuery::has_parent("question", JoinQuery::match_all())),
        vec!["3", "7"]
    );
}

#[test]
fn non_join_roles_fail_before_any_partition_is_read() {
    let engine = engine_with(&[("question", "answer")], false, 4);
    engine.index(&doc("1", "question", None)).unwrap();
    let err = engine
        .search(&JoinQuery::has_child("question", JoinQuery::match_all()))
        .unwrap_err();
    assert!(matches!(
        err,
        JoinError::Query(QueryError::NotAJoinRole { query: "has_child", .. })
    ));
    let err = engine
        .search(&JoinQuery::has_parent("answer", JoinQuery::match_all()))
        .unwrap_err();
    assert!(matches!(err, JoinError::Query(QueryError::NotAJoinRole { .. })));
    let stats = engine.cache_stats();
    assert_eq!((stats.misses, stats.builds), (0, 0));
}

#[test]
fn term_and_bounds_filter_joins() {
    let engine = engine_with(&[("question", "answer")], true, 2);
    engine
        .index(&doc_with("1", "question", None, json!({"tag": "rust"})))
        .unwrap();
    engine
        .index(&doc_with("2", "question", None, json!({"tag": "go"})))
        .unwrap();
    for (id, parent, score) in [("a", "1", 5), ("b", "1", 1), ("c", "2", 5)] {
        engine
            .index(&doc_with(id, "answer", Some(parent), json!({"score": score})))
            .unwrap();
    }
    assert_eq!(
        ids(&engine, JoinQuery::has_child("answer", JoinQuery::term("score", 5))),
        vec!["1", "2"]
    );
    assert_eq!(
        ids(
            &engine,
            JoinQuery::has_child("answer", JoinQuery::match_all()).with_child_bounds(Some(2), None)
        ),
        vec!["1"]
    );
    assert_eq!(
        ids(&engine, JoinQuery::has_parent("question", JoinQuery::term("tag", "go"))),
        vec!["c"]
    );
}
