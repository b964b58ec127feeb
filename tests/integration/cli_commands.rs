#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const MAPPING: &str = r#"{
  "properties": {
    "title": {"type": "text"},
    "qa": {
      "type": "join",
      "relations": {"question": ["answer", "comment"], "answer": "vote"}
    }
  }
}"#;

const DOCS: &str = r#"{"id": "1", "source": {"title": "why", "qa": "question"}}
{"id": "10", "routing": "1", "source": {"qa": {"name": "answer", "parent": "1"}, "score": 3}}
{"id": "11", "routing": "1", "source": {"qa": {"name": "comment", "parent": "1"}}}
{"id": "20", "routing": "1", "source": {"qa": {"name": "vote", "parent": "10"}}}

{"id": "30", "routing": "999", "source": {"qa": {"name": "answer", "parent": "999"}}}
"#;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

fn fixtures() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let mapping = write(dir.path(), "mapping.json", MAPPING);
    let docs = write(dir.path(), "docs.jsonl", DOCS);
    (dir, mapping, docs)
}

fn stdout_json(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("parent-join")
        .env_remove("PARENT_JOIN_CONFIG")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn mapping_reports_relation_graph() {
    let (_dir, mapping, _) = fixtures();
    let json = stdout_json(&["--format", "json", "mapping", mapping.to_str().unwrap()]);
    assert_eq!(json["field"], "qa");
    assert_eq!(json["eager_global_ordinals"], true);
    let roles = json["roles"].as_array().expect("roles");
    let vote = roles
        .iter()
        .find(|role| role["role"] == "vote")
        .expect("vote role");
    assert_eq!(vote["parent"], "answer");
    assert_eq!(vote["depth"], 2);
    let question = roles
        .iter()
        .find(|role| role["role"] == "question")
        .expect("question role");
    assert_eq!(question["children"], serde_json::json!(["answer", "comment"]));
}

#[test]
fn mapping_rejects_cycles() {
    let dir = TempDir::new().expect("tempdir");
    let mapping = write(
        dir.path(),
        "cycle.json",
        r#"{"properties": {"j": {"type": "join", "relations": {"a": "b", "b": "a"}}}}"#,
    );
    let output = cargo_bin_cmd!("parent-join")
        .args(["mapping"])
        .arg(&mapping)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("cycle"), "stderr: {stderr}");
}

#[test]
fn route_colocates_chains_and_flags_mismatches() {
    let (dir, mapping, docs) = fixtures();
    let json = stdout_json(&[
        "--format",
        "json",
        "route",
        "--mapping",
        mapping.to_str().unwrap(),
        "--docs",
        docs.to_str().unwrap(),
    ]);
    let routes = json.as_array().expect("routes");
    assert_eq!(routes.len(), 5);
    let root_partition = &routes[0]["partition"];
    for route in &routes[1..4] {
        assert_eq!(&route["partition"], root_partition);
        assert_eq!(route["routing"], "1");
    }
    assert_eq!(routes[4]["routing"], "999");

    let bad = write(
        dir.path(),
        "bad.jsonl",
        r#"{"id": "1", "source": {"qa": "question"}}
{"id": "2", "routing": "2", "source": {"qa": {"name": "answer", "parent": "1"}}}
"#,
    );
    let output = cargo_bin_cmd!("parent-join")
        .env_remove("PARENT_JOIN_CONFIG")
        .args(["route", "--mapping"])
        .arg(&mapping)
        .arg("--docs")
        .arg(&bad)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8_lossy(&output);
    assert!(stdout.contains("2 rejected"), "stdout: {stdout}");
}

#[test]
fn search_runs_join_queries() {
    let (_dir, mapping, docs) = fixtures();
    let run = |query: &str| {
        let json = stdout_json(&[
            "--format",
            "json",
            "search",
            "--mapping",
            mapping.to_str().unwrap(),
            "--docs",
            docs.to_str().unwrap(),
            "--query",
            query,
        ]);
        let mut ids: Vec<String> = json
            .as_array()
            .expect("hits")
            .iter()
            .map(|hit| hit["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(
        run(r#"{"has_child": {"type": "answer", "query": {"term": {"field": "score", "value": 3}}}}"#),
        vec!["1"]
    );
    assert_eq!(
        run(r#"{"has_parent": {"parent_type": "question", "query": {"match_all": {}}}}"#),
        vec!["10", "11"]
    );
    assert_eq!(run(r#"{"parent_id": {"type": "answer", "id": "999"}}"#), vec!["30"]);
    assert_eq!(
        run(r#"{"has_child": {"type": "answer", "query": {"has_child": {"type": "vote", "query": {"match_all": {}}}}}}"#),
        vec!["1"]
    );
}

#[test]
fn search_rejects_non_join_roles() {
    let (_dir, mapping, docs) = fixtures();
    let output = cargo_bin_cmd!("parent-join")
        .env_remove("PARENT_JOIN_CONFIG")
        .args(["search", "--mapping"])
        .arg(&mapping)
        .arg("--docs")
        .arg(&docs)
        .args(["--query", r#"{"has_child": {"type": "question", "query": {"match_all": {}}}}"#])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("not a join role"), "stderr: {stderr}");
}

#[test]
fn config_file_must_match_mapping_field() {
    let (dir, mapping, docs) = fixtures();
    let config = write(dir.path(), "join.toml", "partitions = 2\njoin_field = \"qa\"\n");
    cargo_bin_cmd!("parent-join")
        .env("PARENT_JOIN_CONFIG", &config)
        .args(["route", "--mapping"])
        .arg(&mapping)
        .arg("--docs")
        .arg(&docs)
        .assert()
        .success();

    let other = write(dir.path(), "other.toml", "join_field = \"relation\"\n");
    cargo_bin_cmd!("parent-join")
        .args(["--config"])
        .arg(&other)
        .args(["route", "--mapping"])
        .arg(&mapping)
        .arg("--docs")
        .arg(&docs)
        .assert()
        .failure();
}
