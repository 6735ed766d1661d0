//! Integration tests for file-backed sources: JSON, CSV, markdown and SQLite.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use livesource_rs::prelude::*;
use livesource_rs::source::markdown::content_id;
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn build(dir: &Path, name: &str, config: SourceConfig) -> Arc<dyn Source> {
    build_source(name, &config, &RuntimeOptions::default().base_dir(dir)).unwrap()
}

const TODO_DOC: &str = "# Plan\n\n## Todos\n\n- [ ] Buy milk <!-- id:milk -->\n- [x] Ship it\n\n## Later\n\n- someday\n";

fn markdown(dir: &TempDir, readonly: bool) -> Arc<dyn Source> {
    std::fs::write(dir.path().join("plan.md"), TODO_DOC).unwrap();
    let config = SourceConfig::builder(SourceKind::MarkdownFile)
        .path("plan.md")
        .anchor("#todos")
        .readonly(readonly)
        .build();
    build(dir.path(), "todos", config)
}

#[tokio::test]
async fn test_json_file_array_and_wrapper() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), r#"[{"id":1,"tags":["x"]},{"id":2}]"#).unwrap();
    std::fs::write(dir.path().join("b.json"), r#"{"data":[{"id":3}]}"#).unwrap();
    std::fs::write(dir.path().join("empty.json"), "  \n").unwrap();

    let a = build(dir.path(), "a", SourceConfig::builder(SourceKind::Json).path("a.json").build());
    let rows = a.fetch().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["tags"], json!(["x"]));
    assert!(a.is_readonly());

    let b = build(dir.path(), "b", SourceConfig::builder(SourceKind::Json).path("b.json").build());
    assert_eq!(b.fetch().await.unwrap()[0]["id"], 3);

    let empty = build(dir.path(), "e", SourceConfig::builder(SourceKind::Json).path("empty.json").build());
    assert!(empty.fetch().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_json_file_errors() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.json"), "{nope").unwrap();

    let bad = build(dir.path(), "bad", SourceConfig::builder(SourceKind::Json).path("bad.json").build());
    assert_eq!(bad.fetch().await.unwrap_err().kind(), ErrorKind::Parse);

    let missing = build(dir.path(), "missing", SourceConfig::builder(SourceKind::Json).path("nope.json").build());
    assert!(missing.fetch().await.unwrap_err().is_retryable());

    let err = build_source(
        "nopath",
        &SourceConfig::builder(SourceKind::Json).build(),
        &RuntimeOptions::default(),
    )
    .err()
    .unwrap();
    assert!(err.is_config());
}

#[tokio::test]
async fn test_csv_file_with_delimiter_and_quotes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("people.tsv"), "name\tnote\nAnn\t\"tab\tinside\"\nBob\t\n").unwrap();

    let config = SourceConfig::builder(SourceKind::Csv)
        .path("people.tsv")
        .delimiter("\t")
        .build();
    let rows = build(dir.path(), "people", config).fetch().await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["note"], "tab\tinside");
    assert_eq!(rows[1]["name"], "Bob");
    assert_eq!(rows[1]["note"], "");
}

#[tokio::test]
async fn test_markdown_reads_section() {
    let dir = tempfile::tempdir().unwrap();
    let source = markdown(&dir, true);

    let rows = source.fetch().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "milk");
    assert_eq!(rows[1]["id"], content_id("Ship it"));
    assert_eq!(rows[1]["done"], true);

    let err = source.write_item("toggle", &row(json!({"id": "milk"}))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[tokio::test]
async fn test_markdown_writes_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let source = markdown(&dir, false);
    source.fetch().await.unwrap();

    source.write_item("toggle", &row(json!({"id": "milk"}))).await.unwrap();
    source.write_item("add", &row(json!({"text": "Call Bo", "done": false}))).await.unwrap();

    let rows = source.fetch().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["done"], true);
    assert_eq!(rows[2]["text"], "Call Bo");

    let content = std::fs::read_to_string(dir.path().join("plan.md")).unwrap();
    assert!(content.contains("## Later\n\n- someday"));

    let err = source.write_item("delete", &row(json!({"id": "gone"}))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn test_markdown_external_change_diverts_write() {
    let dir = tempfile::tempdir().unwrap();
    let source = markdown(&dir, false);
    source.fetch().await.unwrap();

    let path = dir.path().join("plan.md");
    std::fs::write(&path, TODO_DOC.replace("Buy milk", "Buy bread")).unwrap();
    let later = SystemTime::now() + Duration::from_secs(5);
    filetime::set_file_mtime(&path, FileTime::from_system_time(later)).unwrap();

    let err = source.write_item("toggle", &row(json!({"id": "milk"}))).await.unwrap_err();
    assert!(err.to_string().contains("modified externally"), "{err}");

    // The edited file is untouched; the write landed in a conflict copy.
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("- [ ] Buy bread <!-- id:milk -->"));
    let conflicts: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("plan.conflict-") && name.ends_with(".md"))
        .collect();
    assert_eq!(conflicts.len(), 1, "{conflicts:?}");
    let copy = std::fs::read_to_string(dir.path().join(&conflicts[0])).unwrap();
    assert!(copy.contains("- [x] Buy bread <!-- id:milk -->"));
}

#[test]
fn test_markdown_requires_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let config = SourceConfig::builder(SourceKind::MarkdownFile).path("plan.md").build();
    let err = build_source("todos", &config, &RuntimeOptions::default().base_dir(dir.path()))
        .err()
        .unwrap();
    assert!(err.is_config());
}

#[tokio::test]
async fn test_sql_table_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = SourceConfig::builder(SourceKind::Sql)
        .connection("app.db")
        .table("tasks")
        .build();
    let source = build(dir.path(), "tasks", config);
    assert!(!source.is_readonly());
    assert!(source.fetch().await.unwrap().is_empty());

    source.write_item("add", &row(json!({"title": "first", "done": false}))).await.unwrap();
    source.write_item("add", &row(json!({"title": "second", "priority": 2}))).await.unwrap();

    let rows = source.fetch().await.unwrap();
    assert_eq!(rows.len(), 2);
    // Newest first.
    assert_eq!(rows[0]["title"], "second");
    assert!(rows[1]["priority"].is_null());

    let id = rows[1]["id"].clone();
    source.write_item("update", &row(json!({"id": id, "title": "first!"}))).await.unwrap();
    source.write_item("delete", &row(json!({"id": rows[0]["id"]}))).await.unwrap();

    let rows = source.fetch().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["title"], "first!");

    let err = source.write_item("update", &row(json!({"id": 999, "title": "x"}))).await.unwrap_err();
    assert!(err.to_string().contains("item not found"), "{err}");

    assert_ok!(source.close().await);
    assert_ok!(source.close().await);
    assert_err!(source.fetch().await);
}

#[tokio::test]
async fn test_sql_custom_query_is_readonly() {
    let dir = tempfile::tempdir().unwrap();
    seed_scores(dir.path()).await;

    let config = SourceConfig::builder(SourceKind::Sql)
        .connection("app.db")
        .query("SELECT name, score FROM scores WHERE score > 1 ORDER BY score")
        .build();
    let source = build(dir.path(), "scores", config);
    assert!(source.is_readonly());

    let rows = source.fetch().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "b");
    assert_eq!(rows[1]["score"], 3.5);

    let err = source.write_item("add", &row(json!({"name": "z"}))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_sql_rejects_injected_table_name() {
    let dir = tempfile::tempdir().unwrap();
    let config = SourceConfig::builder(SourceKind::Sql)
        .connection("app.db")
        .table("tasks; DROP TABLE users")
        .build();
    let err = build_source("tasks", &config, &RuntimeOptions::default().base_dir(dir.path()))
        .err()
        .unwrap();
    assert!(err.is_config());
}

/// Seed a `scores` table through a table source so the fixture uses the public API only.
async fn seed_scores(dir: &Path) {
    let config = SourceConfig::builder(SourceKind::Sql)
        .connection("app.db")
        .table("scores")
        .build();
    let seed = build(dir, "seed", config);
    for (name, score) in [("a", 1.0), ("b", 2.0), ("c", 3.5)] {
        seed.write_item("add", &row(json!({"name": name, "score": score})))
            .await
            .unwrap();
    }
    seed.close().await.unwrap();
}
