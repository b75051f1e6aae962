//! End-to-end scenarios against a file-backed SQLite store, driven
//! entirely through the public connection-string -> backend surface.

use memvault::config::ConnectionDescriptor;
use memvault::storage::{self, Backend, Storage};
use tempfile::TempDir;

async fn temp_backend() -> (TempDir, Backend) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/memory.db", dir.path().display());
    let descriptor = ConnectionDescriptor::parse(&url).unwrap();
    let backend = storage::connect(&descriptor).await.unwrap();
    (dir, backend)
}

fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn save_then_load_single_context() {
    let (_dir, backend) = temp_backend().await;

    backend
        .save_context("Hello", 7, Some("demo"), &tags(&["a", "b"]))
        .await
        .unwrap();

    let loaded = backend.load_contexts(Some("demo"), 10, 1, None).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].content, "Hello");
    assert_eq!(loaded[0].importance_level, 7);
    assert_eq!(loaded[0].tags, tags(&["a", "b"]));
}

#[tokio::test]
async fn tag_filter_returns_matching_in_save_order_desc() {
    let (_dir, backend) = temp_backend().await;

    let c1 = backend
        .save_context("c1", 9, Some("proj"), &tags(&["x", "y"]))
        .await
        .unwrap();
    let c2 = backend
        .save_context("c2", 5, Some("proj"), &tags(&["y", "z"]))
        .await
        .unwrap();
    backend
        .save_context("c3", 8, Some("proj"), &tags(&["z"]))
        .await
        .unwrap();

    let by_y = backend
        .load_contexts(Some("proj"), 10, 1, Some(&tags(&["y"])))
        .await
        .unwrap();
    let ids: Vec<&str> = by_y.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec![c2.as_str(), c1.as_str()]);
}

#[tokio::test]
async fn tag_queries_respect_project_isolation() {
    let (_dir, backend) = temp_backend().await;

    let c1 = backend
        .save_context("c1", 5, Some("A"), &tags(&["t"]))
        .await
        .unwrap();
    let c2 = backend
        .save_context("c2", 5, Some("B"), &tags(&["t"]))
        .await
        .unwrap();

    let scoped = backend
        .find_contexts_by_multiple_tags(&tags(&["t"]), Some("A"), 100)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].id, c1);

    let global = backend
        .find_contexts_by_multiple_tags(&tags(&["t"]), None, 100)
        .await
        .unwrap();
    let ids: Vec<&str> = global.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec![c2.as_str(), c1.as_str()]);
}

#[tokio::test]
async fn popular_tags_count_bulk_usage() {
    let (_dir, backend) = temp_backend().await;

    for i in 0..50 {
        backend
            .save_context(&format!("c{i}"), 5, Some("bulk"), &tags(&["common"]))
            .await
            .unwrap();
    }

    let popular = backend.get_popular_tags(10, 2, None).await.unwrap();
    let common = popular.iter().find(|t| t.tag == "common").unwrap();
    assert_eq!(common.count, 50);
}

#[tokio::test]
async fn forget_is_idempotent_and_final() {
    let (_dir, backend) = temp_backend().await;

    let id = backend
        .save_context("c", 5, Some("p"), &[])
        .await
        .unwrap();

    assert!(backend.forget_context(&id).await.unwrap());
    assert!(!backend.forget_context(&id).await.unwrap());
    assert!(backend.load_context(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn reopening_the_file_preserves_data() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/memory.db", dir.path().display());
    let descriptor = ConnectionDescriptor::parse(&url).unwrap();

    let id = {
        let backend = storage::connect(&descriptor).await.unwrap();
        let id = backend
            .save_context("durable", 6, Some("p"), &tags(&["keep"]))
            .await
            .unwrap();
        backend.close().await;
        id
    };

    let backend = storage::connect(&descriptor).await.unwrap();
    let loaded = backend.load_context(&id).await.unwrap().unwrap();
    assert_eq!(loaded.content, "durable");
    assert_eq!(loaded.tags, tags(&["keep"]));
}

#[tokio::test]
async fn stats_reflect_saved_data() {
    let (_dir, backend) = temp_backend().await;

    backend
        .save_context("a", 9, Some("p1"), &tags(&["t1"]))
        .await
        .unwrap();
    backend
        .save_context("b", 3, Some("p2"), &tags(&["t1", "t2"]))
        .await
        .unwrap();

    let stats = backend.get_storage_stats().await.unwrap();
    assert_eq!(stats.provider, "sqlite");
    assert_eq!(stats.active_contexts, 2);
    assert_eq!(stats.active_projects, 2);
    assert_eq!(stats.total_tags, 2);
    assert!(stats.size_bytes > 0);

    let patterns = backend.analyze_tag_patterns(10).await.unwrap();
    assert_eq!(patterns[0].tag, "t1");
    assert_eq!(patterns[0].usage_count, 2);
}

#[tokio::test]
async fn init_load_returns_smart_slab_with_instruction() {
    let (_dir, backend) = temp_backend().await;

    backend
        .save_context("critical fact", 9, Some("p"), &[])
        .await
        .unwrap();
    backend
        .save_context("recent note", 5, Some("p"), &[])
        .await
        .unwrap();
    backend
        .save_context("noise", 2, Some("p"), &[])
        .await
        .unwrap();

    let package = backend.load_init_contexts(Some("p"), 10).await.unwrap();
    let contents: Vec<&str> = package.contexts.iter().map(|c| c.content.as_str()).collect();
    assert!(contents.contains(&"critical fact"));
    assert!(contents.contains(&"recent note"));
    assert!(!contents.contains(&"noise"));
    assert_eq!(package.metadata.context_count, package.contexts.len());
    assert_eq!(package.metadata.project_id.as_deref(), Some("p"));
}

#[tokio::test]
async fn counts_are_project_scoped() {
    let (_dir, backend) = temp_backend().await;

    backend.save_context("a", 5, Some("p1"), &[]).await.unwrap();
    backend.save_context("b", 5, Some("p1"), &[]).await.unwrap();
    backend.save_context("c", 5, Some("p2"), &[]).await.unwrap();

    assert_eq!(backend.count_contexts(Some("p1")).await.unwrap(), 2);
    assert_eq!(backend.count_contexts(Some("p2")).await.unwrap(), 1);
    assert_eq!(backend.count_contexts(None).await.unwrap(), 3);

    let high = backend.load_high_importance_contexts(10).await.unwrap();
    assert!(high.is_empty());
    backend.save_context("vip", 9, Some("p1"), &[]).await.unwrap();
    let high = backend.load_high_importance_contexts(10).await.unwrap();
    assert_eq!(high.len(), 1);
    assert_eq!(high[0].content, "vip");
}

#[tokio::test]
async fn cleanup_unused_tags_after_deletes() {
    let (_dir, backend) = temp_backend().await;

    let keep = backend
        .save_context("keep", 5, None, &tags(&["kept"]))
        .await
        .unwrap();
    let gone = backend
        .save_context("gone", 5, None, &tags(&["orphan"]))
        .await
        .unwrap();

    backend.delete_context(&gone).await.unwrap();
    assert_eq!(backend.cleanup_unused_tags().await.unwrap(), 1);

    let remaining = backend.get_context_tags(&keep).await.unwrap();
    assert_eq!(remaining, tags(&["kept"]));
}
