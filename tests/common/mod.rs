//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use docgraph_sync::{
    db::{db_init, DbConnection, DOCGRAPH_DB},
    documents::DocumentStore,
    notify::{NotificationHub, DEFAULT_NOTIFICATION_CHANNEL},
    processor::{EventProcessor, PassStats, ProcessorOptions},
    tokenizer::Tokenizer,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A freshly migrated database in its own temp dir. Keep the struct alive for the duration of
/// the test.
#[allow(dead_code)]
pub struct TestDb {
    pub dir: TempDir,
    pub db: DbConnection,
    pub documents: DocumentStore,
}

#[allow(dead_code)]
pub async fn test_db() -> TestDb {
    init_logging();
    let dir = TempDir::new().unwrap();
    let db = DbConnection(db_init(dir.path().join(DOCGRAPH_DB)).await.unwrap());
    let documents = DocumentStore::new(
        db.clone(),
        NotificationHub::new(),
        DEFAULT_NOTIFICATION_CHANNEL,
    );
    TestDb { dir, db, documents }
}

#[allow(dead_code)]
pub fn processor(db: &DbConnection, strict: bool) -> EventProcessor {
    EventProcessor::new(
        db.clone(),
        Tokenizer::shared().unwrap(),
        ProcessorOptions {
            strict,
            ..Default::default()
        },
    )
}

/// Run one pass and return its stats, failing the test on contention.
#[allow(dead_code)]
pub async fn drain(processor: &EventProcessor) -> PassStats {
    *processor
        .process_pending()
        .await
        .unwrap()
        .stats()
        .expect("pass should not be contended")
}

/// An editor document whose text leaves are `texts`, one paragraph each, with an embedded node
/// reference that contributes no text.
#[allow(dead_code)]
pub fn editor_tree(texts: &[&str]) -> Value {
    let mut paragraphs: Vec<Value> = texts
        .iter()
        .map(|text| json!({"type": "paragraph", "content": [{"type": "text", "text": text}]}))
        .collect();
    paragraphs.push(json!({"type": "nodeEmbed", "attrs": {"id": "elsewhere", "text": "hidden"}}));
    json!({"type": "doc", "content": paragraphs})
}

/// A space document listing `(id, title)` pairs.
#[allow(dead_code)]
pub fn space_doc(nodes: &[(&str, &str)]) -> Value {
    let entries: serde_json::Map<String, Value> = nodes
        .iter()
        .map(|(id, title)| (id.to_string(), json!({"title": title})))
        .collect();
    json!({"nodes": entries, "deletedNodes": []})
}

/// A graph document listing child ids.
#[allow(dead_code)]
pub fn graph_doc(children: &[&str]) -> Value {
    let entries: serde_json::Map<String, Value> = children
        .iter()
        .map(|id| (id.to_string(), json!({})))
        .collect();
    json!({"nodes": entries, "edges": []})
}
