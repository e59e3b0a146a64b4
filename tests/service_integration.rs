//! Integration tests for SyncService (listener wake-ups, background passes, lifecycle).

mod common;

use common::{editor_tree, init_logging};
use docgraph_sync::{
    config::{ProcessorConfig, SyncConfig},
    properties::DocumentType,
    service::SyncService,
};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_config(temp_dir: &TempDir) -> SyncConfig {
    SyncConfig {
        database_path: temp_dir.path().join("service.db"),
        processor: ProcessorConfig {
            // Long enough that only notifications can explain a prompt pass.
            poll_interval_secs: 3600,
            pass_timeout_secs: 30,
        },
        ..Default::default()
    }
}

/// Poll `check` on the service runtime until it holds or `limit` passes.
fn wait_for<F, Fut>(service: &SyncService, limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < limit {
        if service.block_on(check()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_service_processes_notified_writes() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = SyncService::new(test_config(&temp_dir)).unwrap();
    service.start().unwrap();
    assert!(service.is_running());

    let documents = service.documents();
    service
        .block_on(documents.upsert(
            "n1",
            DocumentType::Editor,
            b"",
            Some(&editor_tree(&["Hello", "World"])),
        ))
        .unwrap();

    let db = service.db_connection();
    let processed = wait_for(&service, Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            matches!(db.get_node("n1").await, Ok(Some(node)) if node.text == "Hello World")
        }
    });
    assert!(processed, "notification should trigger a processing pass");
    assert_eq!(service.block_on(db.pending_event_count()).unwrap(), 0);

    service.shutdown();
    assert!(!service.is_running());
}

#[test]
fn test_service_drains_backlog_on_start() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = SyncService::new(test_config(&temp_dir)).unwrap();

    // Written before any worker runs, so no listener sees the notification.
    let documents = service.documents();
    service
        .block_on(documents.upsert(
            "n1",
            DocumentType::Editor,
            b"",
            Some(&editor_tree(&["backlog"])),
        ))
        .unwrap();
    let db = service.db_connection();
    assert_eq!(service.block_on(db.pending_event_count()).unwrap(), 1);

    service.start().unwrap();
    let drained = wait_for(&service, Duration::from_secs(10), || {
        let db = db.clone();
        async move { matches!(db.pending_event_count().await, Ok(0)) }
    });
    assert!(drained);
    // The initial snapshot tick versions the document as well.
    let versioned = wait_for(&service, Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            matches!(db.document_versions("n1", DocumentType::Editor).await, Ok(v) if v.len() == 1)
        }
    });
    assert!(versioned);
}

#[test]
fn test_service_rejects_double_start() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = SyncService::new(test_config(&temp_dir)).unwrap();
    service.start().unwrap();
    assert!(service.start().is_err());
    service.shutdown();
    service.start().unwrap();
}

#[test]
fn test_service_rejects_unknown_tokenizer_model() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let config = SyncConfig {
        tokenizer_model: "not-a-model".to_string(),
        ..test_config(&temp_dir)
    };
    assert!(SyncService::new(config).is_err());
}
