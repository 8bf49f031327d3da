//! Shared setup for the end-to-end transfer tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openem_ingestor::config::SymlinkPolicy;
use openem_ingestor::core::collect_file_list;
use openem_ingestor::testing::{MockCatalog, Notification, RecordingNotifier};
use openem_ingestor::{Orchestrator, QueueOptions, TaskQueue, TransferMethod, TransferObjects};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const PID: &str = "20.500.11935/e2e";

pub fn catalog() -> Arc<MockCatalog> {
    Arc::new(MockCatalog::new("alice", &["p1234"], PID))
}

pub fn metadata() -> Map<String, Value> {
    json!({ "type": "raw", "ownerGroup": "p1234", "datasetName": "e2e" })
        .as_object()
        .unwrap()
        .clone()
}

/// Dataset folder holding `files` as `(relative path, size)`
pub fn dataset(files: &[(&str, usize)], with_metadata_file: bool) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, size) in files {
        let path = dir.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
        std::fs::write(path, body).unwrap();
    }
    if with_metadata_file {
        std::fs::write(
            dir.path().join("metadata.json"),
            Value::Object(metadata()).to_string(),
        )
        .unwrap();
    }
    dir
}

pub fn start(orchestrator: Orchestrator, notifier: Arc<RecordingNotifier>) -> Arc<TaskQueue> {
    openem_ingestor::logging::init_test_logging();
    TaskQueue::start(QueueOptions::default(), Arc::new(orchestrator), notifier)
}

/// Add and schedule a task for `folder`
pub async fn submit(
    queue: &TaskQueue,
    folder: &Path,
    method: TransferMethod,
    objects: TransferObjects,
) -> Uuid {
    let files = collect_file_list(folder, SymlinkPolicy::default()).unwrap();
    let id = Uuid::new_v4();
    queue
        .add(id, folder.to_path_buf(), files, method, objects)
        .unwrap();
    queue.schedule(id).await.unwrap();
    id
}

/// Wait for the terminal notification of `id`, then check no second one follows
pub async fn terminal(notifier: &RecordingNotifier, id: Uuid) -> Notification {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let terminal = notifier.terminal(id);
        if !terminal.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let terminal = notifier.terminal(id);
            assert_eq!(terminal.len(), 1, "more than one terminal event: {:?}", terminal);
            return terminal[0].clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} never terminated",
            id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn progress_of(notifier: &RecordingNotifier, id: Uuid) -> Vec<u8> {
    notifier
        .events()
        .into_iter()
        .filter_map(|n| match n {
            Notification::Progress(task, p) if task == id => Some(p),
            _ => None,
        })
        .collect()
}
