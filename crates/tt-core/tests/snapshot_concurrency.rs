// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// Independent stores stand in for separate worker processes: each has its own
// cache and only the document lock coordinates them.

use std::collections::HashSet;
use std::sync::Arc;
use tt_core::snapshot::format::SnapshotDocument;
use tt_core::{SnapshotStatus, SnapshotStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_keep_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let root = Arc::new(dir.path().to_path_buf());

    let mut handles = Vec::new();
    for i in 0..4 {
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            let store = SnapshotStore::new(root.as_path(), false);
            store
                .compare_or_write("tests/shared.rs", &format!("writer {i}"), &format!("content {i}"))
                .await
        }));
    }
    for handle in handles {
        let cmp = handle.await.unwrap().unwrap();
        assert_eq!(cmp.status, SnapshotStatus::Written);
    }

    let text = std::fs::read_to_string(dir.path().join("tests/__snapshots__/shared.rs.snap")).unwrap();
    let doc = SnapshotDocument::parse(&text).unwrap();
    let names: Vec<&str> = doc.names().collect();
    assert_eq!(names, vec!["writer 0", "writer 1", "writer 2", "writer 3"]);
    assert_eq!(doc.get("writer 2"), Some("content 2"));
    assert!(!dir.path().join("tests/__snapshots__/shared.rs.snap.lock").exists());
}

#[tokio::test]
async fn non_update_runs_never_touch_documents() {
    let dir = tempfile::tempdir().unwrap();
    let seed = SnapshotStore::new(dir.path(), false);
    seed.compare_or_write("a.rs", "one 1", "stable").await.unwrap();
    seed.compare_or_write("a.rs", "leftover", "old").await.unwrap();
    let path = dir.path().join("__snapshots__/a.rs.snap");
    let before = std::fs::read_to_string(&path).unwrap();

    for _ in 0..2 {
        let store = SnapshotStore::new(dir.path(), false);
        let cmp = store.compare_or_write("a.rs", "one 1", "stable\n").await.unwrap();
        assert_eq!(cmp.status, SnapshotStatus::Passed);
        let cmp = store.compare_or_write("a.rs", "one 1", "drifted").await.unwrap();
        assert_eq!(cmp.status, SnapshotStatus::Failed);
        let report = store
            .reconcile("a.rs", &HashSet::from(["one 1".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.obsolete, 1);
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}
