// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// Orchestrator behaviour against a scripted in-process pool

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tt_config::{Shell, TestConfig};
use tt_core::{
    build_tree, Outcome, SnapshotStatus, SnapshotStore, SuiteBuilder, SuiteTree, TestCase, TestFile, TestIndex,
    TestResult, TestStatus,
};
use tui_test::orchestrator::PASSED_WHEN_SHOULD_FAIL;
use tui_test::{
    AttemptRequest, Orchestrator, OrchestratorError, PoolError, Reporter, RunSettings, StaleSnapshotSummary,
    WorkerEvent, WorkerPool,
};

const FILE: &str = "tests/app.rs";

fn register(s: &mut SuiteBuilder<'_>) {
    for title in ["passes", "flips", "breaks", "hangs", "crashes", "silent", "snaps then hangs"] {
        s.test(title, |_| async { Ok(()) });
    }
    s.fail("fail passes", |_| async { Ok(()) });
    s.fail("fail errors", |_| async { Ok(()) });
    s.skip("skipped", |_| async { Ok(()) });
}

enum Script {
    Pass,
    Fail(&'static str),
    Hang(Duration),
    /// Reports a snapshot, then never finishes
    SnapshotThenHang,
    Crash,
    /// Completes without acknowledging the attempt first
    PassWithoutAck,
}

fn script(request: &AttemptRequest) -> Script {
    let title = request.test_id.0.rsplit(" › ").next().unwrap_or_default();
    match (title, request.attempt) {
        ("flips", 0) => Script::Fail("Error: not yet"),
        ("breaks", _) | ("fail errors", _) => Script::Fail("Error: broken"),
        ("hangs", _) => Script::Hang(Duration::from_secs(10)),
        ("crashes", _) => Script::Crash,
        ("silent", _) => Script::PassWithoutAck,
        ("snaps then hangs", _) => Script::SnapshotThenHang,
        _ => Script::Pass,
    }
}

#[derive(Default)]
struct FakePool {
    dispatched: Mutex<Vec<(String, u32)>>,
    terminated: AtomicBool,
}

#[async_trait]
impl WorkerPool for FakePool {
    fn size(&self) -> usize {
        2
    }

    async fn run(&self, request: AttemptRequest, events: mpsc::UnboundedSender<WorkerEvent>) -> Result<(), PoolError> {
        self.dispatched
            .lock()
            .unwrap()
            .push((request.test_id.0.clone(), request.attempt));
        let started = WorkerEvent::Started { start_time_ms: 0 };
        match script(&request) {
            Script::Pass => {
                events.send(started).unwrap();
                events.send(WorkerEvent::Stdout { chunk: "hi\n".into() }).unwrap();
                if request.test_id.0.ends_with("passes") {
                    events
                        .send(WorkerEvent::Snapshot {
                            name: "passes 1".into(),
                            status: SnapshotStatus::Passed,
                        })
                        .unwrap();
                }
                events.send(WorkerEvent::Completed).unwrap();
            }
            Script::Fail(error) => {
                events.send(started).unwrap();
                events
                    .send(WorkerEvent::Failed {
                        error: error.into(),
                        duration_ms: 7,
                    })
                    .unwrap();
            }
            Script::Hang(d) => {
                events.send(started).unwrap();
                tokio::time::sleep(d).await;
                events.send(WorkerEvent::Completed).unwrap();
            }
            Script::SnapshotThenHang => {
                events.send(started).unwrap();
                events
                    .send(WorkerEvent::Snapshot {
                        name: "snaps then hangs 1".into(),
                        status: SnapshotStatus::Written,
                    })
                    .unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
                events.send(WorkerEvent::Completed).unwrap();
            }
            Script::Crash => {
                events.send(started).unwrap();
                events.send(WorkerEvent::Stderr { chunk: "segfault\n".into() }).unwrap();
                return Err(PoolError::Crashed { status: Some(3) });
            }
            Script::PassWithoutAck => {
                events.send(WorkerEvent::Completed).unwrap();
            }
        }
        Ok(())
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingReporter {
    started: Mutex<HashMap<String, Vec<u32>>>,
    ended: Mutex<Vec<(String, u32, TestStatus)>>,
}

impl Reporter for RecordingReporter {
    fn start(&self, _test_count: usize, _shells: &[Shell], _workers: usize) {}

    fn start_test(&self, test: &TestCase, attempt: u32) {
        self.started
            .lock()
            .unwrap()
            .entry(test.title.clone())
            .or_default()
            .push(attempt);
    }

    fn end_test(&self, test: &TestCase, result: &TestResult, attempt: u32) {
        assert_eq!(test.results.last(), Some(result));
        self.ended
            .lock()
            .unwrap()
            .push((test.title.clone(), attempt, result.status));
    }

    fn end(&self, tree: &SuiteTree, _stale: StaleSnapshotSummary) -> usize {
        tree.tests()
            .filter(|(_, t)| t.outcome() == Outcome::Unexpected)
            .count()
    }
}

fn settings(root: PathBuf) -> RunSettings {
    RunSettings {
        retries: 0,
        timeout: Some(Duration::from_secs(5)),
        global_timeout: None,
        update_snapshots: false,
        trace: false,
        trace_folder: PathBuf::from("tui-traces"),
        expect_timeout: Duration::from_secs(5),
        snapshot_root: root,
    }
}

struct Harness {
    tree: SuiteTree,
    pool: Arc<FakePool>,
    reporter: Arc<RecordingReporter>,
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let files = [TestFile { path: FILE, register }];
        let (tree, _) = build_tree(&TestConfig::default(), &files).unwrap();
        let dir = tempfile::tempdir().unwrap();
        Self {
            tree,
            pool: Arc::new(FakePool::default()),
            reporter: Arc::new(RecordingReporter::default()),
            root: dir.path().to_path_buf(),
            _dir: dir,
        }
    }

    fn pick(&self, titles: &[&str]) -> Vec<TestIndex> {
        self.tree
            .tests()
            .filter(|(_, t)| titles.contains(&t.title.as_str()))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn case(&self, title: &str) -> &TestCase {
        self.tree
            .tests()
            .map(|(_, t)| t)
            .find(|t| t.title == title)
            .unwrap()
    }

    async fn run(&mut self, titles: &[&str], settings: RunSettings) -> Result<tui_test::RunReport, OrchestratorError> {
        let selected = self.pick(titles);
        let orchestrator = Orchestrator::new(self.pool.clone(), self.reporter.clone(), settings);
        orchestrator.run(&mut self.tree, &selected).await
    }
}

#[tokio::test]
async fn retries_turn_a_late_pass_into_flaky() {
    let mut h = Harness::new();
    let mut s = settings(h.root.clone());
    s.retries = 2;
    let report = h.run(&["flips", "passes"], s).await.unwrap();

    assert_eq!(report.failures, 0);
    let flips = h.case("flips");
    assert_eq!(flips.outcome(), Outcome::Flaky);
    assert_eq!(flips.results.len(), 2);
    assert_eq!(flips.results[0].error.as_deref(), Some("Error: not yet"));
    assert_eq!(flips.results[0].duration_ms, 7);

    let passes = h.case("passes");
    assert_eq!(passes.outcome(), Outcome::Expected);
    assert_eq!(passes.results.len(), 1);
    assert_eq!(passes.results[0].stdout.as_deref(), Some("hi\n"));
    assert!(h.pool.terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn a_failing_attempt_without_retries_is_unexpected() {
    let mut h = Harness::new();
    let report = h.run(&["breaks"], settings(h.root.clone())).await.unwrap();
    assert_eq!(report.failures, 1);
    let breaks = h.case("breaks");
    assert_eq!(breaks.outcome(), Outcome::Unexpected);
    assert_eq!(breaks.results.len(), 1);
    assert_eq!(h.pool.dispatched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn retries_stop_once_a_failing_test_keeps_failing() {
    let mut h = Harness::new();
    let mut s = settings(h.root.clone());
    s.retries = 2;
    h.run(&["breaks"], s).await.unwrap();
    let breaks = h.case("breaks");
    assert_eq!(breaks.results.len(), 3);
    assert_eq!(breaks.outcome(), Outcome::Unexpected);
    let ended = h.reporter.ended.lock().unwrap();
    let attempts: Vec<u32> = ended.iter().map(|(_, attempt, _)| *attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
}

#[tokio::test]
async fn fail_tests_invert_the_body_result() {
    let mut h = Harness::new();
    let report = h.run(&["fail passes", "fail errors"], settings(h.root.clone())).await.unwrap();
    assert_eq!(report.failures, 1);

    let passes = h.case("fail passes");
    assert_eq!(passes.outcome(), Outcome::Unexpected);
    assert_eq!(passes.results[0].status, TestStatus::Expected);
    assert_eq!(passes.results[0].error.as_deref(), Some(PASSED_WHEN_SHOULD_FAIL));

    let errors = h.case("fail errors");
    assert_eq!(errors.outcome(), Outcome::Expected);
    assert_eq!(errors.results[0].status, TestStatus::Unexpected);
}

#[tokio::test]
async fn attempts_are_killed_at_the_test_timeout() {
    let mut h = Harness::new();
    let mut s = settings(h.root.clone());
    s.timeout = Some(Duration::from_millis(100));
    let begun = Instant::now();
    h.run(&["hangs"], s).await.unwrap();
    assert!(begun.elapsed() < Duration::from_secs(5));

    let hangs = h.case("hangs");
    assert_eq!(hangs.outcome(), Outcome::Unexpected);
    assert_eq!(
        hangs.results[0].error.as_deref(),
        Some("Error: worker was terminated as the timeout (100 ms) was exceeded")
    );
}

#[tokio::test]
async fn global_timeout_aborts_the_run() {
    let mut h = Harness::new();
    let mut s = settings(h.root.clone());
    s.timeout = None;
    s.global_timeout = Some(Duration::from_millis(100));
    let begun = Instant::now();
    let err = h.run(&["hangs", "passes"], s).await.unwrap_err();
    assert!(begun.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, OrchestratorError::GlobalTimeout { ms: 100 }));
    assert_eq!(err.to_string(), "Error: global timeout (100 ms) exceeded");
    assert!(h.pool.terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn skipped_tests_are_never_dispatched() {
    let mut h = Harness::new();
    h.run(&["skipped"], settings(h.root.clone())).await.unwrap();
    assert!(h.pool.dispatched.lock().unwrap().is_empty());

    let skipped = h.case("skipped");
    assert_eq!(skipped.outcome(), Outcome::Skipped);
    assert_eq!(skipped.results, vec![TestResult::skipped()]);
    assert_eq!(h.reporter.started.lock().unwrap().get("skipped"), Some(&vec![0]));
}

#[tokio::test]
async fn crashes_become_attempt_errors() {
    let mut h = Harness::new();
    h.run(&["crashes"], settings(h.root.clone())).await.unwrap();
    let crashes = h.case("crashes");
    assert_eq!(crashes.outcome(), Outcome::Unexpected);
    assert_eq!(
        crashes.results[0].error.as_deref(),
        Some("Error: worker process exited before the attempt finished (exit code 3)")
    );
    assert_eq!(crashes.results[0].stderr.as_deref(), Some("segfault\n"));
}

#[tokio::test]
async fn start_test_fires_once_per_attempt() {
    let mut h = Harness::new();
    let mut s = settings(h.root.clone());
    s.retries = 1;
    h.run(&["silent", "flips", "passes"], s).await.unwrap();

    let started = h.reporter.started.lock().unwrap();
    assert_eq!(started.get("silent"), Some(&vec![0]));
    assert_eq!(started.get("flips"), Some(&vec![0, 1]));
    assert_eq!(started.get("passes"), Some(&vec![0]));
    assert_eq!(h.case("silent").outcome(), Outcome::Expected);
}

#[tokio::test]
async fn unused_snapshots_are_reported_then_removed() {
    let mut h = Harness::new();
    let seed = SnapshotStore::new(h.root.clone(), false);
    seed.compare_or_write(FILE, "passes 1", "screen").await.unwrap();
    seed.compare_or_write(FILE, "leftover", "old").await.unwrap();

    let report = h.run(&["passes"], settings(h.root.clone())).await.unwrap();
    assert_eq!(report.stale, StaleSnapshotSummary { obsolete: 1, removed: 0 });

    let mut h2 = Harness::new();
    let root = h.root.clone();
    let mut s = settings(root.clone());
    s.update_snapshots = true;
    let report = h2.run(&["passes"], s).await.unwrap();
    assert_eq!(report.stale, StaleSnapshotSummary { obsolete: 0, removed: 1 });

    let doc = SnapshotStore::new(root, false).document(FILE).await.unwrap();
    assert_eq!(doc.names().collect::<Vec<_>>(), vec!["passes 1"]);
}

#[tokio::test]
async fn snapshots_of_a_timed_out_attempt_are_kept() {
    let mut h = Harness::new();
    let seed = SnapshotStore::new(h.root.clone(), false);
    seed.compare_or_write(FILE, "snaps then hangs 1", "screen").await.unwrap();
    seed.compare_or_write(FILE, "leftover", "old").await.unwrap();

    let mut s = settings(h.root.clone());
    s.timeout = Some(Duration::from_millis(100));
    s.update_snapshots = true;
    let report = h.run(&["snaps then hangs"], s).await.unwrap();
    assert_eq!(report.stale, StaleSnapshotSummary { obsolete: 0, removed: 1 });

    let case = h.case("snaps then hangs");
    assert_eq!(case.outcome(), Outcome::Unexpected);
    let names: Vec<&str> = case.snapshots().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["snaps then hangs 1"]);

    let doc = SnapshotStore::new(h.root.clone(), false).document(FILE).await.unwrap();
    assert_eq!(doc.names().collect::<Vec<_>>(), vec!["snaps then hangs 1"]);
}
