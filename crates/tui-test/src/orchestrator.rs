// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Run orchestration
//!
//! Every selected test becomes one task on a [`JoinSet`]. A task runs the
//! attempts of its test one after another through the [`WorkerPool`],
//! applying the per-attempt timeout and the retry policy, and returns the
//! attempt results. The suite tree is only touched again once tasks finish.

use crate::pool::{PoolError, WorkerPool};
use crate::protocol::{AttemptRequest, SuiteSpec, WorkerEvent};
use crate::reporter::{Reporter, StaleSnapshotSummary};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tt_config::{Shell, TestConfig};
use tt_core::{
    ExpectedStatus, SnapshotRecord, SnapshotStore, SuiteKind, SuiteTree, TestCase, TestIndex, TestResult,
    TestStatus,
};

pub const PASSED_WHEN_SHOULD_FAIL: &str = "Error: test passed when it should fail";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Error: global timeout ({ms} ms) exceeded")]
    GlobalTimeout { ms: u128 },
}

/// Run-wide knobs taken from the configuration and the command line
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub retries: u32,
    pub timeout: Option<Duration>,
    pub global_timeout: Option<Duration>,
    pub update_snapshots: bool,
    pub trace: bool,
    pub trace_folder: PathBuf,
    pub expect_timeout: Duration,
    /// Directory snapshot documents are resolved against
    pub snapshot_root: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &TestConfig, update_snapshots: bool, trace: bool, snapshot_root: PathBuf) -> Self {
        Self {
            retries: config.retries,
            timeout: config.timeout(),
            global_timeout: config.global_timeout(),
            update_snapshots,
            trace: trace || config.trace,
            trace_folder: config.trace_folder.clone(),
            expect_timeout: config.expect_timeout(),
            snapshot_root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Tests whose outcome is unexpected, as counted by the reporter
    pub failures: usize,
    pub stale: StaleSnapshotSummary,
}

/// Everything a test task needs to run attempts
struct Job {
    idx: TestIndex,
    case: TestCase,
    chain: Vec<SuiteSpec>,
    source_file: String,
}

struct Shared {
    pool: Arc<dyn WorkerPool>,
    /// Bounds dispatched attempts so the per-attempt timeout excludes queueing
    slots: Semaphore,
    reporter: Arc<dyn Reporter>,
    settings: RunSettings,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

/// What arrived from the worker during one attempt
#[derive(Default)]
struct AttemptLog {
    started: Option<Instant>,
    stdout: String,
    stderr: String,
    snapshots: Vec<SnapshotRecord>,
    terminal: Option<WorkerEvent>,
}

impl AttemptLog {
    fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or_default()
    }

    fn into_result(self, status: TestStatus, error: Option<String>, duration_ms: u64) -> TestResult {
        TestResult {
            status,
            error,
            duration_ms,
            stdout: (!self.stdout.is_empty()).then_some(self.stdout),
            stderr: (!self.stderr.is_empty()).then_some(self.stderr),
            snapshots: self.snapshots,
        }
    }
}

impl Orchestrator {
    pub fn new(pool: Arc<dyn WorkerPool>, reporter: Arc<dyn Reporter>, settings: RunSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Semaphore::new(pool.size().max(1)),
                pool,
                reporter,
                settings,
            }),
        }
    }

    /// Run `selected` to completion, record their results into `tree`,
    /// reconcile snapshots and let the reporter summarize.
    pub async fn run(&self, tree: &mut SuiteTree, selected: &[TestIndex]) -> Result<RunReport, OrchestratorError> {
        let shared = &self.shared;
        let wanted: HashSet<TestIndex> = selected.iter().copied().collect();
        let order: Vec<TestIndex> = tree.bfs_tests().into_iter().filter(|idx| wanted.contains(idx)).collect();

        shared.reporter.start(order.len(), &shells_of(tree, &order), shared.pool.size());
        info!(tests = order.len(), workers = shared.pool.size(), "Starting run");

        let mut tasks: JoinSet<(TestIndex, Vec<TestResult>)> = JoinSet::new();
        for job in order.iter().map(|idx| job_for(tree, *idx)) {
            let shared = shared.clone();
            tasks.spawn(async move { shared.run_test(job).await });
        }

        let mut finished = Vec::with_capacity(order.len());
        let collect = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(done) => finished.push(done),
                    Err(e) => error!(error = %e, "Test task failed"),
                }
            }
        };
        match shared.settings.global_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, collect).await.is_err() {
                    let err = OrchestratorError::GlobalTimeout { ms: limit.as_millis() };
                    error!("{err}");
                    tasks.abort_all();
                    shared.pool.terminate().await;
                    return Err(err);
                }
            }
            None => collect.await,
        }

        shared.pool.terminate().await;
        for (idx, results) in finished {
            tree.test_mut(idx).results = results;
        }

        let stale = shared.reconcile(tree, &order).await;
        let failures = shared.reporter.end(tree, stale);
        Ok(RunReport { failures, stale })
    }
}

impl Shared {
    async fn run_test(&self, mut job: Job) -> (TestIndex, Vec<TestResult>) {
        let expected = job.case.expected_status;
        if expected == ExpectedStatus::Skipped {
            self.reporter.start_test(&job.case, 0);
            job.case.results.push(TestResult::skipped());
            if let Some(result) = job.case.results.last() {
                self.reporter.end_test(&job.case, result, 0);
            }
            return (job.idx, job.case.results);
        }

        for attempt in 0..=self.settings.retries {
            let result = self.run_attempt(&job, attempt).await;
            let status = result.status;
            job.case.results.push(result);
            if let Some(result) = job.case.results.last() {
                self.reporter.end_test(&job.case, result, attempt);
            }
            if status == TestStatus::Skipped || status.matches(expected) {
                break;
            }
            debug!(test = %job.case.id, attempt, ?status, "Attempt did not match expectation");
        }
        (job.idx, job.case.results)
    }

    async fn run_attempt(&self, job: &Job, attempt: u32) -> TestResult {
        let request = AttemptRequest {
            test_id: job.case.id.clone(),
            suite_chain: job.chain.clone(),
            source_file: job.source_file.clone(),
            update_snapshots: self.settings.update_snapshots,
            attempt,
            trace: self.settings.trace,
            trace_folder: self.settings.trace_folder.clone(),
            expect_timeout_ms: self.settings.expect_timeout.as_millis() as u64,
        };

        let Ok(_slot) = self.slots.acquire().await else {
            return TestResult::failed(attempt_error(&PoolError::Terminated), 0);
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut log = AttemptLog::default();
        let case = &job.case;
        let run = self.pool.run(request, tx);
        let collect = async {
            while let Some(event) = rx.recv().await {
                match event {
                    WorkerEvent::Started { start_time_ms } => {
                        if log.started.is_none() {
                            debug!(test = %case.id, attempt, start_time_ms, "Attempt started");
                            log.started = Some(Instant::now());
                            self.reporter.start_test(case, attempt);
                        }
                    }
                    WorkerEvent::Stdout { chunk } => log.stdout.push_str(&chunk),
                    WorkerEvent::Stderr { chunk } => log.stderr.push_str(&chunk),
                    WorkerEvent::Snapshot { name, status } => log.snapshots.push(SnapshotRecord { name, status }),
                    terminal @ (WorkerEvent::Completed | WorkerEvent::Failed { .. }) => {
                        log.terminal = Some(terminal);
                    }
                }
            }
        };
        let both = async { tokio::join!(run, collect).0 };
        let outcome = match self.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, both).await.map_err(|_| limit),
            None => Ok(both.await),
        };

        if log.started.is_none() {
            self.reporter.start_test(case, attempt);
        }
        let elapsed = log.elapsed_ms();
        match outcome {
            Err(limit) => {
                warn!(test = %case.id, attempt, "Attempt timed out");
                let error = format!(
                    "Error: worker was terminated as the timeout ({} ms) was exceeded",
                    limit.as_millis()
                );
                log.into_result(TestStatus::Unexpected, Some(error), elapsed)
            }
            Ok(pooled) => match log.terminal.take() {
                Some(WorkerEvent::Completed) => {
                    let error = (case.expected_status == ExpectedStatus::Unexpected)
                        .then(|| PASSED_WHEN_SHOULD_FAIL.to_string());
                    log.into_result(TestStatus::Expected, error, elapsed)
                }
                Some(WorkerEvent::Failed { error, duration_ms }) => {
                    log.into_result(TestStatus::Unexpected, Some(error), duration_ms)
                }
                _ => {
                    let error = match pooled {
                        Err(e) => attempt_error(&e),
                        Ok(()) => "Error: worker finished without reporting a result".to_string(),
                    };
                    warn!(test = %case.id, attempt, %error, "Attempt ended abnormally");
                    log.into_result(TestStatus::Unexpected, Some(error), elapsed)
                }
            },
        }
    }

    /// Count, and in update mode delete, snapshot entries the last attempt
    /// of each selected test did not produce.
    async fn reconcile(&self, tree: &SuiteTree, selected: &[TestIndex]) -> StaleSnapshotSummary {
        let mut per_file: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        for &idx in selected {
            let Some(file) = tree.file_path(idx) else {
                continue;
            };
            per_file
                .entry(file.to_string())
                .or_default()
                .extend(tree.test(idx).snapshots().iter().map(|s| s.name.clone()));
        }

        let store = SnapshotStore::new(&self.settings.snapshot_root, self.settings.update_snapshots);
        let mut stale = StaleSnapshotSummary::default();
        for (file, retained) in per_file {
            match store.reconcile(&file, &retained).await {
                Ok(report) => {
                    stale.obsolete += report.obsolete;
                    stale.removed += report.removed;
                }
                Err(e) => warn!(%file, error = %e, "Failed to reconcile snapshots"),
            }
        }
        stale
    }
}

fn attempt_error(e: &PoolError) -> String {
    format!("Error: {e}")
}

fn job_for(tree: &SuiteTree, idx: TestIndex) -> Job {
    let case = tree.test(idx).clone();
    let mut chain = Vec::with_capacity(2);
    if let Some(project) = tree.nearest(case.suite, SuiteKind::Project) {
        chain.push(SuiteSpec {
            kind: SuiteKind::Project,
            title: tree.suite(project).title.clone(),
            options: tree.inherited_options(project),
        });
    }
    if let Some(file) = tree.nearest(case.suite, SuiteKind::File) {
        chain.push(SuiteSpec {
            kind: SuiteKind::File,
            title: tree.suite(file).title.clone(),
            options: tree.suite(file).options.clone(),
        });
    }
    Job {
        idx,
        source_file: tree.file_path(idx).unwrap_or_default().to_string(),
        case,
        chain,
    }
}

/// Distinct shells hosting the selected tests, in first-use order.
fn shells_of(tree: &SuiteTree, tests: &[TestIndex]) -> Vec<Shell> {
    let mut shells = Vec::new();
    for &idx in tests {
        let options = tree.resolved_options(tree.test(idx).suite);
        if options.program.is_none() && !shells.contains(&options.shell) {
            shells.push(options.shell);
        }
    }
    shells
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_config::TestOptions;
    use tt_core::{Location, TestId};

    fn sample_tree() -> (SuiteTree, TestIndex) {
        let mut tree = SuiteTree::new(TestOptions {
            rows: Some(12),
            ..Default::default()
        });
        let project = tree.add_suite(
            tree.root(),
            SuiteKind::Project,
            "sh",
            TestOptions {
                shell: Some(Shell::Sh),
                ..Default::default()
            },
        );
        let file = tree.add_suite(
            project,
            SuiteKind::File,
            "tests/a.rs",
            TestOptions {
                columns: Some(40),
                ..Default::default()
            },
        );
        let idx = tree.add_test(TestCase {
            id: TestId(String::new()),
            title: "t".into(),
            location: Location { row: 1, column: 1 },
            suite: file,
            expected_status: ExpectedStatus::Expected,
            annotations: vec![],
            title_ordinal: 1,
            results: vec![],
        });
        (tree, idx)
    }

    #[test]
    fn test_chain_carries_project_inheritance_and_file_options() {
        let (tree, idx) = sample_tree();
        let job = job_for(&tree, idx);
        assert_eq!(job.source_file, "tests/a.rs");
        assert_eq!(job.chain.len(), 2);
        assert_eq!(job.chain[0].title, "sh");
        assert_eq!(job.chain[0].options.rows, Some(12));
        assert_eq!(job.chain[0].options.shell, Some(Shell::Sh));
        assert_eq!(job.chain[1].options.columns, Some(40));
        assert_eq!(job.chain[1].options.rows, None);
    }

    #[test]
    fn test_shells_are_deduplicated() {
        let (tree, idx) = sample_tree();
        assert_eq!(shells_of(&tree, &[idx, idx]), vec![Shell::Sh]);
    }

    #[test]
    fn test_settings_follow_config() {
        let config = TestConfig {
            retries: 2,
            timeout: 0,
            trace: false,
            ..Default::default()
        };
        let settings = RunSettings::from_config(&config, true, true, PathBuf::from("."));
        assert_eq!(settings.retries, 2);
        assert_eq!(settings.timeout, None);
        assert!(settings.trace);
        assert!(settings.update_snapshots);
        assert_eq!(settings.expect_timeout, Duration::from_millis(5000));
    }
}
