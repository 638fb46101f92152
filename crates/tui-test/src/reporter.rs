// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Run reporting

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::warn;
use tt_config::Shell;
use tt_core::{Outcome, SnapshotStatus, SuiteTree, TestCase, TestResult, TestStatus};

/// Snapshot entries no test of the run produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleSnapshotSummary {
    pub obsolete: usize,
    pub removed: usize,
}

/// Receives run progress from the orchestrator
pub trait Reporter: Send + Sync {
    fn start(&self, test_count: usize, shells: &[Shell], workers: usize);

    /// Fired once per attempt, when the worker acknowledges it.
    fn start_test(&self, test: &TestCase, attempt: u32);

    /// Fired after each attempt. `test.results` already contains `result`.
    fn end_test(&self, test: &TestCase, result: &TestResult, attempt: u32);

    /// Print the summary and return the number of failed tests.
    fn end(&self, tree: &SuiteTree, stale: StaleSnapshotSummary) -> usize;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Summary {
    did_not_run: usize,
    skipped: usize,
    passed: usize,
    failed: Vec<usize>,
    flaky: Vec<usize>,
    snapshots: SnapshotCounts,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SnapshotCounts {
    passed: usize,
    failed: usize,
    written: usize,
    updated: usize,
    obsolete: usize,
    removed: usize,
}

impl SnapshotCounts {
    fn total(&self) -> usize {
        self.passed + self.failed + self.written + self.updated + self.obsolete + self.removed
    }
}

fn plural(word: &str, count: usize) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("     {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain, append-only progress list
pub struct ListReporter {
    out: Mutex<Box<dyn Write + Send>>,
    finished: AtomicUsize,
}

impl ListReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn emit(&self, text: &str) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            warn!(error = %e, "Failed to write report");
        }
    }

    fn icon(outcome: Outcome) -> &'static str {
        match outcome {
            Outcome::Expected | Outcome::Flaky => "✔",
            Outcome::Unexpected => "✘",
            Outcome::Skipped => "-",
        }
    }

    fn summarize(tree: &SuiteTree, stale: StaleSnapshotSummary) -> Summary {
        let mut summary = Summary {
            snapshots: SnapshotCounts {
                obsolete: stale.obsolete,
                removed: stale.removed,
                ..Default::default()
            },
            ..Default::default()
        };
        for (idx, test) in tree.tests() {
            for snapshot in test.snapshots() {
                match snapshot.status {
                    SnapshotStatus::Passed => summary.snapshots.passed += 1,
                    SnapshotStatus::Failed => summary.snapshots.failed += 1,
                    SnapshotStatus::Written => summary.snapshots.written += 1,
                    SnapshotStatus::Updated => summary.snapshots.updated += 1,
                }
            }
            match test.outcome() {
                Outcome::Skipped if test.results.is_empty() => summary.did_not_run += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Expected => summary.passed += 1,
                Outcome::Unexpected => summary.failed.push(idx.0),
                Outcome::Flaky => summary.flaky.push(idx.0),
            }
        }
        summary
    }

    fn failures_text(tree: &SuiteTree, summary: &Summary) -> String {
        let mut text = String::new();
        let tests: Vec<&TestCase> = tree.tests().map(|(_, t)| t).collect();
        let failing = summary.failed.iter().chain(summary.flaky.iter());
        for (n, &idx) in failing.enumerate() {
            let test = tests[idx];
            let header = format!("  {}) {} ", n + 1, test.id);
            let mut printed_header = false;
            for (retry, result) in test.results.iter().enumerate() {
                let Some(error) = &result.error else {
                    continue;
                };
                text.push('\n');
                if !printed_header {
                    text.push_str(&header);
                    text.push_str("─────");
                    if retry > 0 {
                        text.push_str(&format!("\n\n     Retry #{retry} ─────"));
                    }
                    printed_header = true;
                } else {
                    text.push_str(&format!("     Retry #{retry} ─────"));
                }
                text.push_str("\n\n");
                text.push_str(&indent(error));
                text.push_str("\n\n");
                for (label, stream) in [("Stdout", &result.stdout), ("Stderr", &result.stderr)] {
                    if let Some(stream) = stream.as_deref().filter(|s| !s.trim().is_empty()) {
                        text.push_str(&format!("     {label} ─────\n\n"));
                        text.push_str(&indent(stream));
                        text.push_str("\n\n");
                    }
                }
            }
        }
        text
    }

    fn summary_text(summary: &Summary) -> String {
        let mut tokens = Vec::new();
        if !summary.failed.is_empty() {
            tokens.push(format!("{} failed", summary.failed.len()));
        }
        if !summary.flaky.is_empty() {
            tokens.push(format!("{} flaky", summary.flaky.len()));
        }
        if summary.did_not_run > 0 {
            tokens.push(format!("{} did not run", summary.did_not_run));
        }
        if summary.skipped > 0 {
            tokens.push(format!("{} skipped", summary.skipped));
        }
        if summary.passed > 0 {
            tokens.push(format!("{} passed", summary.passed));
        }
        let total =
            summary.failed.len() + summary.flaky.len() + summary.did_not_run + summary.skipped + summary.passed;

        let mut text = String::new();
        if total > 0 {
            text.push_str(&format!("\n  tests: {}, {total} total\n", tokens.join(", ")));
        }

        let s = summary.snapshots;
        let snapshot_tokens: Vec<String> = [
            (s.passed, "passed"),
            (s.failed, "failed"),
            (s.updated, "updated"),
            (s.written, "written"),
            (s.obsolete, "obsolete"),
            (s.removed, "removed"),
        ]
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{n} {label}"))
        .collect();
        if s.total() > 0 {
            let hint = if s.failed > 0 || s.obsolete > 0 {
                " (Inspect your code changes or use the `-u` flag to update them.)"
            } else {
                ""
            };
            text.push_str(&format!(
                "  snapshots: {}, {} total{hint}\n\n",
                snapshot_tokens.join(", "),
                s.total()
            ));
        } else {
            text.push('\n');
        }
        text
    }
}

impl Reporter for ListReporter {
    fn start(&self, test_count: usize, shells: &[Shell], workers: usize) {
        let workers = workers.min(test_count).max(1);
        let mut text = format!(
            "Running {test_count} {} using {workers} {} with the following shells:\n",
            plural("test", test_count),
            plural("worker", workers)
        );
        for shell in shells {
            text.push_str(shell.name());
            text.push('\n');
        }
        text.push('\n');
        if shells.is_empty() {
            text.push('\n');
        }
        self.emit(&text);
    }

    fn start_test(&self, _test: &TestCase, _attempt: u32) {}

    fn end_test(&self, test: &TestCase, result: &TestResult, attempt: u32) {
        let row = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        let retry = if attempt > 0 {
            format!(" (retry #{attempt})")
        } else {
            String::new()
        };
        let time = if result.status == TestStatus::Pending {
            String::new()
        } else {
            format!(" ({})", format_duration_ms(result.duration_ms))
        };
        self.emit(&format!(
            "  {}  {row} {}{retry}{time}\n",
            Self::icon(test.outcome()),
            test.id
        ));
    }

    fn end(&self, tree: &SuiteTree, stale: StaleSnapshotSummary) -> usize {
        let summary = Self::summarize(tree, stale);
        let mut text = Self::failures_text(tree, &summary);
        text.push_str(&Self::summary_text(&summary));
        self.emit(&text);
        summary.failed.len()
    }
}
