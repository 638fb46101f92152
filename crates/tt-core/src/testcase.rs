// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test cases and per-attempt results

use crate::outcome::{self, Outcome};
use crate::suite::SuiteId;
use serde::{Deserialize, Serialize};

/// Stable test identifier derived from the title path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub String);

impl std::fmt::Display for TestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Separator between title path segments in ids and reports
pub const TITLE_SEPARATOR: &str = " › ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub row: u32,
    pub column: u32,
}

impl From<&std::panic::Location<'_>> for Location {
    fn from(l: &std::panic::Location<'_>) -> Self {
        Self {
            row: l.line(),
            column: l.column(),
        }
    }
}

/// What a passing run of the test looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedStatus {
    #[default]
    Expected,
    Skipped,
    /// Declared with `fail`: the body is expected to error
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Expected,
    Unexpected,
    Skipped,
    Flaky,
}

impl TestStatus {
    pub fn matches(&self, expected: ExpectedStatus) -> bool {
        matches!(
            (self, expected),
            (TestStatus::Expected, ExpectedStatus::Expected)
                | (TestStatus::Skipped, ExpectedStatus::Skipped)
                | (TestStatus::Unexpected, ExpectedStatus::Unexpected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Annotation {
    Only,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Passed,
    Failed,
    Written,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub status: SnapshotStatus,
}

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub snapshots: Vec<SnapshotRecord>,
}

impl TestResult {
    pub fn skipped() -> Self {
        Self {
            status: TestStatus::Skipped,
            error: None,
            duration_ms: 0,
            stdout: None,
            stderr: None,
            snapshots: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: TestStatus::Unexpected,
            error: Some(error.into()),
            duration_ms,
            stdout: None,
            stderr: None,
            snapshots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: TestId,
    pub title: String,
    pub location: Location,
    pub suite: SuiteId,
    pub expected_status: ExpectedStatus,
    pub annotations: Vec<Annotation>,
    /// 1-based position among tests of the same file with the same title
    pub title_ordinal: usize,
    pub results: Vec<TestResult>,
}

impl TestCase {
    pub fn outcome(&self) -> Outcome {
        outcome::fold(&self.results, self.expected_status)
    }

    /// Snapshots touched by the most recent attempt.
    pub fn snapshots(&self) -> &[SnapshotRecord] {
        self.results.last().map(|r| r.snapshots.as_slice()).unwrap_or(&[])
    }

    pub fn is_only(&self) -> bool {
        self.annotations.contains(&Annotation::Only)
    }

    /// Base name of this test's snapshots within its file.
    pub fn snapshot_base_name(&self) -> String {
        format!("{} {}", self.title, self.title_ordinal)
    }
}
