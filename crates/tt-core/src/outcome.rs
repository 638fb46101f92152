// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Final outcome of a test, folded from its attempt results

use crate::testcase::{ExpectedStatus, TestResult, TestStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Skipped,
    Expected,
    Unexpected,
    Flaky,
}

/// Fold state. `Passing` and `Failing` remember the class of the previous
/// attempt; `Flaky` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeState {
    Start,
    Passing,
    Failing,
    /// Previous attempt was neither expected nor unexpected
    Neutral(TestStatus),
    Flaky,
}

impl OutcomeState {
    pub fn step(self, status: TestStatus) -> OutcomeState {
        match (self, status) {
            (OutcomeState::Flaky, _) => OutcomeState::Flaky,
            (OutcomeState::Failing, TestStatus::Expected) => OutcomeState::Flaky,
            (OutcomeState::Passing, TestStatus::Expected) => OutcomeState::Passing,
            (OutcomeState::Passing, _) => OutcomeState::Flaky,
            (_, TestStatus::Expected) => OutcomeState::Passing,
            (_, TestStatus::Unexpected) => OutcomeState::Failing,
            (_, other) => OutcomeState::Neutral(other),
        }
    }

    fn last_status(self) -> Option<TestStatus> {
        match self {
            OutcomeState::Start | OutcomeState::Flaky => None,
            OutcomeState::Passing => Some(TestStatus::Expected),
            OutcomeState::Failing => Some(TestStatus::Unexpected),
            OutcomeState::Neutral(s) => Some(s),
        }
    }
}

pub fn fold(results: &[TestResult], expected: ExpectedStatus) -> Outcome {
    if results.iter().all(|r| r.status == TestStatus::Skipped) {
        return Outcome::Skipped;
    }

    let state = results
        .iter()
        .fold(OutcomeState::Start, |state, r| state.step(r.status));

    match state {
        OutcomeState::Flaky => Outcome::Flaky,
        other => match other.last_status() {
            Some(status) if status.matches(expected) => Outcome::Expected,
            _ => Outcome::Unexpected,
        },
    }
}
