// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core of tui-test: the suite tree and test registration, outcome folding,
//! locators and assertions over terminal screens, and the snapshot store.

pub mod color;
pub mod context;
pub mod expect;
pub mod locator;
pub mod outcome;
pub mod poll;
pub mod registry;
pub mod snapshot;
pub mod suite;
pub mod testcase;

pub use color::ExpectedColor;
pub use context::{SnapshotContext, SnapshotOptions, TestContext, TestInfo};
pub use expect::{expect, AssertionError, AssertionResult, LocatorAssertions};
pub use locator::{LocatedCell, Locator, LocatorError, LocatorOptions, Pattern};
pub use outcome::{Outcome, OutcomeState};
pub use registry::{build_file_tree, build_tree, RegisterFn, RegistryError, SuiteBuilder, TestFile, TestFn, TestRegistry};
pub use snapshot::{Comparison, Reconciliation, SnapshotError, SnapshotStore};
pub use suite::{Suite, SuiteId, SuiteKind, SuiteTree, TestIndex};
pub use testcase::{
    Annotation, ExpectedStatus, Location, SnapshotRecord, SnapshotStatus, TestCase, TestId, TestResult,
    TestStatus, TITLE_SEPARATOR,
};
