// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test registration
//!
//! Test files are plain functions taking a [`SuiteBuilder`]. Building a tree
//! runs every registration function in order, so the orchestrator and each
//! worker derive identical ids from the same configuration.

use crate::context::TestContext;
use crate::suite::{SuiteId, SuiteKind, SuiteTree, TestIndex};
use crate::testcase::{Annotation, ExpectedStatus, Location, TestCase, TestId};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use tt_config::{compile_pattern, ConfigResult, TestConfig, TestOptions};

/// Type-erased async test body
pub type TestFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registration function of one test file
pub type RegisterFn = fn(&mut SuiteBuilder<'_>);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown test id: {0}")]
    UnknownTest(TestId),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A test file known to the program
#[derive(Clone, Copy)]
pub struct TestFile {
    pub path: &'static str,
    pub register: RegisterFn,
}

/// Test bodies keyed by test id
#[derive(Default, Clone)]
pub struct TestRegistry {
    bodies: HashMap<TestId, TestFn>,
}

impl TestRegistry {
    pub fn get(&self, id: &TestId) -> RegistryResult<TestFn> {
        self.bodies
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTest(id.clone()))
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

fn boxed<F, Fut>(f: F) -> TestFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Declares tests into one suite of the tree
pub struct SuiteBuilder<'a> {
    tree: &'a mut SuiteTree,
    registry: &'a mut TestRegistry,
    suite: SuiteId,
    file: SuiteId,
}

impl<'a> SuiteBuilder<'a> {
    pub fn new(tree: &'a mut SuiteTree, registry: &'a mut TestRegistry, file: SuiteId) -> Self {
        Self {
            tree,
            registry,
            suite: file,
            file,
        }
    }

    pub fn suite_id(&self) -> SuiteId {
        self.suite
    }

    /// Set options on the current suite. Set fields override earlier calls.
    pub fn use_options(&mut self, options: TestOptions) -> &mut Self {
        let suite = self.tree.suite_mut(self.suite);
        suite.options = options.inherit(&suite.options);
        self
    }

    /// Declare a group of tests.
    pub fn describe(&mut self, title: impl Into<String>, f: impl FnOnce(&mut SuiteBuilder<'_>)) -> &mut Self {
        let child = self
            .tree
            .add_suite(self.suite, SuiteKind::Describe, title, TestOptions::default());
        let mut nested = SuiteBuilder {
            tree: &mut *self.tree,
            registry: &mut *self.registry,
            suite: child,
            file: self.file,
        };
        f(&mut nested);
        self
    }

    #[track_caller]
    pub fn test<F, Fut>(&mut self, title: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = std::panic::Location::caller().into();
        self.add(title.into(), location, ExpectedStatus::Expected, Vec::new(), boxed(f));
        self
    }

    /// Declare a test that never runs.
    #[track_caller]
    pub fn skip<F, Fut>(&mut self, title: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = std::panic::Location::caller().into();
        self.add(title.into(), location, ExpectedStatus::Skipped, Vec::new(), boxed(f));
        self
    }

    /// Declare a test whose body is expected to fail.
    #[track_caller]
    pub fn fail<F, Fut>(&mut self, title: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = std::panic::Location::caller().into();
        self.add(title.into(), location, ExpectedStatus::Unexpected, Vec::new(), boxed(f));
        self
    }

    /// Declare a focused test. When any focused test exists only focused
    /// tests run.
    #[track_caller]
    pub fn only<F, Fut>(&mut self, title: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = std::panic::Location::caller().into();
        self.add(
            title.into(),
            location,
            ExpectedStatus::Expected,
            vec![Annotation::Only],
            boxed(f),
        );
        self
    }

    /// Declare a test that is skipped unless `condition` holds.
    #[track_caller]
    pub fn when<F, Fut>(&mut self, condition: bool, title: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = std::panic::Location::caller().into();
        let status = if condition {
            ExpectedStatus::Expected
        } else {
            ExpectedStatus::Skipped
        };
        self.add(title.into(), location, status, Vec::new(), boxed(f));
        self
    }

    fn add(
        &mut self,
        title: String,
        location: Location,
        expected_status: ExpectedStatus,
        annotations: Vec<Annotation>,
        body: TestFn,
    ) -> TestIndex {
        let id = self.tree.test_id(self.suite, &title, location);
        if let Some(existing) = self.tree.find_test(&id) {
            warn!(test = %id, "Ignoring duplicate test registration, the first one wins");
            return existing;
        }
        let title_ordinal = self.tree.count_titled_in(self.file, &title) + 1;
        let idx = self.tree.add_test(TestCase {
            id: TestId(String::new()),
            title,
            location,
            suite: self.suite,
            expected_status,
            annotations,
            title_ordinal,
            results: Vec::new(),
        });
        debug!(test = %id, "Registered test");
        self.registry.bodies.insert(id, body);
        idx
    }
}

/// Build the suite tree for `files` under the configured projects.
///
/// Without configured projects a single unnamed project covers every file
/// matching the top-level `test_match`.
pub fn build_tree(config: &TestConfig, files: &[TestFile]) -> ConfigResult<(SuiteTree, TestRegistry)> {
    let mut tree = SuiteTree::new(config.use_options.clone());
    let mut registry = TestRegistry::default();

    let default_project = tt_config::ProjectConfig {
        name: String::new(),
        test_match: None,
        options: TestOptions::default(),
    };
    let projects = if config.projects.is_empty() {
        std::slice::from_ref(&default_project)
    } else {
        config.projects.as_slice()
    };

    for project in projects {
        let pattern = compile_pattern(project.test_match.as_deref().unwrap_or(&config.test_match))?;
        let project_id = tree.add_suite(
            tree.root(),
            SuiteKind::Project,
            project.name.clone(),
            project.options.clone(),
        );
        for file in files.iter().filter(|f| pattern.is_match(f.path)) {
            register_file(&mut tree, &mut registry, project_id, file, TestOptions::default());
        }
    }

    Ok((tree, registry))
}

/// Rebuild the suite of a single file under one project. Workers use this to
/// recover the exact ids the orchestrator scheduled.
pub fn build_file_tree(
    project: &str,
    project_options: TestOptions,
    file: &TestFile,
    file_options: TestOptions,
) -> (SuiteTree, TestRegistry) {
    let mut tree = SuiteTree::new(TestOptions::default());
    let mut registry = TestRegistry::default();
    let project_id = tree.add_suite(tree.root(), SuiteKind::Project, project, project_options);
    register_file(&mut tree, &mut registry, project_id, file, file_options);
    (tree, registry)
}

fn register_file(
    tree: &mut SuiteTree,
    registry: &mut TestRegistry,
    project: SuiteId,
    file: &TestFile,
    options: TestOptions,
) {
    let file_id = tree.add_suite(project, SuiteKind::File, file.path, options);
    let mut builder = SuiteBuilder::new(tree, registry, file_id);
    (file.register)(&mut builder);
}
