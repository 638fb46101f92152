// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Suite tree
//!
//! Suites and tests live in flat arenas owned by [`SuiteTree`]. A suite knows
//! its parent, so option resolution and title paths walk upwards without
//! shared ownership.

use crate::testcase::{TestCase, TestId, TITLE_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tt_config::{ResolvedOptions, TestOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SuiteId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteKind {
    Root,
    Project,
    File,
    Describe,
}

#[derive(Debug, Clone)]
pub struct Suite {
    pub title: String,
    pub kind: SuiteKind,
    /// Options set directly on this suite
    pub options: TestOptions,
    /// Source path, only on file suites
    pub source: Option<String>,
    pub parent: Option<SuiteId>,
    pub children: Vec<SuiteId>,
    pub tests: Vec<TestIndex>,
}

#[derive(Debug, Clone)]
pub struct SuiteTree {
    suites: Vec<Suite>,
    tests: Vec<TestCase>,
}

impl SuiteTree {
    pub fn new(root_options: TestOptions) -> Self {
        Self {
            suites: vec![Suite {
                title: String::new(),
                kind: SuiteKind::Root,
                options: root_options,
                source: None,
                parent: None,
                children: Vec::new(),
                tests: Vec::new(),
            }],
            tests: Vec::new(),
        }
    }

    pub fn root(&self) -> SuiteId {
        SuiteId(0)
    }

    pub fn add_suite(
        &mut self,
        parent: SuiteId,
        kind: SuiteKind,
        title: impl Into<String>,
        options: TestOptions,
    ) -> SuiteId {
        let title = title.into();
        let source = (kind == SuiteKind::File).then(|| title.clone());
        let id = SuiteId(self.suites.len());
        self.suites.push(Suite {
            title,
            kind,
            options,
            source,
            parent: Some(parent),
            children: Vec::new(),
            tests: Vec::new(),
        });
        self.suites[parent.0].children.push(id);
        id
    }

    /// Add a test to its suite, deriving its id from the title path.
    pub fn add_test(&mut self, mut test: TestCase) -> TestIndex {
        test.id = self.test_id(test.suite, &test.title, test.location);
        let idx = TestIndex(self.tests.len());
        self.suites[test.suite.0].tests.push(idx);
        self.tests.push(test);
        idx
    }

    pub fn suite(&self, id: SuiteId) -> &Suite {
        &self.suites[id.0]
    }

    pub fn suite_mut(&mut self, id: SuiteId) -> &mut Suite {
        &mut self.suites[id.0]
    }

    pub fn test(&self, idx: TestIndex) -> &TestCase {
        &self.tests[idx.0]
    }

    pub fn test_mut(&mut self, idx: TestIndex) -> &mut TestCase {
        &mut self.tests[idx.0]
    }

    pub fn tests(&self) -> impl Iterator<Item = (TestIndex, &TestCase)> {
        self.tests.iter().enumerate().map(|(i, t)| (TestIndex(i), t))
    }

    pub fn find_test(&self, id: &TestId) -> Option<TestIndex> {
        self.tests.iter().position(|t| &t.id == id).map(TestIndex)
    }

    /// Ancestors of `id`, nearest first, including `id` itself.
    pub fn ancestors(&self, id: SuiteId) -> impl Iterator<Item = (SuiteId, &Suite)> {
        let mut next = Some(id);
        std::iter::from_fn(move || {
            let cur = next?;
            let suite = &self.suites[cur.0];
            next = suite.parent;
            Some((cur, suite))
        })
    }

    /// Options of `id` with inheritance applied. Defaults are not filled in.
    pub fn inherited_options(&self, id: SuiteId) -> TestOptions {
        let chain: Vec<&Suite> = self.ancestors(id).map(|(_, s)| s).collect();
        chain
            .iter()
            .rev()
            .fold(TestOptions::default(), |acc, suite| suite.options.inherit(&acc))
    }

    pub fn resolved_options(&self, id: SuiteId) -> ResolvedOptions {
        self.inherited_options(id).resolve()
    }

    pub fn nearest(&self, id: SuiteId, kind: SuiteKind) -> Option<SuiteId> {
        self.ancestors(id).find(|(_, s)| s.kind == kind).map(|(sid, _)| sid)
    }

    /// Source path of the file suite enclosing `idx`.
    pub fn file_path(&self, idx: TestIndex) -> Option<&str> {
        let file = self.nearest(self.tests[idx.0].suite, SuiteKind::File)?;
        self.suites[file.0].source.as_deref()
    }

    pub fn project_name(&self, idx: TestIndex) -> Option<&str> {
        let project = self.nearest(self.tests[idx.0].suite, SuiteKind::Project)?;
        Some(self.suites[project.0].title.as_str())
    }

    /// Title path: `[project]` when named, `file:row:column`, describe
    /// titles, then the test title.
    pub fn title_path_of(
        &self,
        suite: SuiteId,
        title: &str,
        location: crate::testcase::Location,
    ) -> Vec<String> {
        let mut titles: Vec<String> = self
            .ancestors(suite)
            .filter_map(|(_, s)| match s.kind {
                SuiteKind::Project if !s.title.is_empty() => Some(format!("[{}]", s.title)),
                SuiteKind::File => Some(format!("{}:{}:{}", s.title, location.row, location.column)),
                SuiteKind::Describe => Some(s.title.clone()),
                _ => None,
            })
            .collect();
        titles.reverse();
        titles.push(title.to_string());
        titles
    }

    pub fn title_path(&self, idx: TestIndex) -> Vec<String> {
        let test = &self.tests[idx.0];
        self.title_path_of(test.suite, &test.title, test.location)
    }

    /// Describe titles followed by the test title.
    pub fn local_titles(&self, idx: TestIndex) -> Vec<String> {
        let test = &self.tests[idx.0];
        let mut titles: Vec<String> = self
            .ancestors(test.suite)
            .filter(|(_, s)| s.kind == SuiteKind::Describe)
            .map(|(_, s)| s.title.clone())
            .collect();
        titles.reverse();
        titles.push(test.title.clone());
        titles
    }

    pub fn test_id(&self, suite: SuiteId, title: &str, location: crate::testcase::Location) -> TestId {
        TestId(self.title_path_of(suite, title, location).join(TITLE_SEPARATOR))
    }

    /// Tests in breadth-first suite order; within a suite, declaration order.
    pub fn bfs_tests(&self) -> Vec<TestIndex> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([self.root()]);
        while let Some(id) = queue.pop_front() {
            let suite = &self.suites[id.0];
            order.extend(suite.tests.iter().copied());
            queue.extend(suite.children.iter().copied());
        }
        order
    }

    /// Number of tests in `file` (a file suite) titled `title`, counting
    /// nested describes.
    pub fn count_titled_in(&self, file: SuiteId, title: &str) -> usize {
        self.tests
            .iter()
            .filter(|t| t.title == title && self.nearest(t.suite, SuiteKind::File) == Some(file))
            .count()
    }

    /// Distinct source paths of all file suites.
    pub fn file_sources(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .suites
            .iter()
            .filter(|s| s.kind == SuiteKind::File)
            .filter_map(|s| s.source.clone())
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{ExpectedStatus, Location, TestId};
    use std::collections::BTreeMap;
    use tt_config::Shell;

    fn case(suite: SuiteId, title: &str) -> TestCase {
        TestCase {
            id: TestId(String::new()),
            title: title.into(),
            location: Location { row: 3, column: 5 },
            suite,
            expected_status: ExpectedStatus::Expected,
            annotations: vec![],
            title_ordinal: 1,
            results: vec![],
        }
    }

    fn sample() -> (SuiteTree, SuiteId, SuiteId) {
        let mut tree = SuiteTree::new(TestOptions {
            rows: Some(20),
            ..Default::default()
        });
        let project = tree.add_suite(
            tree.root(),
            SuiteKind::Project,
            "zsh",
            TestOptions {
                shell: Some(Shell::Zsh),
                env: Some(BTreeMap::from([("A".into(), "1".into())])),
                ..Default::default()
            },
        );
        let file = tree.add_suite(project, SuiteKind::File, "tests/a.rs", TestOptions::default());
        let describe = tree.add_suite(
            file,
            SuiteKind::Describe,
            "group",
            TestOptions {
                rows: Some(7),
                env: Some(BTreeMap::from([("B".into(), "2".into())])),
                ..Default::default()
            },
        );
        (tree, file, describe)
    }

    #[test]
    fn test_ids_follow_title_path() {
        let (mut tree, file, describe) = sample();
        let top = tree.add_test(case(file, "top"));
        let nested = tree.add_test(case(describe, "nested"));
        assert_eq!(tree.test(top).id.0, "[zsh] › tests/a.rs:3:5 › top");
        assert_eq!(tree.test(nested).id.0, "[zsh] › tests/a.rs:3:5 › group › nested");
        assert_eq!(tree.find_test(&tree.test(nested).id.clone()), Some(nested));
        assert_eq!(tree.file_path(nested), Some("tests/a.rs"));
        assert_eq!(tree.local_titles(nested), vec!["group", "nested"]);
    }

    #[test]
    fn test_unnamed_project_is_left_out_of_title_path() {
        let mut tree = SuiteTree::new(TestOptions::default());
        let project = tree.add_suite(tree.root(), SuiteKind::Project, "", TestOptions::default());
        let file = tree.add_suite(project, SuiteKind::File, "a.rs", TestOptions::default());
        let t = tree.add_test(case(file, "t"));
        assert_eq!(tree.test(t).id.0, "a.rs:3:5 › t");
    }

    #[test]
    fn test_options_inherit_from_nearest_ancestor() {
        let (tree, file, describe) = sample();
        let file_opts = tree.resolved_options(file);
        assert_eq!(file_opts.rows, 20);
        assert_eq!(file_opts.shell, Shell::Zsh);
        assert_eq!(file_opts.columns, 80);

        let nested = tree.resolved_options(describe);
        assert_eq!(nested.rows, 7);
        assert_eq!(nested.shell, Shell::Zsh);
        assert_eq!(nested.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(nested.env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_bfs_order_and_title_counts() {
        let (mut tree, file, describe) = sample();
        let deep = tree.add_test(case(describe, "same"));
        let shallow = tree.add_test(case(file, "same"));
        assert_eq!(tree.bfs_tests(), vec![shallow, deep]);
        assert_eq!(tree.count_titled_in(file, "same"), 2);
        assert_eq!(tree.file_sources(), vec!["tests/a.rs".to_string()]);
    }
}
