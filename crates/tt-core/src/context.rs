// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-attempt context handed to test bodies

use crate::locator::{Locator, LocatorOptions, Pattern};
use crate::snapshot::{self, SnapshotError, SnapshotResult, SnapshotStore};
use crate::testcase::{SnapshotRecord, SnapshotStatus, TestId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;
use tt_terminal::{ScreenSource, Terminal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInfo {
    pub id: TestId,
    pub title: String,
    /// Describe titles followed by the test title
    pub titles: Vec<String>,
    pub file: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    /// Append the cell attribute shifts to the capture
    pub include_colors: bool,
}

/// Snapshot bookkeeping of one attempt
pub struct SnapshotContext {
    store: Arc<SnapshotStore>,
    file: String,
    base_name: String,
    taken: AtomicUsize,
    events: mpsc::UnboundedSender<SnapshotRecord>,
}

impl SnapshotContext {
    pub fn new(
        store: Arc<SnapshotStore>,
        file: impl Into<String>,
        base_name: impl Into<String>,
        events: mpsc::UnboundedSender<SnapshotRecord>,
    ) -> Self {
        Self {
            store,
            file: file.into(),
            base_name: base_name.into(),
            taken: AtomicUsize::new(0),
            events,
        }
    }

    /// Name of the next capture: the base name, then `base 1`, `base 2`, ...
    pub fn next_name(&self) -> String {
        match self.taken.fetch_add(1, Ordering::SeqCst) {
            0 => self.base_name.clone(),
            k => format!("{} {k}", self.base_name),
        }
    }

    pub async fn match_screen(&self, screen: &dyn ScreenSource, options: SnapshotOptions) -> SnapshotResult<()> {
        let name = self.next_name();
        let content = snapshot::capture(screen, options.include_colors);
        let comparison = self.store.compare_or_write(&self.file, &name, &content).await?;

        if self
            .events
            .send(SnapshotRecord {
                name: name.clone(),
                status: comparison.status,
            })
            .is_err()
        {
            warn!(%name, "Snapshot event receiver is gone");
        }

        match comparison.status {
            SnapshotStatus::Failed => Err(SnapshotError::Mismatch {
                name,
                diff: comparison.diff.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }
}

struct Inner {
    terminal: Arc<Terminal>,
    expect_timeout: Duration,
    info: TestInfo,
    snapshots: SnapshotContext,
}

/// Handle passed to every test body. Cloning is cheap.
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<Inner>,
}

impl TestContext {
    pub fn new(terminal: Arc<Terminal>, expect_timeout: Duration, info: TestInfo, snapshots: SnapshotContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                terminal,
                expect_timeout,
                info,
                snapshots,
            }),
        }
    }

    pub fn terminal(&self) -> &Terminal {
        &self.inner.terminal
    }

    pub fn info(&self) -> &TestInfo {
        &self.inner.info
    }

    pub fn expect_timeout(&self) -> Duration {
        self.inner.expect_timeout
    }

    /// Locate `pattern` in the viewport, strictly.
    pub fn get_by_text(&self, pattern: impl Into<Pattern>) -> Locator {
        self.get_by_text_with(pattern, LocatorOptions::default())
    }

    pub fn get_by_text_with(&self, pattern: impl Into<Pattern>, options: LocatorOptions) -> Locator {
        let source: Arc<dyn ScreenSource> = self.inner.terminal.clone();
        Locator::new(source, pattern, options).with_default_timeout(self.inner.expect_timeout)
    }

    pub async fn to_match_snapshot(&self) -> SnapshotResult<()> {
        self.to_match_snapshot_with(SnapshotOptions::default()).await
    }

    pub async fn to_match_snapshot_with(&self, options: SnapshotOptions) -> SnapshotResult<()> {
        self.inner
            .snapshots
            .match_screen(self.inner.terminal.as_ref(), options)
            .await
    }
}
