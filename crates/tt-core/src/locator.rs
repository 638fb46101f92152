// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Text locators over a terminal screen
//!
//! The scanned grid is flattened row by row with no separator. Every cell
//! contributes its text (a space when blank); wide-character continuation
//! cells contribute nothing. Each cell's byte range in the flattened text is
//! kept, so a match maps back to the exact cells it covers.

use crate::poll::{format_duration, poll_until};
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use tt_terminal::{BufferScope, Cell, Grid, ScreenSource};

pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("locator timeout: get_by_text({pattern}) resolved to 0 elements after {}", format_duration(*.elapsed))]
    Timeout { pattern: String, elapsed: Duration },
    #[error("strict mode violation: get_by_text({pattern}) resolved to {count} elements")]
    StrictModeViolation { pattern: String, count: usize },
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Text(String),
    Regex(Regex),
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Text(t) => f.write_str(t),
            Pattern::Regex(r) => write!(f, "/{}/", r.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::Text(s.to_string())
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::Text(s)
    }
}

impl From<Regex> for Pattern {
    fn from(r: Regex) -> Self {
        Pattern::Regex(r)
    }
}

impl From<&Regex> for Pattern {
    fn from(r: &Regex) -> Self {
        Pattern::Regex(r.clone())
    }
}

impl Pattern {
    /// Byte ranges of all non-overlapping matches.
    fn find_all(&self, haystack: &str) -> Vec<(usize, usize)> {
        match self {
            Pattern::Text(t) => haystack
                .match_indices(t.as_str())
                .map(|(start, m)| (start, start + m.len()))
                .collect(),
            Pattern::Regex(r) => r.find_iter(haystack).map(|m| (m.start(), m.end())).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorOptions {
    /// Search scrollback as well as the viewport
    pub full: bool,
    /// More than one match is an error
    pub strict: bool,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            full: false,
            strict: true,
        }
    }
}

impl LocatorOptions {
    pub fn full() -> Self {
        Self {
            full: true,
            ..Self::default()
        }
    }

    pub fn non_strict() -> Self {
        Self {
            strict: false,
            ..Self::default()
        }
    }
}

/// A cell covered by a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedCell {
    pub x: usize,
    /// Row within the scanned grid: absolute in full mode, viewport-relative otherwise
    pub y: usize,
    pub cell: Cell,
}

/// Flattened grid text with the byte range of every contributing cell
pub(crate) struct FlatText {
    pub(crate) text: String,
    spans: Vec<(usize, usize, usize, usize)>,
}

impl FlatText {
    pub(crate) fn new(grid: &Grid) -> Self {
        let mut text = String::new();
        let mut spans = Vec::new();
        for (y, row) in grid.rows.iter().enumerate() {
            for (x, cell) in row.iter().enumerate() {
                if cell.wide_continuation {
                    continue;
                }
                let start = text.len();
                if cell.has_contents() {
                    text.push_str(&cell.text);
                } else {
                    text.push(' ');
                }
                spans.push((start, text.len(), x, y));
            }
        }
        Self { text, spans }
    }

    /// Grid positions of the cells overlapping `[start, end)`.
    pub(crate) fn cells_in(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let first = self.spans.partition_point(|(_, e, _, _)| *e <= start);
        self.spans[first..]
            .iter()
            .take_while(|(s, _, _, _)| *s < end.max(start + 1))
            .map(|(_, _, x, y)| (*x, *y))
            .collect()
    }
}

pub struct Locator {
    pattern: Pattern,
    options: LocatorOptions,
    default_timeout: Duration,
    source: Arc<dyn ScreenSource>,
    resolved: Mutex<Option<Vec<LocatedCell>>>,
}

impl std::fmt::Debug for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locator")
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish()
    }
}

impl Locator {
    pub fn new(source: Arc<dyn ScreenSource>, pattern: impl Into<Pattern>, options: LocatorOptions) -> Self {
        Self {
            pattern: pattern.into(),
            options,
            default_timeout: DEFAULT_EXPECT_TIMEOUT,
            source,
            resolved: Mutex::new(None),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn options(&self) -> LocatorOptions {
        self.options
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn scope(&self) -> BufferScope {
        if self.options.full {
            BufferScope::Full
        } else {
            BufferScope::Viewport
        }
    }

    /// Current grid in this locator's scope.
    pub fn grid(&self) -> Grid {
        self.source.grid(self.scope())
    }

    /// One evaluation against the current screen, ignoring the memo.
    pub fn evaluate(&self) -> Result<Option<Vec<LocatedCell>>, LocatorError> {
        let grid = self.grid();
        let flat = FlatText::new(&grid);
        let matches = self.pattern.find_all(&flat.text);
        trace!(pattern = %self.pattern, matches = matches.len(), "Evaluated locator");

        if self.options.strict && matches.len() > 1 {
            return Err(LocatorError::StrictModeViolation {
                pattern: self.pattern.to_string(),
                count: matches.len(),
            });
        }
        let Some(&(start, end)) = matches.first() else {
            return Ok(None);
        };

        let cells = flat
            .cells_in(start, end)
            .into_iter()
            .filter_map(|(x, y)| {
                grid.cell(x, y).map(|cell| LocatedCell {
                    x,
                    y,
                    cell: cell.clone(),
                })
            })
            .collect();
        Ok(Some(cells))
    }

    /// Cells of the first resolution, if one happened.
    pub fn resolved(&self) -> Option<Vec<LocatedCell>> {
        self.resolved.lock().ok().and_then(|r| r.clone())
    }

    /// Poll until the pattern matches, memoizing the first success.
    pub async fn resolve(&self, timeout: Option<Duration>) -> Result<Vec<LocatedCell>, LocatorError> {
        if let Some(cells) = self.resolved() {
            return Ok(cells);
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        match poll_until(timeout, || self.evaluate()).await? {
            Some(cells) => {
                if let Ok(mut memo) = self.resolved.lock() {
                    *memo = Some(cells.clone());
                }
                Ok(cells)
            }
            None => Err(LocatorError::Timeout {
                pattern: self.pattern.to_string(),
                elapsed: started.elapsed(),
            }),
        }
    }
}
