// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Assertions over locators

use crate::color::ExpectedColor;
use crate::locator::{LocatedCell, Locator, LocatorError};
use crate::poll::{poll_stays_false, poll_until};
use std::time::Duration;
use tracing::debug;
use tt_terminal::Color;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AssertionError {
    #[error("{message}")]
    Failed { message: String },
    #[error(transparent)]
    Locator(#[from] LocatorError),
}

pub type AssertionResult = Result<(), AssertionError>;

pub fn expect(locator: &Locator) -> LocatorAssertions<'_> {
    LocatorAssertions {
        locator,
        negated: false,
        timeout: None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Layer {
    Foreground,
    Background,
}

impl Layer {
    fn name(self) -> &'static str {
        match self {
            Layer::Foreground => "toHaveFgColor",
            Layer::Background => "toHaveBgColor",
        }
    }

    fn of(self, located: &LocatedCell) -> Color {
        match self {
            Layer::Foreground => located.cell.fg,
            Layer::Background => located.cell.bg,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LocatorAssertions<'a> {
    locator: &'a Locator,
    negated: bool,
    timeout: Option<Duration>,
}

impl<'a> LocatorAssertions<'a> {
    #[allow(clippy::should_implement_trait)]
    pub fn not(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn window(&self) -> Duration {
        self.timeout.unwrap_or(self.locator.default_timeout())
    }

    fn prefix(&self, matcher: &str) -> String {
        if self.negated {
            format!("expect(received).not.{matcher}(expected)")
        } else {
            format!("expect(received).{matcher}(expected)")
        }
    }

    pub async fn to_be_visible(self) -> AssertionResult {
        let pattern = self.locator.pattern().to_string();
        if !self.negated {
            return match self.locator.resolve(Some(self.window())).await {
                Ok(_) => Ok(()),
                Err(e @ LocatorError::StrictModeViolation { .. }) => Err(e.into()),
                Err(e) => Err(AssertionError::Failed {
                    message: format!(
                        "{}\n\nExpected: {pattern}\nMatches Found: 0\n\n{e}",
                        self.prefix("toBeVisible")
                    ),
                }),
            };
        }

        let stayed_hidden = poll_stays_false(self.window(), || -> Result<bool, LocatorError> {
            match self.locator.evaluate() {
                Ok(found) => Ok(found.is_some()),
                Err(LocatorError::StrictModeViolation { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await?;
        debug!(%pattern, stayed_hidden, "Evaluated negated visibility");

        if stayed_hidden {
            Ok(())
        } else {
            Err(AssertionError::Failed {
                message: format!("{}\n\nExpected: 0 matches\nFound: {pattern}", self.prefix("toBeVisible")),
            })
        }
    }

    pub async fn to_have_fg_color(self, color: impl Into<ExpectedColor>) -> AssertionResult {
        self.to_have_color(Layer::Foreground, color.into()).await
    }

    pub async fn to_have_bg_color(self, color: impl Into<ExpectedColor>) -> AssertionResult {
        self.to_have_color(Layer::Background, color.into()).await
    }

    async fn to_have_color(self, layer: Layer, expected: ExpectedColor) -> AssertionResult {
        let window = self.window();
        self.locator.resolve(Some(window)).await?;

        if self.negated {
            let cells = self.current_cells()?;
            return match cells.iter().find(|c| expected.matches(layer.of(c))) {
                Some(found) => Err(self.color_failure(
                    layer,
                    &expected,
                    found,
                    "Expected No Occurrences Of Color",
                )),
                None => Ok(()),
            };
        }

        let mut last_bad = None;
        let satisfied = poll_until(window, || -> Result<Option<()>, AssertionError> {
            let cells = self.current_cells()?;
            last_bad = cells.into_iter().find(|c| !expected.matches(layer.of(c)));
            Ok(last_bad.is_none().then_some(()))
        })
        .await?;

        match (satisfied, last_bad) {
            (Some(()), _) => Ok(()),
            (None, Some(bad)) => Err(self.color_failure(layer, &expected, &bad, "Expected Color")),
            (None, None) => Ok(()),
        }
    }

    /// Current cells at the memoized match positions.
    fn current_cells(&self) -> Result<Vec<LocatedCell>, AssertionError> {
        let positions = self.locator.resolved().unwrap_or_default();
        let grid = self.locator.grid();
        Ok(positions
            .into_iter()
            .map(|p| {
                let cell = grid.cell(p.x, p.y).cloned().unwrap_or(p.cell);
                LocatedCell { x: p.x, y: p.y, cell }
            })
            .collect())
    }

    fn color_failure(
        &self,
        layer: Layer,
        expected: &ExpectedColor,
        cell: &LocatedCell,
        label: &str,
    ) -> AssertionError {
        AssertionError::Failed {
            message: format!(
                "{}\n\n{label}: {expected}\nFound Color: {} in cell \"{}\" at {},{}",
                self.prefix(layer.name()),
                expected.describe(layer.of(cell)),
                cell.cell.text,
                cell.x,
                cell.y
            ),
        }
    }
}
