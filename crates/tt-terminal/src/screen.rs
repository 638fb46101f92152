// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// Screen model: a vt100 parser behind a mutex, read out as owned cell grids

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Lines of scrollback retained by every screen
pub const SCROLLBACK_LINES: usize = 10_000;

/// Cell colour as reported by the emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Color {
    #[default]
    Default,
    /// ANSI-256 palette index
    Palette(u8),
    Rgb(u8, u8, u8),
}

impl From<vt100::Color> for Color {
    fn from(c: vt100::Color) -> Self {
        match c {
            vt100::Color::Default => Color::Default,
            vt100::Color::Idx(i) => Color::Palette(i),
            vt100::Color::Rgb(r, g, b) => Color::Rgb(r, g, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Cell text, empty for blank cells and wide-character continuations
    pub text: String,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
    /// Right half of a double-width character
    pub wide_continuation: bool,
}

impl Cell {
    pub fn has_contents(&self) -> bool {
        !self.text.is_empty()
    }

    fn from_vt100(cell: &vt100::Cell) -> Self {
        Self {
            text: cell.contents(),
            fg: cell.fgcolor().into(),
            bg: cell.bgcolor().into(),
            bold: cell.bold(),
            italic: cell.italic(),
            underline: cell.underline(),
            inverse: cell.inverse(),
            wide_continuation: cell.is_wide_continuation(),
        }
    }
}

/// Which part of the buffer to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferScope {
    /// Only the visible rows
    #[default]
    Viewport,
    /// Scrollback followed by the visible rows
    Full,
}

/// Owned copy of a region of the terminal buffer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grid {
    pub rows: Vec<Vec<Cell>>,
    /// Absolute buffer row of the first viewport row
    pub base_y: usize,
}

impl Grid {
    /// Text of each row with blank cells rendered as spaces.
    pub fn text_rows(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|c| !c.wide_continuation)
                    .map(|c| if c.has_contents() { c.text.as_str() } else { " " })
                    .collect()
            })
            .collect()
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<&Cell> {
        self.rows.get(y).and_then(|row| row.get(x))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: u16,
    /// Row within the viewport
    pub y: u16,
    /// Absolute buffer row of the first viewport row
    pub base_y: usize,
}

/// Anything that can be read as a terminal screen
pub trait ScreenSource: Send + Sync {
    fn grid(&self, scope: BufferScope) -> Grid;
    fn cursor(&self) -> CursorPosition;
    /// (rows, cols) of the viewport
    fn size(&self) -> (u16, u16);
}

/// Terminal state fed from PTY output
pub struct VirtualScreen {
    state: Mutex<ScreenState>,
}

struct ScreenState {
    parser: vt100::Parser,
    /// Scrollback rows, oldest first. Cleared whenever output or size changes.
    history: Option<Vec<Vec<Cell>>>,
}

impl VirtualScreen {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            state: Mutex::new(ScreenState {
                parser: vt100::Parser::new(rows, cols, SCROLLBACK_LINES),
                history: None,
            }),
        }
    }

    pub fn process(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.parser.process(bytes);
        state.history = None;
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        let mut state = self.lock();
        state.parser.set_size(rows, cols);
        state.history = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScreenState> {
        // A panic while holding the parser leaves no partial state worth rejecting
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_row(screen: &vt100::Screen, row: u16, cols: u16) -> Vec<Cell> {
    (0..cols)
        .map(|col| screen.cell(row, col).map(Cell::from_vt100).unwrap_or_default())
        .collect()
}

fn scrollback_len(parser: &mut vt100::Parser) -> usize {
    parser.set_scrollback(usize::MAX);
    let len = parser.screen().scrollback();
    parser.set_scrollback(0);
    len
}

/// Read the scrollback a viewport at a time, oldest line first.
fn read_history(parser: &mut vt100::Parser) -> Vec<Vec<Cell>> {
    let total = scrollback_len(parser);
    let mut rows = Vec::with_capacity(total);
    // Scrolled back by `pos`, the top viewport row is buffer line `total - pos`
    let mut pos = total;
    while pos > 0 {
        parser.set_scrollback(pos);
        let screen = parser.screen();
        let (height, cols) = screen.size();
        let take = usize::from(height).max(1).min(pos);
        for row in 0..take {
            rows.push(read_row(screen, row as u16, cols));
        }
        pos -= take;
    }
    parser.set_scrollback(0);
    rows
}

impl ScreenSource for VirtualScreen {
    fn grid(&self, scope: BufferScope) -> Grid {
        let mut state = self.lock();
        let ScreenState { parser, history } = &mut *state;
        let scrollback = scrollback_len(parser);

        let mut rows = Vec::new();
        if scope == BufferScope::Full {
            let cached = history.get_or_insert_with(|| read_history(parser));
            rows.extend(cached.iter().cloned());
        }

        let screen = parser.screen();
        let (height, cols) = screen.size();
        for row in 0..height {
            rows.push(read_row(screen, row, cols));
        }

        Grid {
            rows,
            base_y: scrollback,
        }
    }

    fn cursor(&self) -> CursorPosition {
        let mut state = self.lock();
        let base_y = scrollback_len(&mut state.parser);
        let (y, x) = state.parser.screen().cursor_position();
        CursorPosition { x, y, base_y }
    }

    fn size(&self) -> (u16, u16) {
        self.lock().parser.screen().size()
    }
}
