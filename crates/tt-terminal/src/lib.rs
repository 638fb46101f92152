// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// Terminal collaborator for tui-test
//
// A `Terminal` runs one shell or program under a PTY. Its output is parsed by
// vt100 into a `VirtualScreen`, which locators read through `ScreenSource`.

pub mod keys;
pub mod pty;
pub mod screen;
pub mod trace;

pub use keys::Key;
pub use pty::{Terminal, TerminalOptions, SHELL_PROMPT};
pub use screen::{BufferScope, Cell, Color, CursorPosition, Grid, ScreenSource, VirtualScreen};
pub use trace::{Trace, TraceError, TracePoint, TraceRecorder};

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("unable to spawn terminal, unable to resolve file '{0}' from PATH")]
    ProgramNotFound(String),
    #[error("{0}")]
    Pty(String),
    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error("terminal is closed")]
    Closed,
}

pub type TerminalResult<T> = Result<T, TerminalError>;
