// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// Key sequences sent to the PTY
// See https://invisible-island.net/xterm/ctlseqs/ctlseqs.html

pub const ESC: &str = "\x1b";
pub const CSI: &str = "\x1b[";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Up,
    Down,
    Left,
    Right,
    Escape,
    Delete,
    Backspace,
    CtrlC,
    CtrlD,
    Enter,
}

impl Key {
    pub fn sequence(&self) -> &'static str {
        match self {
            Key::Up => "\x1b[A",
            Key::Down => "\x1b[B",
            Key::Right => "\x1b[C",
            Key::Left => "\x1b[D",
            Key::Escape => ESC,
            Key::Delete => "\x1b[3~",
            Key::Backspace => "\x7f",
            Key::CtrlC => "\x03",
            Key::CtrlD => "\x04",
            Key::Enter => "\r",
        }
    }

    /// The sequence repeated `times` times.
    pub fn repeated(&self, times: usize) -> String {
        self.sequence().repeat(times)
    }
}

/// Move the cursor to zero-based column `x`, row `y`.
pub fn cursor_to(x: u16, y: u16) -> String {
    format!("{CSI}{};{}H", y + 1, x + 1)
}

pub const CLEAR_SCREEN: &str = "\x1b[2J";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_and_cursor() {
        assert_eq!(Key::Left.repeated(3), "\x1b[D\x1b[D\x1b[D");
        assert_eq!(Key::CtrlC.repeated(0), "");
        assert_eq!(cursor_to(0, 0), "\x1b[1;1H");
        assert_eq!(cursor_to(4, 9), "\x1b[10;5H");
    }
}
