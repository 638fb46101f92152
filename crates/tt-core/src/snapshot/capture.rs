// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Rendering a screen into snapshot content

use serde::ser::{Serialize, SerializeMap, Serializer};
use tt_terminal::{BufferScope, Cell, Color, ScreenSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Default,
    Palette,
    Rgb,
}

fn color_parts(color: Color) -> (ColorMode, u32) {
    match color {
        Color::Default => (ColorMode::Default, 0),
        Color::Palette(i) => (ColorMode::Palette, i as u32),
        Color::Rgb(r, g, b) => (ColorMode::Rgb, (r as u32) << 16 | (g as u32) << 8 | b as u32),
    }
}

/// Attributes that changed relative to the previous cell
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CellShift {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_color_mode: Option<ColorMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fg_color_mode: Option<ColorMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fg_color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underline: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse: Option<bool>,
}

impl CellShift {
    pub fn between(prev: &Cell, cur: &Cell) -> Self {
        let mut shift = CellShift::default();
        if prev.bg != cur.bg {
            let (mode, value) = color_parts(cur.bg);
            shift.bg_color_mode = Some(mode);
            shift.bg_color = Some(value);
        }
        if prev.fg != cur.fg {
            let (mode, value) = color_parts(cur.fg);
            shift.fg_color_mode = Some(mode);
            shift.fg_color = Some(value);
        }
        let flag = |a: bool, b: bool| (a != b).then_some(b);
        shift.bold = flag(prev.bold, cur.bold);
        shift.italic = flag(prev.italic, cur.italic);
        shift.underline = flag(prev.underline, cur.underline);
        shift.inverse = flag(prev.inverse, cur.inverse);
        shift
    }

    pub fn is_empty(&self) -> bool {
        *self == CellShift::default()
    }
}

/// Shifts keyed by `"x,y"`, kept in row-major order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shifts(pub Vec<(String, CellShift)>);

impl Serialize for Shifts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, shift) in &self.0 {
            map.serialize_entry(key, shift)?;
        }
        map.end()
    }
}

/// Viewport text in a rounded box, plus the attribute shifts of its cells.
pub fn render(screen: &dyn ScreenSource) -> (String, Shifts) {
    let grid = screen.grid(BufferScope::Viewport);
    let (_, cols) = screen.size();
    let border = "─".repeat(cols as usize);

    let mut lines = Vec::with_capacity(grid.rows.len() + 2);
    lines.push(format!("╭{border}╮"));
    lines.extend(grid.text_rows().into_iter().map(|row| format!("│{row}│")));
    lines.push(format!("╰{border}╯"));

    let mut shifts = Vec::new();
    let mut prev = Cell::default();
    for (y, row) in grid.rows.iter().enumerate() {
        for (x, cell) in row.iter().enumerate().filter(|(_, c)| !c.wide_continuation) {
            let shift = CellShift::between(&prev, cell);
            if !shift.is_empty() {
                shifts.push((format!("{x},{y}"), shift));
            }
            prev = cell.clone();
        }
    }
    (lines.join("\n"), Shifts(shifts))
}

/// Snapshot content of `screen`.
pub fn capture(screen: &dyn ScreenSource, include_colors: bool) -> String {
    let (view, shifts) = render(screen);
    if !include_colors || shifts.0.is_empty() {
        return view;
    }
    match serde_json::to_string_pretty(&shifts) {
        Ok(json) => format!("{view}\n{json}"),
        Err(_) => view,
    }
}
