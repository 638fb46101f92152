// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Colour expectations and ANSI-256 conversions

use tt_terminal::Color;

/// xterm values of the 16 system colours
const SYSTEM_COLORS: [[u8; 3]; 16] = [
    [0, 0, 0],
    [128, 0, 0],
    [0, 128, 0],
    [128, 128, 0],
    [0, 0, 128],
    [128, 0, 128],
    [0, 128, 128],
    [192, 192, 192],
    [128, 128, 128],
    [255, 0, 0],
    [0, 255, 0],
    [255, 255, 0],
    [0, 0, 255],
    [255, 0, 255],
    [0, 255, 255],
    [255, 255, 255],
];

pub fn ansi256_to_rgb(index: u8) -> [u8; 3] {
    match index {
        0..=15 => SYSTEM_COLORS[index as usize],
        16..=231 => {
            let n = index - 16;
            let level = |v: u8| ((v as u16 * 255) / 5) as u8;
            [level(n / 36), level((n % 36) / 6), level(n % 6)]
        }
        _ => {
            let v = (index - 232) * 10 + 8;
            [v, v, v]
        }
    }
}

pub fn rgb_to_ansi256([r, g, b]: [u8; 3]) -> u8 {
    if r == g && g == b {
        if r < 8 {
            return 16;
        }
        if r > 248 {
            return 231;
        }
        return (((r as f64 - 8.0) / 247.0) * 24.0).round() as u8 + 232;
    }
    let scale = |v: u8| (v as f64 / 255.0 * 5.0).round() as u8;
    16 + 36 * scale(r) + 6 * scale(g) + scale(b)
}

/// Parse `#rrggbb` or `rrggbb`.
pub fn parse_hex(hex: &str) -> Option<[u8; 3]> {
    let digits = hex.strip_prefix('#').unwrap_or(hex);
    if digits.len() != 6 || !digits.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// Colour a cell is expected to have
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedColor {
    Ansi(u8),
    Rgb([u8; 3]),
    Hex(String),
}

impl From<u8> for ExpectedColor {
    fn from(i: u8) -> Self {
        ExpectedColor::Ansi(i)
    }
}

impl From<[u8; 3]> for ExpectedColor {
    fn from(rgb: [u8; 3]) -> Self {
        ExpectedColor::Rgb(rgb)
    }
}

impl From<(u8, u8, u8)> for ExpectedColor {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        ExpectedColor::Rgb([r, g, b])
    }
}

impl From<&str> for ExpectedColor {
    fn from(hex: &str) -> Self {
        ExpectedColor::Hex(hex.to_string())
    }
}

impl std::fmt::Display for ExpectedColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedColor::Ansi(i) => write!(f, "{i}"),
            ExpectedColor::Rgb([r, g, b]) => write!(f, "[{r},{g},{b}]"),
            ExpectedColor::Hex(h) => f.write_str(h),
        }
    }
}

impl ExpectedColor {
    pub fn matches(&self, actual: Color) -> bool {
        match self {
            ExpectedColor::Ansi(expected) => match actual {
                Color::Default => *expected == 0,
                Color::Palette(i) => i == *expected,
                Color::Rgb(r, g, b) => [r, g, b] == ansi256_to_rgb(*expected),
            },
            ExpectedColor::Rgb(expected) => rgb_matches(*expected, actual),
            ExpectedColor::Hex(hex) => parse_hex(hex).is_some_and(|rgb| rgb_matches(rgb, actual)),
        }
    }

    /// `actual` rendered in the same notation as this expectation.
    pub fn describe(&self, actual: Color) -> String {
        let rgb = match actual {
            Color::Default => [0, 0, 0],
            Color::Palette(i) => ansi256_to_rgb(i),
            Color::Rgb(r, g, b) => [r, g, b],
        };
        match self {
            ExpectedColor::Ansi(_) => match actual {
                Color::Default => "0".to_string(),
                Color::Palette(i) => i.to_string(),
                Color::Rgb(..) => rgb_to_ansi256(rgb).to_string(),
            },
            ExpectedColor::Rgb(_) => format!("[{},{},{}]", rgb[0], rgb[1], rgb[2]),
            ExpectedColor::Hex(_) => format!("{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2]),
        }
    }
}

fn rgb_matches(expected: [u8; 3], actual: Color) -> bool {
    match actual {
        Color::Default => expected == [0, 0, 0],
        Color::Palette(i) => i == rgb_to_ansi256(expected),
        Color::Rgb(r, g, b) => [r, g, b] == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette_to_rgb() {
        assert_eq!(ansi256_to_rgb(1), [128, 0, 0]);
        assert_eq!(ansi256_to_rgb(16), [0, 0, 0]);
        assert_eq!(ansi256_to_rgb(196), [255, 0, 0]);
        assert_eq!(ansi256_to_rgb(232), [8, 8, 8]);
        assert_eq!(ansi256_to_rgb(255), [238, 238, 238]);
    }

    #[test]
    fn test_rgb_to_palette() {
        assert_eq!(rgb_to_ansi256([255, 0, 0]), 196);
        assert_eq!(rgb_to_ansi256([0, 0, 0]), 16);
        assert_eq!(rgb_to_ansi256([255, 255, 255]), 231);
        assert_eq!(rgb_to_ansi256([128, 128, 128]), 244);
    }

    #[test]
    fn test_hex_parsing() {
        assert_eq!(parse_hex("#ff0080"), Some([255, 0, 128]));
        assert_eq!(parse_hex("00ff00"), Some([0, 255, 0]));
        assert_eq!(parse_hex("#fff"), None);
        assert_eq!(parse_hex("zzzzzz"), None);
    }

    #[test]
    fn test_default_colour_is_black() {
        assert!(ExpectedColor::Ansi(0).matches(Color::Default));
        assert!(ExpectedColor::Rgb([0, 0, 0]).matches(Color::Default));
        assert!(ExpectedColor::from("#000000").matches(Color::Default));
        assert!(!ExpectedColor::Ansi(1).matches(Color::Default));
    }

    #[test]
    fn test_cross_notation_matching() {
        assert!(ExpectedColor::Ansi(1).matches(Color::Palette(1)));
        assert!(ExpectedColor::Ansi(196).matches(Color::Rgb(255, 0, 0)));
        assert!(ExpectedColor::Rgb([255, 0, 0]).matches(Color::Palette(196)));
        assert!(ExpectedColor::from("#ff0000").matches(Color::Rgb(255, 0, 0)));
        assert!(!ExpectedColor::from("#ff0000").matches(Color::Rgb(254, 0, 0)));
    }

    #[test]
    fn test_describe_uses_expected_notation() {
        assert_eq!(ExpectedColor::Ansi(3).describe(Color::Palette(9)), "9");
        assert_eq!(ExpectedColor::Rgb([0, 0, 0]).describe(Color::Palette(1)), "[128,0,0]");
        assert_eq!(ExpectedColor::from("x").describe(Color::Rgb(1, 2, 255)), "0102ff");
    }
}
