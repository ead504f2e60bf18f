//! Background Colour Resolution
//!
//! Symbolic and hex colours are resolved to a primitive RGBA tuple before
//! they reach the transform hash, so `red`, `#f00` and `#ff0000` share a key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive RGBA colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.r, self.g, self.b, self.a)
    }
}

const NAMED_COLORS: &[(&str, Rgba)] = &[
    ("transparent", Rgba::new(0, 0, 0, 0)),
    ("black", Rgba::opaque(0, 0, 0)),
    ("white", Rgba::opaque(255, 255, 255)),
    ("red", Rgba::opaque(255, 0, 0)),
    ("green", Rgba::opaque(0, 128, 0)),
    ("lime", Rgba::opaque(0, 255, 0)),
    ("blue", Rgba::opaque(0, 0, 255)),
    ("yellow", Rgba::opaque(255, 255, 0)),
    ("cyan", Rgba::opaque(0, 255, 255)),
    ("magenta", Rgba::opaque(255, 0, 255)),
    ("gray", Rgba::opaque(128, 128, 128)),
    ("grey", Rgba::opaque(128, 128, 128)),
    ("silver", Rgba::opaque(192, 192, 192)),
    ("orange", Rgba::opaque(255, 165, 0)),
    ("purple", Rgba::opaque(128, 0, 128)),
    ("navy", Rgba::opaque(0, 0, 128)),
];

/// Resolve a colour expression; `None` if it is not recognised
///
/// Accepts named colours, `#rgb`, `#rgba`, `#rrggbb`, `#rrggbbaa` (with or
/// without `#`) and `r,g,b[,a]` / `rgb(...)` / `rgba(...)` forms.
pub fn resolve_color(input: &str) -> Option<Rgba> {
    let value = input.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }

    if let Some((_, rgba)) = NAMED_COLORS.iter().find(|(name, _)| *name == value) {
        return Some(*rgba);
    }

    let inner = value
        .strip_prefix("rgba(")
        .or_else(|| value.strip_prefix("rgb("))
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(&value);
    if inner.contains(',') {
        return parse_components(inner);
    }

    parse_hex(value.strip_prefix('#').unwrap_or(&value))
}

fn parse_components(list: &str) -> Option<Rgba> {
    let parts: Vec<&str> = list.split(',').map(str::trim).collect();
    let channel = |s: &str| s.parse::<u8>().ok();
    match parts.as_slice() {
        [r, g, b] => Some(Rgba::opaque(channel(r)?, channel(g)?, channel(b)?)),
        [r, g, b, a] => {
            // Alpha may be 0-255 or a 0.0-1.0 fraction
            let alpha = match a.parse::<u8>() {
                Ok(v) if !a.contains('.') => v,
                _ => {
                    let f: f64 = a.parse().ok()?;
                    if !(0.0..=1.0).contains(&f) {
                        return None;
                    }
                    (f * 255.0).round() as u8
                }
            };
            Some(Rgba::new(channel(r)?, channel(g)?, channel(b)?, alpha))
        }
        _ => None,
    }
}

fn parse_hex(hex: &str) -> Option<Rgba> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let nibble = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    match hex.len() {
        3 => Some(Rgba::opaque(nibble(0)?, nibble(1)?, nibble(2)?)),
        4 => Some(Rgba::new(nibble(0)?, nibble(1)?, nibble(2)?, nibble(3)?)),
        6 => Some(Rgba::opaque(byte(0)?, byte(2)?, byte(4)?)),
        8 => Some(Rgba::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
        _ => None,
    }
}
