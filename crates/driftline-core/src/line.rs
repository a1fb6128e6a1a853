//! Freehand line records.

use kurbo::Point;
use serde::{Deserialize, Serialize};

/// Identifier of a line: creation time in milliseconds, in decimal.
pub type LineId = String;

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Colors handed out to participants.
pub const PALETTE: [Color; 8] = [
    Color::rgb(0xff, 0x80, 0x80),
    Color::rgb(0xff, 0xbf, 0x40),
    Color::rgb(0xe0, 0xe0, 0x40),
    Color::rgb(0x80, 0xd0, 0x80),
    Color::rgb(0x40, 0xc0, 0xd0),
    Color::rgb(0x60, 0x90, 0xff),
    Color::rgb(0xb0, 0x80, 0xff),
    Color::rgb(0xff, 0x80, 0xd0),
];

impl Color {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    pub fn black() -> Self {
        Self::rgb(0, 0, 0)
    }

    /// Pick a palette color from arbitrary seed bytes (e.g. a participant id).
    pub fn from_seed(seed: &[u8]) -> Self {
        let sum = seed.iter().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as usize));
        PALETTE[sum % PALETTE.len()]
    }

    /// Format as `#rrggbb`, or `#rrggbbaa` when not opaque.
    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }

    /// Parse `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        let channel = |i: usize| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok();
        match digits.len() {
            6 => Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?)),
            8 => Some(Self::new(channel(0)?, channel(2)?, channel(4)?, channel(6)?)),
            _ => None,
        }
    }
}

/// One stroke: a polyline drawn by a single participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    /// Points in canvas space, in drawing order.
    pub points: Vec<Point>,
    /// Color of the author at creation time.
    pub user_color: Color,
    /// Set once the author releases the pointer.
    pub is_complete: bool,
}

impl Line {
    /// Start a new, open line from its first point.
    pub fn new(id: LineId, first: Point, user_color: Color) -> Self {
        Self {
            id,
            points: vec![first],
            user_color,
            is_complete: false,
        }
    }

    /// Get the number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the line has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Hands out line ids that stay unique within one authoring session even
/// when two lines start within the same millisecond.
#[derive(Debug, Clone, Default)]
pub struct LineIds {
    last: i64,
}

impl LineIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for a line created at `now_ms` (Unix milliseconds).
    pub fn next_at(&mut self, now_ms: i64) -> LineId {
        let id = now_ms.max(self.last + 1);
        self.last = id;
        id.to_string()
    }
}
