//! Core value types shared by the configuration, the client boundary and the
//! engine.
//!
//! # Main Types
//!
//! - [`StreamKind`] - Client-visible output streams a request can ask for
//! - [`StreamConfig`] - Configured size and pixel format of a stream
//! - [`Size`] / [`Rect`] - Geometry used by the per-frame node-group snapshot
//! - [`PixelFormat`] - Output pixel layouts understood by the scaler ports

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width/height pair in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned rectangle in sensor coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Full-frame rectangle for the given size
    pub const fn full(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Whether this rectangle is non-empty and lies inside `bounds`
    pub fn fits_within(&self, bounds: Size) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= bounds.width as u64
            && self.y as u64 + self.height as u64 <= bounds.height as u64
    }
}

/// Pixel layouts the scaler output ports can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Bayer raw, 10-bit packed
    #[default]
    Raw10,
    /// Bayer raw, 16-bit unpacked
    Raw16,
    /// Semi-planar YUV 4:2:0
    Nv21,
    /// Semi-planar YUV 4:2:0 (UV order)
    Nv12,
    /// Packed YUV 4:2:2
    Yuyv,
}

impl PixelFormat {
    pub fn is_raw(&self) -> bool {
        matches!(self, PixelFormat::Raw10 | PixelFormat::Raw16)
    }
}

/// Client-visible output streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Display preview
    Preview,
    /// YUV callback for the application
    Callback,
    /// Recording stream
    Video,
    /// Raw sensor output delivered to the client
    Raw,
    /// High-quality still produced by the reprocessing path
    Still,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Preview,
        StreamKind::Callback,
        StreamKind::Video,
        StreamKind::Raw,
        StreamKind::Still,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Preview => "preview",
            StreamKind::Callback => "callback",
            StreamKind::Video => "video",
            StreamKind::Raw => "raw",
            StreamKind::Still => "still",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configured geometry and format of one client stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub kind: StreamKind,
    pub size: Size,
    pub format: PixelFormat,
}

impl StreamConfig {
    pub const fn new(kind: StreamKind, size: Size, format: PixelFormat) -> Self {
        Self { kind, size, format }
    }
}
