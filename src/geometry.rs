//! Integer rectangles shared by the region decoder and the deep-zoom planner.

use serde::Serialize;

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Half-open rectangle `[left, right) x [top, bottom)`.
///
/// Coordinates are signed so that viewports partly scrolled past the image
/// origin can be represented before clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Rect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Rect {
    pub fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_xywh(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    /// Rectangle anchored at the origin covering `size`.
    pub fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width as i64, size.height as i64)
    }

    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    /// Overlap test; rectangles that only share an edge do not intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// Intersection of two rectangles, or `None` if they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        if !self.intersects(other) {
            return None;
        }
        Some(Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        ))
    }

    /// Scale both axes independently, rounding outward.
    pub fn scale(&self, sx: f64, sy: f64) -> Rect {
        Rect::new(
            (self.left as f64 * sx).floor() as i64,
            (self.top as f64 * sy).floor() as i64,
            (self.right as f64 * sx).ceil() as i64,
            (self.bottom as f64 * sy).ceil() as i64,
        )
    }
}
