//! Tile grid planning.
//!
//! Three coordinate spaces are involved:
//!
//! ```text
//! texture space   [0, texture_dim)²       cells of texture_tile_dim
//!      │ clip to image
//!      ▼
//! source space    [0, width) x [0, height) what the region decoder reads
//!      │ scale by bounds / image
//!      ▼
//! dest space      [0, bounds.w) x [0, bounds.h) where tiles are drawn
//! ```
//!
//! Only cells whose destination rectangle overlaps the visible rectangle are
//! planned. The candidate range is derived from the visible rectangle, so the
//! cost of a plan is proportional to the visible tiles, not to `4^level`.

use serde::Serialize;

use crate::geometry::{Rect, Size};
use crate::key::RequestKey;

use super::level::{max_level, sample_size, select_level, texture_dim};

/// What the caller is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    /// Size the whole image is drawn at, in destination pixels
    pub bounds: Size,

    /// Visible part of `bounds`, in destination pixels
    pub visible: Rect,

    /// Destination pixels per drawn pixel (the canvas zoom factor)
    pub zoom: f64,
}

impl Viewport {
    pub fn new(bounds: Size, visible: Rect, zoom: f64) -> Self {
        Self {
            bounds,
            visible,
            zoom,
        }
    }

    /// Everything visible at zoom 1.
    pub fn full(bounds: Size) -> Self {
        Self::new(bounds, Rect::from_size(bounds), 1.0)
    }
}

/// One visible cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileSpec {
    pub key: RequestKey,
    pub level: u32,
    pub x: u32,
    pub y: u32,

    /// Region to decode, in source pixels
    pub source: Rect,

    /// Where the tile is drawn, in destination pixels
    pub dest: Rect,

    /// Power-of-two subsampling for the region decode
    pub sample_size: u32,
}

/// Tiles needed for one viewport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TilePlan {
    pub level: u32,
    pub level_tiles: u32,
    pub texture_dim: u32,
    pub texture_tile_dim: u32,
    pub sample_size: u32,
    pub tiles: Vec<TileSpec>,
}

/// Tile layout of one deep-zoom image, fixed once its size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    image_size: Size,
    texture_dim: u32,
}

impl TileGrid {
    pub fn new(image_size: Size) -> Self {
        Self {
            image_size,
            texture_dim: texture_dim(image_size),
        }
    }

    pub fn image_size(&self) -> Size {
        self.image_size
    }

    pub fn texture_dim(&self) -> u32 {
        self.texture_dim
    }

    pub fn max_level(&self) -> u32 {
        max_level(self.texture_dim)
    }

    /// Work out which tiles of the image are visible in `viewport`.
    ///
    /// A visible rectangle entirely outside the bounds yields no tiles.
    pub fn plan(&self, base_key: &RequestKey, viewport: &Viewport) -> TilePlan {
        let level = select_level(viewport.bounds, viewport.zoom).min(self.max_level());
        let level_tiles = 1u32 << level;
        let texture_tile_dim = self.texture_dim >> level;
        let sample_size = sample_size(texture_tile_dim);

        let mut plan = TilePlan {
            level,
            level_tiles,
            texture_dim: self.texture_dim,
            texture_tile_dim,
            sample_size,
            tiles: Vec::new(),
        };

        if self.image_size.is_empty() || viewport.bounds.is_empty() {
            return plan;
        }
        let Some(visible) = viewport.visible.intersect(&Rect::from_size(viewport.bounds)) else {
            return plan;
        };

        let image = Rect::from_size(self.image_size);
        let sx = viewport.bounds.width as f64 / self.image_size.width as f64;
        let sy = viewport.bounds.height as f64 / self.image_size.height as f64;

        // Visible region mapped back to source pixels bounds the candidate cells
        let visible_source = visible.scale(1.0 / sx, 1.0 / sy);
        let cell = texture_tile_dim as i64;
        let cells = |lo: i64, hi: i64| {
            let first = (lo / cell).clamp(0, level_tiles as i64);
            let last = ((hi + cell - 1) / cell).clamp(0, level_tiles as i64);
            first as u32..last as u32
        };

        for y in cells(visible_source.top, visible_source.bottom) {
            for x in cells(visible_source.left, visible_source.right) {
                let texture = Rect::from_xywh(x as i64 * cell, y as i64 * cell, cell, cell);
                let Some(source) = texture.intersect(&image) else {
                    continue;
                };
                let dest = source.scale(sx, sy);
                if !dest.intersects(&visible) {
                    continue;
                }
                plan.tiles.push(TileSpec {
                    key: base_key.tile(level, x, y),
                    level,
                    x,
                    y,
                    source,
                    dest,
                    sample_size,
                });
            }
        }
        plan
    }
}
