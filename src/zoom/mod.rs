//! Deep-zoom engine.
//!
//! Decides, per draw, which tiles of a very large image are visible and at
//! what resolution they must be decoded.
//!
//! # Algorithm
//!
//! ```text
//! 1. zoomWidth  = zoom * bounds.width,  zoomHeight = zoom * bounds.height
//! 2. L          = ceil(max(log2(zoomWidth / D), log2(zoomHeight / D))), L >= 0
//! 3. cells      = 2^L per side, each texture_dim / 2^L source pixels
//! 4. skip cells whose destination rectangle misses the visible rectangle
//! 5. tile key   = base key + (L, x, y); decode at the smallest power-of-two
//!                 sample size that brings a cell down to D pixels
//! ```
//!
//! `D` is [`TILE_DIM`]. Fetching and dedup of tile decodes is done by the
//! loader; this module is pure geometry plus the tile decode step.

mod grid;
mod level;
mod view;

pub use grid::{TileGrid, TilePlan, TileSpec, Viewport};
pub use level::{max_level, sample_size, select_level, texture_dim, TILE_DIM};
pub use view::{decode_tile, DeepZoomView};
