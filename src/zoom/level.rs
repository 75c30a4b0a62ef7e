//! Zoom level arithmetic.
//!
//! At level `L` the base texture square (edge `texture_dim`) is split into
//! `2^L x 2^L` cells of edge `texture_dim / 2^L` source pixels. Each cell is
//! decoded at a power-of-two sample size that brings it down to at most
//! [`TILE_DIM`] pixels.

use crate::geometry::Size;

/// Edge length of a decoded tile, in pixels.
pub const TILE_DIM: u32 = 512;

/// Edge of the smallest `TILE_DIM * 2^k` square that contains `image`.
///
/// Images no larger than [`TILE_DIM`] on both axes get `TILE_DIM`.
pub fn texture_dim(image: Size) -> u32 {
    let longest = image.width.max(image.height);
    let mut dim = TILE_DIM;
    while dim < longest && dim < (1 << 31) {
        dim <<= 1;
    }
    dim
}

/// Deepest usable level for a texture: cells never get smaller than one pixel.
pub fn max_level(texture_dim: u32) -> u32 {
    texture_dim.trailing_zeros()
}

/// Smallest level whose grid gives at least one source pixel per destination
/// pixel when `bounds` is drawn at `zoom`.
///
/// `ceil(max(log2(zoom * w / TILE_DIM), log2(zoom * h / TILE_DIM)))`, clamped
/// at 0. Non-finite or non-positive inputs select level 0.
pub fn select_level(bounds: Size, zoom: f64) -> u32 {
    let zoom_width = zoom * bounds.width as f64;
    let zoom_height = zoom * bounds.height as f64;

    let tile = TILE_DIM as f64;
    let level = (zoom_width / tile).log2().max((zoom_height / tile).log2()).ceil();

    if !level.is_finite() || level <= 0.0 {
        return 0;
    }
    level.min(31.0) as u32
}

/// Smallest power-of-two subsampling that brings a cell of
/// `texture_tile_dim` source pixels down to at most [`TILE_DIM`].
pub fn sample_size(texture_tile_dim: u32) -> u32 {
    let mut sample = 1u32;
    while texture_tile_dim / sample > TILE_DIM {
        sample <<= 1;
    }
    sample
}
