use std::sync::Arc;

use crate::bitmap::BitmapResult;
use crate::decode::RegionDecoder;
use crate::error::DecodeError;
use crate::key::RequestKey;

use super::grid::{TileGrid, TilePlan, TileSpec, Viewport};

/// A resolved deep-zoom source: the region decoder plus its tile grid.
///
/// The grid (and its texture dimension) is computed once, when the source's
/// size becomes known.
#[derive(Debug, Clone)]
pub struct DeepZoomView {
    source: Arc<BitmapResult>,
    grid: TileGrid,
}

impl DeepZoomView {
    /// Wrap a loaded source. Returns `None` unless it carries a region decoder.
    pub fn new(source: Arc<BitmapResult>) -> Option<Self> {
        let size = source.region_decoder()?.size();
        Some(Self {
            grid: TileGrid::new(size),
            source,
        })
    }

    /// Like [`DeepZoomView::new`], but reports a non deep-zoom source as an error.
    pub fn try_new(source: Arc<BitmapResult>) -> Result<Self, DecodeError> {
        let key = source.key().to_string();
        Self::new(source).ok_or(DecodeError::NotDeepZoom { key })
    }

    pub fn key(&self) -> &RequestKey {
        self.source.key()
    }

    pub fn source(&self) -> &Arc<BitmapResult> {
        &self.source
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn plan(&self, viewport: &Viewport) -> TilePlan {
        self.grid.plan(self.key(), viewport)
    }

    pub(crate) fn decoder(&self) -> Option<Arc<dyn RegionDecoder>> {
        self.source.region_decoder().cloned()
    }
}

/// Decode one planned tile into a still result keyed by the tile key.
pub fn decode_tile(
    decoder: &dyn RegionDecoder,
    spec: &TileSpec,
    source: &BitmapResult,
) -> Result<BitmapResult, DecodeError> {
    let image = decoder.decode_region(spec.source, spec.sample_size)?;
    Ok(BitmapResult::still(
        spec.key.clone(),
        image,
        source.loaded_from(),
    ))
}
