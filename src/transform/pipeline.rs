//! Transform pipeline with disk write-through.
//!
//! ```text
//! source BitmapResult ──► step 1 ──► step 2 ──► ... ──► BitmapResult
//!                                                          │
//!                                       (best effort)      ▼
//!                                                 DiskCache::write_through
//! ```
//!
//! A failing step aborts the chain before anything is persisted. A failing
//! write-through is logged and does not fail the request.

use tracing::{debug, warn};

use crate::bitmap::BitmapResult;
use crate::cache::DiskCache;
use crate::error::TransformError;
use crate::key::RequestKey;

use super::TransformChain;

/// Applies transform chains and persists their output.
///
/// Runs on worker tasks; it holds no coordination state.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    disk: Option<DiskCache>,
}

impl TransformPipeline {
    /// Pipeline that writes results through to `disk`, if given.
    pub fn new(disk: Option<DiskCache>) -> Self {
        Self { disk }
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    /// Apply `chain` to `source` and return the result under `key`.
    ///
    /// The first step sees the source's still image (the first frame of an
    /// animation); each later step sees the previous step's output.
    ///
    /// # Errors
    ///
    /// - [`TransformError::UnsupportedSource`] if `source` has no raster
    /// - The first step failure; nothing is written to disk in that case
    pub fn apply(
        &self,
        key: &RequestKey,
        source: &BitmapResult,
        chain: &TransformChain,
    ) -> Result<BitmapResult, TransformError> {
        let image = source
            .image()
            .ok_or_else(|| TransformError::UnsupportedSource {
                key: source.key().to_string(),
            })?
            .clone();

        let output = chain.apply(image)?;
        debug!(
            key = %key,
            steps = chain.len(),
            width = output.width(),
            height = output.height(),
            "transform chain applied"
        );

        if let Some(disk) = &self.disk {
            match disk.write_through(key, &output) {
                Ok(payload) => debug!(key = %key, bytes = payload.len(), "wrote through to disk cache"),
                Err(e) => warn!(key = %key, error = %e, "disk cache write-through failed"),
            }
        }

        Ok(BitmapResult::still(key.clone(), output, source.loaded_from()))
    }
}
