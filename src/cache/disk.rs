//! Disk cache adapter.
//!
//! Thin layer over a [`PersistentStore`] that speaks in request keys and
//! decoded images:
//!
//! - [`DiskCache::write_through`] encodes an image and writes it under a scoped
//!   edit (payload in slot 0, the key in every metadata slot), committing only
//!   once every slot is written
//! - [`DiskCache::load`] reads an entry back as a [`BitmapResult`]; unreadable
//!   entries are removed and reported as a miss

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

use crate::bitmap::{BitmapResult, LoadedFrom};
use crate::decode::decode_whole;
use crate::error::CacheError;
use crate::key::RequestKey;

use super::store::{Editor, PersistentStore};

/// Slot holding the encoded image.
pub const PAYLOAD_SLOT: usize = 0;

/// JPEG quality for persisted opaque images.
pub const PERSISTED_JPEG_QUALITY: u8 = 100;

/// Request-keyed view of a persistent store.
#[derive(Clone)]
pub struct DiskCache {
    store: Arc<dyn PersistentStore>,
    slot_count: usize,
}

impl DiskCache {
    /// Wrap `store`, whose entries have `slot_count` slots (at least 1).
    pub fn new(store: Arc<dyn PersistentStore>, slot_count: usize) -> Self {
        Self {
            store,
            slot_count: slot_count.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    /// Read the raw payload stored for `key`.
    ///
    /// A corrupt entry is removed and reported as `Ok(None)`.
    pub fn read(&self, key: &RequestKey) -> Result<Option<Bytes>, CacheError> {
        match self.store.open(key.as_str()) {
            Ok(Some(snapshot)) => match snapshot.slot(PAYLOAD_SLOT) {
                Some(payload) => Ok(Some(payload.clone())),
                None => {
                    self.invalidate(key, "missing payload slot");
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(CacheError::Corrupt { message, .. }) => {
                self.invalidate(key, &message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read and decode the entry for `key`.
    ///
    /// Any failure (I/O, corrupt entry, undecodable payload) is a miss; an
    /// entry that cannot be decoded is removed so the next request recomputes it.
    pub fn load(&self, key: &RequestKey) -> Option<BitmapResult> {
        let payload = match self.read(key) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "disk cache read failed");
                return None;
            }
        };

        match decode_whole(&payload, false) {
            Ok(decoded) => {
                let image = decoded.frames.into_iter().next()?.image().clone();
                debug!(key = %key, "disk cache hit");
                Some(BitmapResult::still(key.clone(), image, LoadedFrom::DiskCache))
            }
            Err(e) => {
                self.invalidate(key, &e.to_string());
                None
            }
        }
    }

    /// Encode `image` and persist it under `key`.
    ///
    /// The entry is written under a single edit and committed only after the
    /// payload and every metadata slot are staged; any failure aborts the edit.
    /// Returns the encoded payload.
    pub fn write_through(
        &self,
        key: &RequestKey,
        image: &DynamicImage,
    ) -> Result<Bytes, CacheError> {
        let payload = encode_bitmap(key, image)?;

        let mut editor = self
            .store
            .edit(key.as_str())?
            .ok_or_else(|| CacheError::Busy(key.to_string()))?;

        match stage_entry(editor.as_mut(), key, &payload, self.slot_count) {
            Ok(()) => editor.commit()?,
            Err(e) => {
                editor.abort();
                return Err(e);
            }
        }
        Ok(payload)
    }

    /// Remove the entry for `key`.
    pub fn remove(&self, key: &RequestKey) -> Result<bool, CacheError> {
        self.store.remove(key.as_str())
    }

    fn invalidate(&self, key: &RequestKey, reason: &str) {
        warn!(key = %key, reason, "removing unreadable disk cache entry");
        if let Err(e) = self.store.remove(key.as_str()) {
            warn!(key = %key, error = %e, "failed to remove disk cache entry");
        }
    }
}

fn stage_entry(
    editor: &mut dyn Editor,
    key: &RequestKey,
    payload: &[u8],
    slot_count: usize,
) -> Result<(), CacheError> {
    for slot in 1..slot_count {
        editor.write(slot, key.as_str().as_bytes())?;
    }
    editor.write(PAYLOAD_SLOT, payload)
}

/// Encode an image for persistence: PNG when it has alpha, JPEG otherwise.
pub fn encode_bitmap(key: &RequestKey, image: &DynamicImage) -> Result<Bytes, CacheError> {
    let write_error = |e: image::ImageError| CacheError::Write {
        key: key.to_string(),
        message: e.to_string(),
    };

    let mut out = Vec::new();
    if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(write_error)?;
    } else {
        let rgb = image.to_rgb8();
        JpegEncoder::new_with_quality(&mut out, PERSISTED_JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(write_error)?;
    }
    Ok(Bytes::from(out))
}
