//! Decoded image records handed to waiters.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use image::DynamicImage;
use serde::Serialize;

use crate::decode::RegionDecoder;
use crate::geometry::Size;
use crate::key::RequestKey;

/// Shortest delay a frame is displayed for.
pub const MIN_FRAME_DELAY: Duration = Duration::from_millis(100);

/// Length of the fade-in ramp after a result is first drawn.
pub const FADE_DURATION: Duration = Duration::from_millis(200);

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadedFrom {
    /// Served from the memory cache. Reported through `Attached::Ready`; the
    /// shared result keeps the provenance it was produced with
    Memory,

    /// Read back from the persistent store
    DiskCache,

    /// Revalidated by the transport against its own cache
    /// (see [`Fetched::revalidated`](crate::fetch::Fetched::revalidated))
    ConditionalCache,

    /// Fetched fresh by the transport
    Network,
}

/// One frame of an animated image.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<DynamicImage>,
    delay: Duration,
}

impl Frame {
    pub fn new(image: DynamicImage, delay: Duration) -> Self {
        Self {
            image: Arc::new(image),
            delay,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// The frame's raster without copying pixels.
    pub fn shared_image(&self) -> Arc<DynamicImage> {
        self.image.clone()
    }

    /// Delay as decoded, before clamping.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Raster content of a result.
#[derive(Clone)]
pub enum BitmapPayload {
    /// A single decoded image
    Still(Arc<DynamicImage>),

    /// Frames in display order; never mutated after decode
    Animated(Arc<[Frame]>),

    /// Handle for decoding rectangular regions of a very large image
    Region(Arc<dyn RegionDecoder>),
}

impl fmt::Debug for BitmapPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapPayload::Still(img) => write!(f, "Still({}x{})", img.width(), img.height()),
            BitmapPayload::Animated(frames) => write!(f, "Animated({} frames)", frames.len()),
            BitmapPayload::Region(decoder) => {
                let size = decoder.size();
                write!(f, "Region({}x{})", size.width, size.height)
            }
        }
    }
}

/// A decoded image record.
///
/// Produced once per successful pipeline run and shared read-only by every
/// waiter through an `Arc`. The only mutable state is the materialized-at
/// stamp, which is set at most once.
#[derive(Debug)]
pub struct BitmapResult {
    key: RequestKey,
    payload: BitmapPayload,
    original_size: Size,
    loaded_from: LoadedFrom,
    materialized_at: OnceLock<Instant>,
}

impl BitmapResult {
    pub fn new(
        key: RequestKey,
        payload: BitmapPayload,
        original_size: Size,
        loaded_from: LoadedFrom,
    ) -> Self {
        Self {
            key,
            payload,
            original_size,
            loaded_from,
            materialized_at: OnceLock::new(),
        }
    }

    /// Result holding a single image; the original size is the image size.
    pub fn still(key: RequestKey, image: DynamicImage, loaded_from: LoadedFrom) -> Self {
        let size = Size::new(image.width(), image.height());
        Self::new(
            key,
            BitmapPayload::Still(Arc::new(image)),
            size,
            loaded_from,
        )
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn payload(&self) -> &BitmapPayload {
        &self.payload
    }

    /// Pixel dimensions of the source before any sampling.
    pub fn original_size(&self) -> Size {
        self.original_size
    }

    pub fn loaded_from(&self) -> LoadedFrom {
        self.loaded_from
    }

    /// The still image, or the first frame of an animation.
    pub fn image(&self) -> Option<&DynamicImage> {
        match &self.payload {
            BitmapPayload::Still(img) => Some(img),
            BitmapPayload::Animated(frames) => frames.first().map(Frame::image),
            BitmapPayload::Region(_) => None,
        }
    }

    pub fn frame_count(&self) -> usize {
        match &self.payload {
            BitmapPayload::Still(_) => 1,
            BitmapPayload::Animated(frames) => frames.len(),
            BitmapPayload::Region(_) => 0,
        }
    }

    /// Frame shown at an externally owned animation cursor (`cursor mod len`).
    pub fn frame_at(&self, cursor: usize) -> Option<&Frame> {
        match &self.payload {
            BitmapPayload::Animated(frames) if !frames.is_empty() => {
                Some(&frames[cursor % frames.len()])
            }
            _ => None,
        }
    }

    /// How long the frame at `cursor` stays on screen.
    pub fn frame_delay(&self, cursor: usize) -> Option<Duration> {
        self.frame_at(cursor)
            .map(|frame| frame.delay().max(MIN_FRAME_DELAY))
    }

    pub fn region_decoder(&self) -> Option<&Arc<dyn RegionDecoder>> {
        match &self.payload {
            BitmapPayload::Region(decoder) => Some(decoder),
            _ => None,
        }
    }

    pub fn has_alpha(&self) -> bool {
        self.image().map(|img| img.color().has_alpha()).unwrap_or(false)
    }

    /// Approximate resident size, used for memory-cache accounting.
    pub fn byte_size(&self) -> usize {
        match &self.payload {
            BitmapPayload::Still(img) => img.as_bytes().len(),
            BitmapPayload::Animated(frames) => {
                frames.iter().map(|f| f.image().as_bytes().len()).sum()
            }
            BitmapPayload::Region(decoder) => decoder.memory_size(),
        }
    }

    /// Stamp the first time this result is drawn and return the stamp.
    ///
    /// Later calls return the original stamp.
    pub fn mark_drawn(&self, now: Instant) -> Instant {
        *self.materialized_at.get_or_init(|| now)
    }

    pub fn materialized_at(&self) -> Option<Instant> {
        self.materialized_at.get().copied()
    }

    /// Fade-in alpha (0..=255) at `now`, fully opaque once the ramp is over
    /// or if the result was never drawn.
    pub fn fade_alpha(&self, now: Instant) -> u8 {
        let Some(start) = self.materialized_at() else {
            return 0xFF;
        };
        let elapsed = now.saturating_duration_since(start).as_millis();
        let alpha = (elapsed << 8) / FADE_DURATION.as_millis();
        alpha.min(0xFF) as u8
    }
}
