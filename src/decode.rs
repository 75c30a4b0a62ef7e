//! Decode adapter.
//!
//! The pipeline only needs two things from a decoder:
//!
//! - [`decode_whole`]: bytes to an ordered sequence of `(frame, delay)` plus
//!   the image size, for still and animated sources
//! - [`RegionDecoder::decode_region`]: a rectangle of a large source at a
//!   power-of-two subsampling factor, for deep-zoom tiles
//!
//! Both are backed by the `image` crate. Zero frames or an empty region are
//! reported as [`DecodeError`].

use std::io::Cursor;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageFormat};

use crate::bitmap::Frame;
use crate::error::DecodeError;
use crate::geometry::{Rect, Size};

/// How a source should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecodeMode {
    /// First frame only
    #[default]
    Still,

    /// Every GIF frame with its delay; other formats decode as a single frame
    Animated,

    /// Keep a region decoder instead of a raster. GIF sources decode as
    /// [`DecodeMode::Animated`] instead
    DeepZoom,
}

impl DecodeMode {
    /// Stable identifier used in request keys.
    pub fn tag(&self) -> &'static str {
        match self {
            DecodeMode::Still => "still",
            DecodeMode::Animated => "animated",
            DecodeMode::DeepZoom => "deepzoom",
        }
    }
}

/// Whether `bytes` look like a GIF.
pub fn is_gif(bytes: &[u8]) -> bool {
    matches!(image::guess_format(bytes), Ok(ImageFormat::Gif))
}

/// Output of [`decode_whole`].
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub frames: Vec<Frame>,
    pub size: Size,
}

/// Decode a complete image.
///
/// With `animate` set, GIF sources yield every frame; everything else yields
/// exactly one frame with a zero delay.
pub fn decode_whole(bytes: &[u8], animate: bool) -> Result<DecodedImage, DecodeError> {
    let format = image::guess_format(bytes).map_err(malformed)?;

    if animate && format == ImageFormat::Gif {
        let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(malformed)?;
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(malformed)?;
        if frames.is_empty() {
            return Err(DecodeError::NoFrames);
        }

        let frames: Vec<Frame> = frames
            .into_iter()
            .map(|frame| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                let delay_ms = if denom == 0 { 0 } else { numer / denom };
                Frame::new(
                    DynamicImage::ImageRgba8(frame.into_buffer()),
                    Duration::from_millis(delay_ms as u64),
                )
            })
            .collect();
        let first = frames[0].image();
        let size = Size::new(first.width(), first.height());
        return Ok(DecodedImage { frames, size });
    }

    let image = image::load_from_memory_with_format(bytes, format).map_err(malformed)?;
    let size = Size::new(image.width(), image.height());
    if size.is_empty() {
        return Err(DecodeError::NoFrames);
    }
    Ok(DecodedImage {
        frames: vec![Frame::new(image, Duration::ZERO)],
        size,
    })
}

/// Source of rectangular regions of a single large image.
pub trait RegionDecoder: Send + Sync {
    /// Full pixel dimensions of the source.
    fn size(&self) -> Size;

    /// Decode `rect` (in source pixels) downsampled by `sample_size`.
    ///
    /// `sample_size` is a power of two; the output is roughly
    /// `rect / sample_size` pixels on each axis.
    fn decode_region(&self, rect: Rect, sample_size: u32) -> Result<DynamicImage, DecodeError>;

    /// Resident memory held by the decoder, for cache accounting.
    fn memory_size(&self) -> usize {
        0
    }
}

/// Region decoder over a fully decoded in-memory image.
#[derive(Debug, Clone)]
pub struct ImageRegionDecoder {
    image: DynamicImage,
}

impl ImageRegionDecoder {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    /// Decode `bytes` and keep the raster for region reads.
    pub fn open(bytes: &[u8]) -> Result<Self, DecodeError> {
        let image = image::load_from_memory(bytes).map_err(malformed)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(DecodeError::NoFrames);
        }
        Ok(Self::new(image))
    }
}

impl RegionDecoder for ImageRegionDecoder {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }

    fn decode_region(&self, rect: Rect, sample_size: u32) -> Result<DynamicImage, DecodeError> {
        let empty = || DecodeError::EmptyRegion {
            left: rect.left,
            top: rect.top,
            width: rect.width(),
            height: rect.height(),
        };

        let clipped = rect
            .intersect(&Rect::from_size(self.size()))
            .ok_or_else(empty)?;

        let region = self.image.crop_imm(
            clipped.left as u32,
            clipped.top as u32,
            clipped.width() as u32,
            clipped.height() as u32,
        );

        let sample_size = sample_size.max(1);
        if sample_size == 1 {
            return Ok(region);
        }

        let width = (region.width() / sample_size).max(1);
        let height = (region.height() / sample_size).max(1);
        Ok(region.resize_exact(width, height, FilterType::Triangle))
    }

    fn memory_size(&self) -> usize {
        self.image.as_bytes().len()
    }
}

fn malformed(err: image::ImageError) -> DecodeError {
    DecodeError::Malformed {
        message: err.to_string(),
    }
}
