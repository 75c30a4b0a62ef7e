//! Test utilities for integration tests.
//!
//! Provides an in-memory fetcher that counts calls, a waiter that records
//! every result it is handed, and PNG/GIF fixtures.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::gif::GifEncoder;
use image::{Delay, DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

use bitmap_pipeline::{
    DiskCache, DiskLruStore, FetchError, Fetched, Fetcher, LoadResult, Locator, RequestKey,
    Waiter, DEFAULT_SLOT_COUNT,
};

// =============================================================================
// Memory Fetcher
// =============================================================================

/// Serves pre-configured bytes by locator and counts fetches per locator.
#[derive(Default)]
pub struct MemoryFetcher {
    objects: HashMap<String, Bytes>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, locator: &Locator, data: Vec<u8>) -> Self {
        self.objects
            .insert(locator.as_str().to_string(), Bytes::from(data));
        self
    }

    /// Total number of fetches.
    pub fn fetch_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn fetches_of(&self, locator: &Locator) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(locator.as_str())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<Fetched, FetchError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(locator.as_str().to_string())
            .or_insert(0) += 1;

        match self.objects.get(locator.as_str()) {
            Some(data) => Ok(Fetched::network(data.clone())),
            None => Err(FetchError::NotFound(locator.to_string())),
        }
    }
}

// =============================================================================
// Recording Waiter
// =============================================================================

/// Records every completion it receives, in order.
#[derive(Default)]
pub struct RecordingWaiter {
    seen: Mutex<Vec<(RequestKey, LoadResult)>>,
}

impl RecordingWaiter {
    /// A recorder plus the trait-object handle the loader takes.
    pub fn create() -> (Arc<RecordingWaiter>, Arc<dyn Waiter>) {
        let recorder = Arc::new(RecordingWaiter::default());
        let waiter: Arc<dyn Waiter> = recorder.clone();
        (recorder, waiter)
    }

    pub fn results(&self) -> Vec<(RequestKey, LoadResult)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// The only result received; panics unless exactly one arrived.
    pub fn single(&self) -> LoadResult {
        let results = self.results();
        assert_eq!(results.len(), 1, "expected exactly one completion");
        results[0].1.clone()
    }
}

impl Waiter for RecordingWaiter {
    fn on_complete(&self, key: &RequestKey, result: &LoadResult) {
        self.seen.lock().unwrap().push((key.clone(), result.clone()));
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn locator(name: &str) -> Locator {
    Locator::parse(&format!("file:///fixtures/{}", name)).unwrap()
}

/// Opaque PNG with a gradient, so transforms change the bytes.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
}

/// PNG with a translucent alpha channel.
pub fn png_rgba_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 0, 128]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

/// Animated GIF with one 8x8 frame per delay.
pub fn gif_bytes(delays_ms: &[u32]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = delays_ms.iter().enumerate().map(|(i, delay)| {
            let img = RgbaImage::from_pixel(8, 8, Rgba([(i * 50) as u8, 10, 10, 255]));
            image::Frame::from_parts(img, 0, 0, Delay::from_numer_denom_ms(*delay, 1))
        });
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

/// A disk cache rooted at `dir` with default slots and a generous budget.
pub fn disk_cache(dir: &std::path::Path) -> DiskCache {
    let store = DiskLruStore::open(dir, DEFAULT_SLOT_COUNT, 64 * 1024 * 1024).unwrap();
    DiskCache::new(Arc::new(store), DEFAULT_SLOT_COUNT)
}
