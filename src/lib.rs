//! # Bitmap Pipeline
//!
//! An in-process image-loading pipeline with request deduplication and a
//! persistent write-through cache.
//!
//! Given a request for a source image (plus an optional chain of transforms),
//! the loader guarantees that at most one fetch/decode/transform pipeline runs
//! per unique key at a time, that every concurrent requester of that key
//! shares the single result, and that transformed results are persisted to a
//! disk cache for reuse across restarts. Very large images can be drawn in
//! deep-zoom mode, decoding only the visible tiles at the resolution the
//! current zoom needs.
//!
//! ## Features
//!
//! - **Single-flight loads**: one producer per key, results fanned out to every waiter
//! - **Cooperative cancellation**: detaching the last waiter tears down the
//!   entry and, recursively, the upstream work only it needed
//! - **Write-through disk cache**: atomic commit/abort edits with metadata slots
//! - **Deep zoom**: power-of-two level selection and per-tile region decodes
//! - **Animated GIFs**: frame sequences with per-frame delays
//!
//! ## Architecture
//!
//! - [`key`] - Request key derivation
//! - [`bitmap`] - Decoded results shared with waiters
//! - [`registry`] - Pending request registry (dedup, fan-out, ownership)
//! - [`cache`] - Memory cache, persistent store and the disk cache adapter
//! - [`transform`] - Transforms, chains and the write-through pipeline
//! - [`zoom`] - Deep-zoom level and tile planning
//! - [`fetch`] - File and S3 fetchers
//! - [`decode`] - Whole-image and region decoding
//! - [`loader`] - The coordination context tying everything together
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bitmap_pipeline::{
//!     FileFetcher, ImageLoader, ImageRequest, LoadResult, Locator, RequestKey, Resize,
//!     TransformChain, Waiter,
//! };
//!
//! struct Print;
//!
//! impl Waiter for Print {
//!     fn on_complete(&self, key: &RequestKey, result: &LoadResult) {
//!         println!("{key}: {}", result.is_ok());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut loader = ImageLoader::new(Arc::new(FileFetcher));
//!     let request = ImageRequest::new(Locator::parse("photo.png").unwrap())
//!         .with_transforms(TransformChain::new().then(Resize::new(128, 128)));
//!
//!     let waiter: Arc<dyn Waiter> = Arc::new(Print);
//!     loader.request(&request, &waiter);
//!     loader.run_until_idle().await;
//! }
//! ```

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod key;
pub mod loader;
pub mod registry;
pub mod transform;
pub mod zoom;

// Re-export commonly used types
pub use bitmap::{BitmapPayload, BitmapResult, Frame, LoadedFrom, FADE_DURATION, MIN_FRAME_DELAY};
pub use cache::{
    encode_bitmap, DiskCache, DiskLruStore, Editor, KeyedResultCache, PersistentStore, Snapshot,
    DEFAULT_DISK_CACHE_CAPACITY, DEFAULT_MEMORY_CACHE_CAPACITY, DEFAULT_SLOT_COUNT, PAYLOAD_SLOT,
};
pub use config::{CacheArgs, Cli, Command, EvictConfig, LoadConfig, PlanConfig};
pub use decode::{decode_whole, DecodeMode, DecodedImage, ImageRegionDecoder, RegionDecoder};
pub use error::{CacheError, DecodeError, FetchError, LoadError, TransformError};
pub use fetch::{create_s3_client, FileFetcher, Fetched, Fetcher, Locator, RoutingFetcher, S3Fetcher};
pub use geometry::{Rect, Size};
pub use key::{RequestKey, KEY_DELIMITER};
pub use loader::{
    Attached, DeepZoomFrame, ImageLoader, ImageRequest, LoaderStats, Ticket, TileDraw,
};
pub use registry::{
    Attachment, Completion, Dependency, Dependent, LoadResult, PendingRequestRegistry, Producer,
    ProducerId, Waiter, WaiterId,
};
pub use transform::{
    parse_transform, Blur, CenterCrop, Flip, FlipAxis, Grayscale, Resize, Rotate, Transform,
    TransformChain, TransformPipeline,
};
pub use zoom::{
    decode_tile, select_level, texture_dim, DeepZoomView, TileGrid, TilePlan, TileSpec, Viewport,
    TILE_DIM,
};
