//! Loader integration tests.
//!
//! Tests verify:
//! - Concurrent requests for one key run one producer and share one result
//! - Memory hits are delivered synchronously
//! - Cancelling the last waiter abandons the producer; a later request
//!   starts an independent one and the abandoned result is dropped
//! - Errors reach every waiter and are not retried
//! - Transform chains share a single source load

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bitmap_pipeline::{
    Attached, BitmapPayload, Blur, DecodeMode, DecodeError, FetchError, Fetched, Fetcher,
    Grayscale, ImageLoader, ImageRequest, LoadError, LoadedFrom, Locator, Resize, TransformChain,
    TransformError,
};

use super::test_utils::{gif_bytes, locator, png_bytes, MemoryFetcher, RecordingWaiter};

fn loader_with(fetcher: &Arc<MemoryFetcher>) -> ImageLoader {
    ImageLoader::new(fetcher.clone())
}

// =============================================================================
// Dedup and fan-out
// =============================================================================

#[tokio::test]
async fn test_concurrent_requests_share_one_producer() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);

    let (r1, w1) = RecordingWaiter::create();
    let (r2, w2) = RecordingWaiter::create();
    let a1 = loader.request(&request, &w1);
    let a2 = loader.request(&request, &w2);
    assert!(matches!(a1, Attached::Pending(_)));
    assert!(matches!(a2, Attached::Pending(_)));
    assert_eq!(loader.registry().waiter_count(&request.key()), 2);

    loader.run_until_idle().await;

    assert_eq!(fetcher.fetch_count(), 1);
    let first = r1.single().unwrap();
    let second = r2.single().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.loaded_from(), LoadedFrom::Network);
    assert!(loader.registry().is_empty());
}

#[tokio::test]
async fn test_memory_hit_is_delivered_synchronously() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);

    let (r1, w1) = RecordingWaiter::create();
    loader.request(&request, &w1);
    loader.run_until_idle().await;
    let original = r1.single().unwrap();

    let (r2, w2) = RecordingWaiter::create();
    let attached = loader.request(&request, &w2);

    // Delivered before any completion processing
    let hit = r2.single().unwrap();
    assert!(Arc::ptr_eq(&hit, &original));
    assert_eq!(attached.loaded_from(), Some(LoadedFrom::Memory));
    // The shared result keeps the provenance it was produced with
    assert_eq!(hit.loaded_from(), LoadedFrom::Network);
    assert!(attached.ticket().is_none());
    assert!(loader.registry().is_empty());
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_distinct_keys_run_independently() {
    let (a, b) = (locator("a.png"), locator("b.png"));
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .with_object(&a, png_bytes(4, 4))
            .with_object(&b, png_bytes(6, 6)),
    );
    let mut loader = loader_with(&fetcher);

    let (ra, wa) = RecordingWaiter::create();
    let (rb, wb) = RecordingWaiter::create();
    loader.request(&ImageRequest::new(a.clone()), &wa);
    loader.request(&ImageRequest::new(b.clone()), &wb);
    loader.run_until_idle().await;

    assert_eq!(ra.single().unwrap().original_size().width, 4);
    assert_eq!(rb.single().unwrap().original_size().width, 6);
    assert_eq!(fetcher.fetches_of(&a), 1);
    assert_eq!(fetcher.fetches_of(&b), 1);
}

// =============================================================================
// Cancellation and ownership
// =============================================================================

#[tokio::test]
async fn test_cancel_then_request_starts_new_producer() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);
    let key = request.key();

    let (r1, w1) = RecordingWaiter::create();
    let attached = loader.request(&request, &w1);
    let first_owner = loader.registry().producer_for(&key).unwrap();

    let removed = loader.cancel(attached.ticket().unwrap());
    assert_eq!(removed, 1);
    assert!(!loader.registry().contains(&key));

    let (r3, w3) = RecordingWaiter::create();
    loader.request(&request, &w3);
    let second_owner = loader.registry().producer_for(&key).unwrap();
    assert_ne!(first_owner, second_owner);

    loader.run_until_idle().await;

    // Both producers ran; only the current one published
    assert_eq!(fetcher.fetch_count(), 2);
    assert_eq!(r1.count(), 0);
    assert_eq!(r3.count(), 1);
    assert!(loader.registry().is_empty());
}

#[tokio::test]
async fn test_cancelled_result_is_not_cached() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);

    let (recorder, waiter) = RecordingWaiter::create();
    let attached = loader.request(&request, &waiter);
    loader.cancel(attached.ticket().unwrap());
    loader.run_until_idle().await;

    assert_eq!(recorder.count(), 0);
    assert!(!loader.memory().contains(&request.key()));
}

#[tokio::test]
async fn test_cancel_one_of_two_waiters_keeps_producer() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);

    let (r1, w1) = RecordingWaiter::create();
    let (r2, w2) = RecordingWaiter::create();
    let a1 = loader.request(&request, &w1);
    loader.request(&request, &w2);

    assert_eq!(loader.cancel(a1.ticket().unwrap()), 0);
    loader.run_until_idle().await;

    assert_eq!(r1.count(), 0);
    assert!(r2.single().is_ok());
}

#[tokio::test]
async fn test_dropped_waiter_is_skipped() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);

    let (r1, w1) = RecordingWaiter::create();
    let (r2, w2) = RecordingWaiter::create();
    loader.request(&request, &w1);
    loader.request(&request, &w2);
    drop(w2);
    drop(r2);

    loader.run_until_idle().await;
    assert!(r1.single().is_ok());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_fetch_error_reaches_every_waiter_without_retry() {
    let loc = locator("missing.png");
    let fetcher = Arc::new(MemoryFetcher::new());
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc);

    let (r1, w1) = RecordingWaiter::create();
    let (r2, w2) = RecordingWaiter::create();
    loader.request(&request, &w1);
    loader.request(&request, &w2);
    loader.run_until_idle().await;

    assert!(matches!(
        r1.single(),
        Err(LoadError::Fetch(FetchError::NotFound(_)))
    ));
    assert!(matches!(
        r2.single(),
        Err(LoadError::Fetch(FetchError::NotFound(_)))
    ));
    assert_eq!(fetcher.fetch_count(), 1);
    assert!(loader.memory().is_empty());
    assert!(loader.registry().is_empty());
}

/// Fetcher whose every call panics.
struct PanickingFetcher;

#[async_trait]
impl Fetcher for PanickingFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<Fetched, FetchError> {
        panic!("transport blew up fetching {}", locator);
    }
}

#[tokio::test]
async fn test_panicking_fetcher_fails_every_waiter() {
    let mut loader = ImageLoader::new(Arc::new(PanickingFetcher));
    let request = ImageRequest::new(locator("a.png"));

    let (r1, w1) = RecordingWaiter::create();
    let (r2, w2) = RecordingWaiter::create();
    loader.request(&request, &w1);
    loader.request(&request, &w2);

    tokio::time::timeout(Duration::from_secs(5), loader.run_until_idle())
        .await
        .expect("loader should go idle after a fetch panic");

    assert!(matches!(r1.single(), Err(LoadError::Fetch(FetchError::Io { .. }))));
    assert!(matches!(r2.single(), Err(LoadError::Fetch(FetchError::Io { .. }))));
    assert_eq!(loader.in_flight(), 0);
    assert!(loader.registry().is_empty());
}

#[tokio::test]
async fn test_undecodable_bytes_are_a_decode_error() {
    let loc = locator("garbage.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, vec![0, 1, 2, 3, 4]));
    let mut loader = loader_with(&fetcher);

    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&ImageRequest::new(loc), &waiter);
    loader.run_until_idle().await;

    assert!(matches!(
        recorder.single(),
        Err(LoadError::Decode(DecodeError::Malformed { .. }))
    ));
}

// =============================================================================
// Decode modes
// =============================================================================

#[tokio::test]
async fn test_animated_gif_keeps_frames_and_delays() {
    let loc = locator("anim.gif");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, gif_bytes(&[40, 250, 120])));
    let mut loader = loader_with(&fetcher);

    let animated = ImageRequest::new(loc.clone()).with_mode(DecodeMode::Animated);
    let still = ImageRequest::new(loc);
    let (ra, wa) = RecordingWaiter::create();
    let (rs, ws) = RecordingWaiter::create();
    loader.request(&animated, &wa);
    loader.request(&still, &ws);
    loader.run_until_idle().await;

    let result = ra.single().unwrap();
    assert!(matches!(result.payload(), BitmapPayload::Animated(_)));
    assert_eq!(result.frame_count(), 3);
    assert_eq!(result.frame_delay(0), Some(Duration::from_millis(100)));
    assert_eq!(result.frame_delay(1), Some(Duration::from_millis(250)));
    assert_eq!(result.frame_delay(5), Some(Duration::from_millis(120)));

    let still = rs.single().unwrap();
    assert_eq!(still.frame_count(), 1);
    assert!(matches!(still.payload(), BitmapPayload::Still(_)));
}

// =============================================================================
// Transforms
// =============================================================================

#[tokio::test]
async fn test_transform_chains_share_one_source_load() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(64, 32)));
    let mut loader = loader_with(&fetcher);

    let small = ImageRequest::new(loc.clone())
        .with_transforms(TransformChain::new().then(Resize::new(8, 8)));
    let gray = ImageRequest::new(loc.clone()).with_transforms(
        TransformChain::new()
            .then(Resize::new(16, 16))
            .then(Grayscale),
    );
    assert_ne!(small.key(), gray.key());

    let (rs, ws) = RecordingWaiter::create();
    let (rg, wg) = RecordingWaiter::create();
    loader.request(&small, &ws);
    loader.request(&gray, &wg);

    // Both transforms wait on the one pending source entry
    assert_eq!(loader.registry().waiter_count(&small.source_key()), 2);

    loader.run_until_idle().await;

    assert_eq!(fetcher.fetch_count(), 1);
    let small_result = rs.single().unwrap();
    let gray_result = rg.single().unwrap();
    assert_eq!(small_result.key(), &small.key());
    assert_eq!(small_result.original_size().width, 8);
    assert_eq!(gray_result.original_size().width, 16);
    assert!(loader.memory().contains(&small.source_key()));
}

#[tokio::test]
async fn test_transform_uses_resident_source() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(64, 32)));
    let mut loader = loader_with(&fetcher);

    let (r0, w0) = RecordingWaiter::create();
    loader.request(&ImageRequest::new(loc.clone()), &w0);
    loader.run_until_idle().await;
    assert!(r0.single().is_ok());

    let request = ImageRequest::new(loc).with_transforms(TransformChain::new().then(Grayscale));
    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    assert!(!loader.registry().contains(&request.source_key()));
    loader.run_until_idle().await;

    assert!(recorder.single().is_ok());
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_transform_is_deterministic_across_loaders() {
    let loc = locator("a.png");
    let chain = TransformChain::new()
        .then(Resize::new(20, 10))
        .then(Blur::new(1.0))
        .then(Grayscale);
    let request = ImageRequest::new(loc.clone()).with_transforms(chain);

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(64, 32)));
        let mut loader = loader_with(&fetcher);
        let (recorder, waiter) = RecordingWaiter::create();
        loader.request(&request, &waiter);
        loader.run_until_idle().await;
        let result = recorder.single().unwrap();
        outputs.push(result.image().unwrap().as_bytes().to_vec());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_cancel_transform_cascades_to_source() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc).with_transforms(TransformChain::new().then(Grayscale));

    let (recorder, waiter) = RecordingWaiter::create();
    let attached = loader.request(&request, &waiter);
    assert!(loader.registry().contains(&request.source_key()));

    let removed = loader.cancel(attached.ticket().unwrap());
    assert_eq!(removed, 2);
    assert!(loader.registry().is_empty());

    loader.run_until_idle().await;
    assert_eq!(recorder.count(), 0);
    assert!(!loader.memory().contains(&request.key()));
    assert!(!loader.memory().contains(&request.source_key()));
}

#[tokio::test]
async fn test_cancel_transform_keeps_shared_source() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let transformed =
        ImageRequest::new(loc.clone()).with_transforms(TransformChain::new().then(Grayscale));
    let source = ImageRequest::new(loc);

    let (rt, wt) = RecordingWaiter::create();
    let (rs, ws) = RecordingWaiter::create();
    let attached = loader.request(&transformed, &wt);
    loader.request(&source, &ws);

    assert_eq!(loader.cancel(attached.ticket().unwrap()), 1);
    assert!(loader.registry().contains(&source.key()));

    loader.run_until_idle().await;
    assert_eq!(rt.count(), 0);
    assert!(rs.single().is_ok());
}

#[tokio::test]
async fn test_failing_transform_is_delivered_as_error() {
    let loc = locator("a.png");
    let fetcher = Arc::new(MemoryFetcher::new().with_object(&loc, png_bytes(16, 16)));
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc).with_transforms(
        TransformChain::new()
            .then(Grayscale)
            .then(Blur::new(-1.0)),
    );

    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    assert!(matches!(
        recorder.single(),
        Err(LoadError::Transform(TransformError::StepFailed { .. }))
    ));
    assert!(!loader.memory().contains(&request.key()));
    // The source itself loaded fine and stays resident
    assert!(loader.memory().contains(&request.source_key()));
}

#[tokio::test]
async fn test_source_failure_reaches_transform_waiters() {
    let loc = locator("missing.png");
    let fetcher = Arc::new(MemoryFetcher::new());
    let mut loader = loader_with(&fetcher);
    let request = ImageRequest::new(loc).with_transforms(TransformChain::new().then(Grayscale));

    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    assert!(matches!(recorder.single(), Err(LoadError::Fetch(_))));
    assert!(loader.registry().is_empty());
}
