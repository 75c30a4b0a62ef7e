//! Disk cache integration tests.
//!
//! Tests verify:
//! - Transformed results are written through before they are delivered
//! - A fresh loader over the same directory serves them without fetching
//! - Unreadable entries fall through to a full load and are rewritten
//! - Failed transforms leave nothing behind

use std::sync::Arc;

use bitmap_pipeline::{
    encode_bitmap, Blur, Grayscale, ImageLoader, ImageRequest, LoadedFrom, Resize,
    TransformChain, DEFAULT_SLOT_COUNT, PAYLOAD_SLOT,
};

use super::test_utils::{disk_cache, locator, png_bytes, png_rgba_bytes, MemoryFetcher, RecordingWaiter};

fn resized(name: &str) -> ImageRequest {
    ImageRequest::new(locator(name)).with_transforms(
        TransformChain::new()
            .then(Resize::new(12, 12))
            .then(Grayscale),
    )
}

#[tokio::test]
async fn test_write_through_matches_delivered_result() {
    let dir = tempfile::tempdir().unwrap();
    let request = resized("a.png");
    let fetcher =
        Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(40, 30)));
    let mut loader = ImageLoader::new(fetcher.clone()).with_disk_cache(disk_cache(dir.path()));

    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    let result = recorder.single().unwrap();
    let key = request.key();
    let expected = encode_bitmap(&key, result.image().unwrap()).unwrap();

    let disk = loader.disk().unwrap();
    assert_eq!(disk.read(&key).unwrap().unwrap(), expected);

    let snapshot = disk.store().open(key.as_str()).unwrap().unwrap();
    assert_eq!(snapshot.slot_count(), DEFAULT_SLOT_COUNT);
    assert_eq!(snapshot.slot(PAYLOAD_SLOT).unwrap(), &expected);
    assert_eq!(snapshot.slot(1).unwrap().as_ref(), key.as_str().as_bytes());
}

#[tokio::test]
async fn test_untransformed_loads_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let request = ImageRequest::new(locator("a.png"));
    let fetcher =
        Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(8, 8)));
    let mut loader = ImageLoader::new(fetcher).with_disk_cache(disk_cache(dir.path()));

    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    assert!(recorder.single().is_ok());
    assert!(loader.disk().unwrap().read(&request.key()).unwrap().is_none());
}

#[tokio::test]
async fn test_fresh_loader_reads_persisted_result() {
    let dir = tempfile::tempdir().unwrap();
    let request = resized("a.png");

    {
        let fetcher =
            Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(40, 30)));
        let mut loader = ImageLoader::new(fetcher).with_disk_cache(disk_cache(dir.path()));
        let (recorder, waiter) = RecordingWaiter::create();
        loader.request(&request, &waiter);
        loader.run_until_idle().await;
        assert_eq!(recorder.single().unwrap().loaded_from(), LoadedFrom::Network);
    }

    // Nothing to fetch: the result must come from disk
    let fetcher = Arc::new(MemoryFetcher::new());
    let mut loader = ImageLoader::new(fetcher.clone()).with_disk_cache(disk_cache(dir.path()));
    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    let result = recorder.single().unwrap();
    assert_eq!(result.loaded_from(), LoadedFrom::DiskCache);
    assert_eq!(result.key(), &request.key());
    assert_eq!(result.original_size().width, 12);
    assert_eq!(fetcher.fetch_count(), 0);
    assert!(loader.memory().contains(&request.key()));
}

#[tokio::test]
async fn test_translucent_result_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let request = ImageRequest::new(locator("alpha.png"))
        .with_transforms(TransformChain::new().then(Resize::new(6, 6)));

    {
        let fetcher = Arc::new(
            MemoryFetcher::new().with_object(request.locator(), png_rgba_bytes(20, 20)),
        );
        let mut loader = ImageLoader::new(fetcher).with_disk_cache(disk_cache(dir.path()));
        let (_recorder, waiter) = RecordingWaiter::create();
        loader.request(&request, &waiter);
        loader.run_until_idle().await;
    }

    let reopened = disk_cache(dir.path());
    let loaded = reopened.load(&request.key()).unwrap();
    assert!(loaded.has_alpha());
    assert_eq!(loaded.original_size().width, 6);
}

#[tokio::test]
async fn test_unreadable_entry_falls_through_and_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let request = resized("a.png");
    let key = request.key();
    let disk = disk_cache(dir.path());

    let mut editor = disk.store().edit(key.as_str()).unwrap().unwrap();
    editor.write(PAYLOAD_SLOT, b"definitely not an image").unwrap();
    editor.write(1, key.as_str().as_bytes()).unwrap();
    editor.commit().unwrap();

    let fetcher =
        Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(40, 30)));
    let mut loader = ImageLoader::new(fetcher.clone()).with_disk_cache(disk.clone());
    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    let result = recorder.single().unwrap();
    assert_eq!(result.loaded_from(), LoadedFrom::Network);
    assert_eq!(fetcher.fetch_count(), 1);

    let rewritten = disk.load(&key).unwrap();
    assert_eq!(rewritten.original_size().width, 12);
}

#[tokio::test]
async fn test_failed_transform_leaves_no_entry() {
    let dir = tempfile::tempdir().unwrap();
    let request = ImageRequest::new(locator("a.png"))
        .with_transforms(TransformChain::new().then(Grayscale).then(Blur::new(0.0)));
    let fetcher =
        Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(16, 16)));
    let mut loader = ImageLoader::new(fetcher).with_disk_cache(disk_cache(dir.path()));

    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;

    assert!(recorder.single().is_err());
    assert!(loader.disk().unwrap().read(&request.key()).unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_during_disk_probe_abandons_transform() {
    let dir = tempfile::tempdir().unwrap();
    let request = resized("a.png");
    let fetcher =
        Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(40, 30)));
    let mut loader = ImageLoader::new(fetcher).with_disk_cache(disk_cache(dir.path()));

    // Let the source land in memory so the transform starts straight away
    let (_source_recorder, source_waiter) = RecordingWaiter::create();
    loader.request(&ImageRequest::new(request.locator().clone()), &source_waiter);
    loader.run_until_idle().await;

    let (recorder, waiter) = RecordingWaiter::create();
    let attached = loader.request(&request, &waiter);
    // Disk probe is in flight; cancelling now abandons the producer
    loader.cancel(attached.ticket().unwrap());
    loader.run_until_idle().await;

    assert_eq!(recorder.count(), 0);
    assert!(!loader.memory().contains(&request.key()));
}

#[tokio::test]
async fn test_evict_removes_memory_and_disk() {
    let dir = tempfile::tempdir().unwrap();
    let request = resized("a.png");
    let fetcher =
        Arc::new(MemoryFetcher::new().with_object(request.locator(), png_bytes(40, 30)));
    let mut loader = ImageLoader::new(fetcher.clone()).with_disk_cache(disk_cache(dir.path()));

    let (_recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;
    assert!(loader.memory().contains(&request.key()));

    assert!(loader.evict(&request).unwrap());
    assert!(!loader.memory().contains(&request.key()));
    assert!(loader.disk().unwrap().read(&request.key()).unwrap().is_none());
    assert!(!loader.evict(&request).unwrap());

    // The next request recomputes from the resident source
    let (recorder, waiter) = RecordingWaiter::create();
    loader.request(&request, &waiter);
    loader.run_until_idle().await;
    assert!(recorder.single().is_ok());
    assert_eq!(fetcher.fetch_count(), 1);
}
