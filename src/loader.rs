//! Image loader: the coordination context.
//!
//! `ImageLoader` owns the pending-request registry and the memory cache, and
//! is the only place either is mutated. All work that blocks (fetch, decode,
//! disk reads, transforms, encoding) runs on Tokio tasks; each task reports
//! back over a completion channel and never touches loader state.
//!
//! # Architecture
//!
//! ```text
//!  request(key) ──► memory hit? ──yes──► waiter.on_complete (synchronous)
//!                        │ no
//!                        ▼
//!               registry.attach ──joined──► wait
//!                        │ created
//!                        ▼
//!   ┌──────────────── start producer ─────────────────┐
//!   │ source:    fetch ─► decode                       │
//!   │ transform: disk probe ─► (miss) source ─► chain  │     worker tasks
//!   │ tile:      decode region                         │
//!   └──────────────────────┬───────────────────────────┘
//!                          │ WorkerMessage (mpsc)
//!                          ▼
//!        process: owner check ─► memory.put ─► registry.complete
//! ```
//!
//! A producer whose key was abandoned (every waiter detached) keeps running to
//! completion but its result is dropped at the owner check. A transform that
//! is abandoned still finishes its disk write-through.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bitmap::{BitmapPayload, BitmapResult, LoadedFrom};
use crate::cache::{DiskCache, KeyedResultCache};
use crate::decode::{decode_whole, is_gif, DecodeMode, ImageRegionDecoder, RegionDecoder};
use crate::error::{CacheError, DecodeError, FetchError, LoadError, TransformError};
use crate::fetch::{Fetched, Fetcher, Locator};
use crate::key::RequestKey;
use crate::registry::{Completion, LoadResult, PendingRequestRegistry, ProducerId, Waiter, WaiterId};
use crate::transform::{TransformChain, TransformPipeline};
use crate::zoom::{decode_tile, DeepZoomView, TilePlan, TileSpec, Viewport};

// =============================================================================
// Requests
// =============================================================================

/// What to load: a source, how to decode it, and what to do to it.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    locator: Locator,
    transforms: TransformChain,
    mode: DecodeMode,
}

impl ImageRequest {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            transforms: TransformChain::new(),
            mode: DecodeMode::Still,
        }
    }

    pub fn with_transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_mode(mut self, mode: DecodeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn transforms(&self) -> &TransformChain {
        &self.transforms
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Decode mode of the source; transforms always run on a still image.
    pub fn source_mode(&self) -> DecodeMode {
        if self.transforms.is_empty() {
            self.mode
        } else {
            DecodeMode::Still
        }
    }

    /// Key of the untransformed source.
    pub fn source_key(&self) -> RequestKey {
        RequestKey::source(&self.locator, self.source_mode())
    }

    /// Key of the final result.
    pub fn key(&self) -> RequestKey {
        self.source_key().with_transforms(&self.transforms)
    }
}

/// Handle for a pending registration, used to cancel it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: RequestKey,
    pub waiter: WaiterId,
}

/// Outcome of [`ImageLoader::request`].
#[derive(Debug, Clone)]
pub enum Attached {
    /// Served from memory; the waiter has already been called
    Ready(Arc<BitmapResult>),

    /// Registered; the waiter is called when the key completes
    Pending(Ticket),
}

impl Attached {
    /// Provenance as seen by this caller: memory for an immediate hit.
    pub fn loaded_from(&self) -> Option<LoadedFrom> {
        match self {
            Attached::Ready(_) => Some(LoadedFrom::Memory),
            Attached::Pending(_) => None,
        }
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        match self {
            Attached::Ready(_) => None,
            Attached::Pending(ticket) => Some(ticket),
        }
    }
}

/// One visible tile of a deep-zoom draw.
#[derive(Debug, Clone)]
pub struct TileDraw {
    pub spec: TileSpec,

    /// The tile, if it is memory-resident
    pub bitmap: Option<Arc<BitmapResult>>,

    /// Registration of the redraw target while the tile is pending
    pub ticket: Option<Ticket>,
}

/// Result of [`ImageLoader::draw_deep_zoom`].
#[derive(Debug, Clone)]
pub struct DeepZoomFrame {
    pub plan: TilePlan,
    pub tiles: Vec<TileDraw>,

    /// Tile decodes started by this draw
    pub started: usize,
}

impl DeepZoomFrame {
    /// Whether every visible tile is resident.
    pub fn is_complete(&self) -> bool {
        self.tiles.iter().all(|t| t.bitmap.is_some())
    }
}

/// Snapshot of loader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub pending_keys: usize,
    pub in_flight: usize,
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub memory_capacity: usize,
}

// =============================================================================
// Worker protocol
// =============================================================================

enum WorkerMessage {
    /// Disk lookup for a transformed key finished
    DiskProbe {
        key: RequestKey,
        producer: ProducerId,
        hit: Option<BitmapResult>,
    },

    /// A producer finished
    Finished {
        key: RequestKey,
        producer: ProducerId,
        result: Result<BitmapResult, LoadError>,
    },
}

/// A transform producer waiting for its source.
struct TransformJob {
    locator: Locator,
    source_key: RequestKey,
    chain: TransformChain,
}

// =============================================================================
// Image Loader
// =============================================================================

/// Single-owner coordinator for image loads.
///
/// Every method takes `&mut self`; the owner of the loader is the
/// coordination context. Methods that start work spawn Tokio tasks, so they
/// must be called from within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// let mut loader = ImageLoader::new(Arc::new(FileFetcher))
///     .with_disk_cache(disk);
///
/// let request = ImageRequest::new(Locator::parse("photo.jpg")?)
///     .with_transforms(TransformChain::new().then(Resize::new(256, 256)));
/// loader.request(&request, &waiter);
/// loader.run_until_idle().await;
/// ```
pub struct ImageLoader {
    registry: PendingRequestRegistry,
    memory: KeyedResultCache,
    pipeline: TransformPipeline,
    fetcher: Arc<dyn Fetcher>,
    transforms: HashMap<ProducerId, TransformJob>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,

    /// Worker messages still expected on `rx`
    in_flight: usize,
}

impl ImageLoader {
    /// Create a loader with a default memory cache and no disk cache.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry: PendingRequestRegistry::new(),
            memory: KeyedResultCache::new(),
            pipeline: TransformPipeline::default(),
            fetcher,
            transforms: HashMap::new(),
            tx,
            rx,
            in_flight: 0,
        }
    }

    pub fn with_memory_cache(mut self, memory: KeyedResultCache) -> Self {
        self.memory = memory;
        self
    }

    /// Persist transformed results to `disk` and probe it before transforming.
    pub fn with_disk_cache(mut self, disk: DiskCache) -> Self {
        self.pipeline = TransformPipeline::new(Some(disk));
        self
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        self.pipeline.disk()
    }

    pub fn memory(&self) -> &KeyedResultCache {
        &self.memory
    }

    pub fn registry(&self) -> &PendingRequestRegistry {
        &self.registry
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            pending_keys: self.registry.len(),
            in_flight: self.in_flight,
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.size(),
            memory_capacity: self.memory.capacity(),
        }
    }

    /// Ask for `request` on behalf of `waiter`.
    ///
    /// A memory hit calls the waiter before returning and registers nothing.
    /// Otherwise the waiter is registered on the request key, and the first
    /// registration starts the producer.
    pub fn request(&mut self, request: &ImageRequest, waiter: &Arc<dyn Waiter>) -> Attached {
        let key = request.key();

        if let Some(hit) = self.memory.get(&key) {
            debug!(key = %key, "memory cache hit");
            waiter.on_complete(&key, &Ok(hit.clone()));
            return Attached::Ready(hit);
        }

        let attachment = self.registry.attach(&key, waiter);
        if attachment.created {
            self.start(request, &key, attachment.producer);
        }
        Attached::Pending(Ticket {
            key,
            waiter: attachment.waiter,
        })
    }

    /// Withdraw a registration.
    ///
    /// If it was the last waiter on its key, the entry is torn down and so is
    /// every upstream entry that only that producer was waiting on. Returns
    /// the number of entries removed.
    pub fn cancel(&mut self, ticket: &Ticket) -> usize {
        let removed = self.registry.detach_cascade(&ticket.key, ticket.waiter);
        for producer in &removed {
            self.transforms.remove(&producer.id);
            debug!(key = %producer.key, producer = %producer.id, "producer abandoned");
        }
        removed.len()
    }

    /// Drop the cached result of `request` from memory and disk.
    pub fn evict(&mut self, request: &ImageRequest) -> Result<bool, CacheError> {
        let key = request.key();
        let in_memory = self.memory.remove(&key).is_some();
        let on_disk = match self.pipeline.disk() {
            Some(disk) => disk.remove(&key)?,
            None => false,
        };
        Ok(in_memory || on_disk)
    }

    // -------------------------------------------------------------------------
    // Deep zoom
    // -------------------------------------------------------------------------

    /// Plan the visible tiles of `view` and make sure each one is resident or
    /// on its way.
    ///
    /// Resident tiles are returned with their bitmap. Missing tiles register
    /// `redraw` on their tile key and start a region decode unless one is
    /// already pending. Re-registering the same `redraw` target on a pending
    /// tile is a no-op, so this can be called on every frame.
    pub fn draw_deep_zoom(
        &mut self,
        view: &DeepZoomView,
        viewport: &Viewport,
        redraw: &Arc<dyn Waiter>,
    ) -> DeepZoomFrame {
        let plan = view.plan(viewport);
        let mut started = 0;

        let tiles = plan
            .tiles
            .iter()
            .map(|spec| {
                if let Some(bitmap) = self.memory.get(&spec.key) {
                    return TileDraw {
                        spec: spec.clone(),
                        bitmap: Some(bitmap),
                        ticket: None,
                    };
                }

                let attachment = self.registry.attach(&spec.key, redraw);
                if attachment.created {
                    self.spawn_tile(view, spec.clone(), attachment.producer);
                    started += 1;
                }
                TileDraw {
                    spec: spec.clone(),
                    bitmap: None,
                    ticket: Some(Ticket {
                        key: spec.key.clone(),
                        waiter: attachment.waiter,
                    }),
                }
            })
            .collect();

        DeepZoomFrame {
            plan,
            tiles,
            started,
        }
    }

    // -------------------------------------------------------------------------
    // Completion processing
    // -------------------------------------------------------------------------

    /// Process every worker message that has already arrived.
    ///
    /// Returns the number of messages processed.
    pub fn poll_completions(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.process(message);
            processed += 1;
        }
        processed
    }

    /// Wait for the next worker message and process it.
    ///
    /// Returns `false` without waiting if no work is in flight.
    pub async fn next_completion(&mut self) -> bool {
        if self.in_flight == 0 {
            return false;
        }
        match self.rx.recv().await {
            Some(message) => {
                self.process(message);
                true
            }
            None => false,
        }
    }

    /// Process worker messages until nothing is in flight.
    pub async fn run_until_idle(&mut self) {
        while self.next_completion().await {}
    }

    fn process(&mut self, message: WorkerMessage) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match message {
            WorkerMessage::DiskProbe { key, producer, hit } => {
                if !self.registry.is_current_owner(&key, producer) {
                    debug!(key = %key, producer = %producer, "cancelled (no longer needed)");
                    self.transforms.remove(&producer);
                    return;
                }
                match hit {
                    Some(bitmap) => self.finish(key, producer, Ok(bitmap)),
                    None => self.begin_transform_source(&key, producer),
                }
            }
            WorkerMessage::Finished {
                key,
                producer,
                result,
            } => self.finish(key, producer, result),
        }
    }

    /// Publish a producer's result, then resume or fail whoever was waiting
    /// on it as a dependency.
    fn finish(
        &mut self,
        key: RequestKey,
        producer: ProducerId,
        result: Result<BitmapResult, LoadError>,
    ) {
        let mut queue: VecDeque<(RequestKey, ProducerId, LoadResult)> = VecDeque::new();
        queue.push_back((key, producer, result.map(Arc::new)));

        while let Some((key, producer, result)) = queue.pop_front() {
            if !self.registry.is_current_owner(&key, producer) {
                debug!(key = %key, producer = %producer, "cancelled (no longer needed)");
                self.transforms.remove(&producer);
                continue;
            }

            if let Ok(bitmap) = &result {
                self.memory.put(key.clone(), bitmap.clone());
            }
            self.transforms.remove(&producer);

            let Completion::Delivered { dependents, .. } =
                self.registry.complete(&key, producer, &result)
            else {
                continue;
            };

            for dependent in dependents {
                match &result {
                    Ok(source) => {
                        self.spawn_transform(&dependent.key, dependent.producer, source.clone())
                    }
                    Err(e) => queue.push_back((dependent.key, dependent.producer, Err(e.clone()))),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Producers
    // -------------------------------------------------------------------------

    fn start(&mut self, request: &ImageRequest, key: &RequestKey, producer: ProducerId) {
        if request.transforms().is_empty() {
            self.spawn_source(key.clone(), producer, request.locator().clone(), request.mode());
            return;
        }

        self.transforms.insert(
            producer,
            TransformJob {
                locator: request.locator().clone(),
                source_key: request.source_key(),
                chain: request.transforms().clone(),
            },
        );

        match self.pipeline.disk() {
            Some(disk) => self.spawn_disk_probe(disk.clone(), key.clone(), producer),
            None => self.begin_transform_source(key, producer),
        }
    }

    /// Get the source of a transform producer: from memory if resident,
    /// otherwise by waiting on the source key.
    fn begin_transform_source(&mut self, key: &RequestKey, producer: ProducerId) {
        let Some(job) = self.transforms.get(&producer) else {
            return;
        };
        let source_key = job.source_key.clone();
        let locator = job.locator.clone();

        if let Some(source) = self.memory.get(&source_key) {
            self.spawn_transform(key, producer, source);
            return;
        }

        match self.registry.attach_dependent(&source_key, key, producer) {
            Some(attachment) if attachment.created => {
                self.spawn_source(source_key, attachment.producer, locator, DecodeMode::Still);
            }
            Some(_) => {
                debug!(key = %key, source = %source_key, "joined pending source");
            }
            None => {
                self.transforms.remove(&producer);
            }
        }
    }

    fn spawn_source(
        &mut self,
        key: RequestKey,
        producer: ProducerId,
        locator: Locator,
        mode: DecodeMode,
    ) {
        debug!(key = %key, producer = %producer, "starting source load");
        let fetcher = self.fetcher.clone();
        let tx = self.tx.clone();
        self.in_flight += 1;

        tokio::spawn(async move {
            let result = load_source(fetcher, &key, &locator, mode).await;
            let _ = tx.send(WorkerMessage::Finished {
                key,
                producer,
                result,
            });
        });
    }

    fn spawn_disk_probe(&mut self, disk: DiskCache, key: RequestKey, producer: ProducerId) {
        let tx = self.tx.clone();
        self.in_flight += 1;

        tokio::spawn(async move {
            let probe_key = key.clone();
            let hit = tokio::task::spawn_blocking(move || disk.load(&probe_key))
                .await
                .ok()
                .flatten();
            let _ = tx.send(WorkerMessage::DiskProbe { key, producer, hit });
        });
    }

    fn spawn_transform(&mut self, key: &RequestKey, producer: ProducerId, source: Arc<BitmapResult>) {
        if !self.registry.is_current_owner(key, producer) {
            self.transforms.remove(&producer);
            return;
        }
        let Some(job) = self.transforms.get(&producer) else {
            return;
        };

        debug!(key = %key, producer = %producer, steps = job.chain.len(), "starting transform");
        let chain = job.chain.clone();
        let pipeline = self.pipeline.clone();
        let tx = self.tx.clone();
        let key = key.clone();
        self.in_flight += 1;

        tokio::spawn(async move {
            let task_key = key.clone();
            let result = tokio::task::spawn_blocking(move || {
                pipeline.apply(&task_key, &source, &chain)
            })
            .await
            .unwrap_or_else(|e| {
                Err(TransformError::StepFailed {
                    step: "pipeline".to_string(),
                    message: e.to_string(),
                })
            })
            .map_err(LoadError::from);

            let _ = tx.send(WorkerMessage::Finished {
                key,
                producer,
                result,
            });
        });
    }

    fn spawn_tile(&mut self, view: &DeepZoomView, spec: TileSpec, producer: ProducerId) {
        let tx = self.tx.clone();
        let source = view.source().clone();
        let decoder = view.decoder();
        self.in_flight += 1;

        tokio::spawn(async move {
            let key = spec.key.clone();
            let result = tokio::task::spawn_blocking(move || match decoder {
                Some(decoder) => decode_tile(decoder.as_ref(), &spec, &source),
                None => Err(DecodeError::NotDeepZoom {
                    key: source.key().to_string(),
                }),
            })
            .await
            .unwrap_or_else(|e| Err(decode_task_failed(e)))
            .map_err(LoadError::from);

            let _ = tx.send(WorkerMessage::Finished {
                key,
                producer,
                result,
            });
        });
    }
}

// =============================================================================
// Source loading
// =============================================================================

/// Fetch and decode a source.
///
/// The fetch runs on its own task so a panicking fetcher still yields an
/// error for the waiters instead of a lost completion.
async fn load_source(
    fetcher: Arc<dyn Fetcher>,
    key: &RequestKey,
    locator: &Locator,
    mode: DecodeMode,
) -> Result<BitmapResult, LoadError> {
    let task_locator = locator.clone();
    let fetched = tokio::spawn(async move { fetcher.fetch(&task_locator).await })
        .await
        .unwrap_or_else(|e| {
            Err(FetchError::Io {
                locator: locator.to_string(),
                message: format!("fetch task failed: {e}"),
            })
        })?;
    let key = key.clone();

    let result = tokio::task::spawn_blocking(move || decode_source(key, fetched, mode))
        .await
        .unwrap_or_else(|e| Err(decode_task_failed(e)))?;
    Ok(result)
}

/// Decode fetched bytes according to `mode`.
///
/// A GIF requested for deep zoom is decoded with all its frames; tiling an
/// animation is never useful.
fn decode_source(
    key: RequestKey,
    fetched: Fetched,
    mode: DecodeMode,
) -> Result<BitmapResult, DecodeError> {
    let mode = match mode {
        DecodeMode::DeepZoom if is_gif(&fetched.bytes) => DecodeMode::Animated,
        mode => mode,
    };
    if mode == DecodeMode::DeepZoom {
        let decoder = ImageRegionDecoder::open(&fetched.bytes)?;
        let size = decoder.size();
        return Ok(BitmapResult::new(
            key,
            BitmapPayload::Region(Arc::new(decoder)),
            size,
            fetched.loaded_from,
        ));
    }

    let decoded = decode_whole(&fetched.bytes, mode == DecodeMode::Animated)?;
    let payload = match decoded.frames.len() {
        0 => return Err(DecodeError::NoFrames),
        1 => BitmapPayload::Still(decoded.frames[0].shared_image()),
        _ => BitmapPayload::Animated(decoded.frames.into()),
    };
    Ok(BitmapResult::new(key, payload, decoded.size, fetched.loaded_from))
}

fn decode_task_failed(err: tokio::task::JoinError) -> DecodeError {
    DecodeError::Malformed {
        message: format!("decode task failed: {err}"),
    }
}
