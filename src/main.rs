//! bitmap-pipeline - command-line front end for the image loader.

use clap::Parser;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bitmap_pipeline::{
    config::{CacheArgs, Cli, Command, EvictConfig, LoadConfig, PlanConfig},
    create_s3_client, BitmapResult, DiskCache, DiskLruStore, FileFetcher, ImageLoader,
    ImageRequest, KeyedResultCache, LoadResult, Locator, RequestKey, RoutingFetcher, S3Fetcher,
    TileGrid, Waiter,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Load(config) => run_load(config).await,
        Command::Plan(config) => run_plan(config),
        Command::Evict(config) => run_evict(config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "bitmap_pipeline=debug"
    } else {
        "bitmap_pipeline=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Open the persistent cache, if one is configured.
fn open_disk_cache(args: &CacheArgs) -> Result<Option<DiskCache>, String> {
    let Some(dir) = &args.disk_cache_dir else {
        return Ok(None);
    };
    let store = DiskLruStore::open(dir, args.disk_cache_slots, args.disk_cache_bytes)
        .map_err(|e| format!("Failed to open disk cache at {}: {}", dir.display(), e))?;
    info!(
        "Disk cache: {} ({} entries, {} bytes)",
        dir.display(),
        store.len(),
        store.size()
    );
    Ok(Some(DiskCache::new(Arc::new(store), args.disk_cache_slots)))
}

// =============================================================================
// Load Command
// =============================================================================

/// Waiter that keeps whatever it is handed.
#[derive(Default)]
struct Collector {
    results: Mutex<Vec<(RequestKey, LoadResult)>>,
}

impl Collector {
    fn first(&self) -> Option<LoadResult> {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        results.first().map(|(_, result)| result.clone())
    }
}

impl Waiter for Collector {
    fn on_complete(&self, key: &RequestKey, result: &LoadResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key.clone(), result.clone()));
    }
}

async fn run_load(config: LoadConfig) -> ExitCode {
    init_logging(config.cache.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let locator = match Locator::parse(&config.locator) {
        Ok(locator) => locator,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let chain = match config.transform_chain() {
        Ok(chain) => chain,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let disk = match open_disk_cache(&config.cache) {
        Ok(disk) => disk,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut fetcher = RoutingFetcher::new().with_route("file", Arc::new(FileFetcher));
    if locator.scheme() == "s3" {
        let client =
            create_s3_client(config.cache.s3_endpoint.as_deref(), &config.cache.s3_region).await;
        fetcher = fetcher.with_route("s3", Arc::new(S3Fetcher::new(client)));
    }

    let mut loader = ImageLoader::new(Arc::new(fetcher))
        .with_memory_cache(KeyedResultCache::with_capacity(config.cache.memory_cache_bytes));
    if let Some(disk) = disk {
        loader = loader.with_disk_cache(disk);
    }

    let request = ImageRequest::new(locator)
        .with_transforms(chain)
        .with_mode(config.mode());
    info!("Loading {}", request.key());

    let collectors: Vec<Arc<Collector>> = (0..config.repeat)
        .map(|_| Arc::new(Collector::default()))
        .collect();
    for collector in &collectors {
        let waiter: Arc<dyn Waiter> = collector.clone();
        loader.request(&request, &waiter);
    }
    let stats_while_pending = loader.stats();
    loader.run_until_idle().await;

    let notified = collectors.iter().filter(|c| c.first().is_some()).count();
    let result = match collectors.first().and_then(|c| c.first()) {
        Some(Ok(result)) => result,
        Some(Err(e)) => {
            error!("Load failed: {}", e);
            return ExitCode::FAILURE;
        }
        None => {
            error!("Load finished without a result");
            return ExitCode::FAILURE;
        }
    };

    let summary = serde_json::json!({
        "key": result.key(),
        "loaded_from": result.loaded_from(),
        "original_size": result.original_size(),
        "frames": result.frame_count(),
        "frame_delays_ms": frame_delays_ms(&result),
        "has_alpha": result.has_alpha(),
        "bytes": result.byte_size(),
        "waiters": config.repeat,
        "waiters_notified": notified,
        "pending_keys_while_loading": stats_while_pending.pending_keys,
        "stats": loader.stats(),
    });
    print_json(&summary)
}

fn frame_delays_ms(result: &BitmapResult) -> Vec<u128> {
    (0..result.frame_count())
        .filter_map(|cursor| result.frame_delay(cursor))
        .map(|delay| delay.as_millis())
        .collect()
}

fn print_json(value: &impl serde::Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize output: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Plan Command
// =============================================================================

fn run_plan(config: PlanConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    let viewport = match config.viewport() {
        Ok(viewport) => viewport,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let grid = TileGrid::new(config.image_size());
    let plan = grid.plan(&RequestKey::from_raw(config.key.as_str()), &viewport);
    print_json(&plan)
}

// =============================================================================
// Evict Command
// =============================================================================

fn run_evict(config: EvictConfig) -> ExitCode {
    init_logging(config.cache.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let (locator, chain) = match (Locator::parse(&config.locator), config.transform_chain()) {
        (Ok(locator), Ok(chain)) => (locator, chain),
        (Err(e), _) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        (_, Err(e)) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let disk = match open_disk_cache(&config.cache) {
        Ok(Some(disk)) => disk,
        Ok(None) => {
            error!("No disk cache configured");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut loader = ImageLoader::new(Arc::new(RoutingFetcher::new())).with_disk_cache(disk);
    let request = ImageRequest::new(locator).with_transforms(chain);

    match loader.evict(&request) {
        Ok(removed) => {
            info!("{} {}", if removed { "Evicted" } else { "Not cached:" }, request.key());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Eviction failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
