//! Configuration for the `bitmap-pipeline` binary.
//!
//! Options come from command-line arguments via clap, with environment
//! variable fallbacks under the `BITMAP_` prefix.
//!
//! # Example
//!
//! ```ignore
//! use bitmap_pipeline::config::{Cli, Command};
//!
//! let cli = Cli::parse();
//! match cli.into_command() {
//!     Command::Load(config) => { /* ... */ }
//!     Command::Plan(config) => { /* ... */ }
//!     Command::Evict(config) => { /* ... */ }
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `BITMAP_MEMORY_CACHE_BYTES` - Memory cache budget (default: 64MB)
//! - `BITMAP_DISK_CACHE_DIR` - Disk cache directory (disabled if unset)
//! - `BITMAP_DISK_CACHE_BYTES` - Disk cache budget (default: 256MB)
//! - `BITMAP_DISK_CACHE_SLOTS` - Slots per persisted entry (default: 2)
//! - `BITMAP_ANIMATE` - Decode every GIF frame (default: false)
//! - `BITMAP_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `BITMAP_S3_REGION` - AWS region (default: us-east-1)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::cache::{DEFAULT_DISK_CACHE_CAPACITY, DEFAULT_MEMORY_CACHE_CAPACITY, DEFAULT_SLOT_COUNT};
use crate::decode::DecodeMode;
use crate::geometry::{Rect, Size};
use crate::transform::TransformChain;
use crate::zoom::Viewport;

// =============================================================================
// Default Values
// =============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default zoom factor for `plan`.
pub const DEFAULT_ZOOM: f64 = 1.0;

// =============================================================================
// CLI Structure
// =============================================================================

/// bitmap-pipeline - deduplicating image loader with disk write-through.
#[derive(Parser, Debug, Clone)]
#[command(name = "bitmap-pipeline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load an image, apply transforms and print a JSON summary
    Load(LoadConfig),

    /// Print the deep-zoom tile plan for an image size and viewport
    Plan(PlanConfig),

    /// Remove a persisted result from the disk cache
    Evict(EvictConfig),
}

// =============================================================================
// Shared Cache / Storage Options
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Memory cache budget in bytes.
    #[arg(long, default_value_t = DEFAULT_MEMORY_CACHE_CAPACITY, env = "BITMAP_MEMORY_CACHE_BYTES")]
    pub memory_cache_bytes: usize,

    /// Directory of the persistent cache. Without it nothing is persisted.
    #[arg(long, env = "BITMAP_DISK_CACHE_DIR")]
    pub disk_cache_dir: Option<PathBuf>,

    /// Persistent cache budget in bytes.
    #[arg(long, default_value_t = DEFAULT_DISK_CACHE_CAPACITY, env = "BITMAP_DISK_CACHE_BYTES")]
    pub disk_cache_bytes: u64,

    /// Slots per persisted entry: the payload plus metadata slots.
    #[arg(long, default_value_t = DEFAULT_SLOT_COUNT, env = "BITMAP_DISK_CACHE_SLOTS")]
    pub disk_cache_slots: usize,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "BITMAP_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "BITMAP_S3_REGION")]
    pub s3_region: String,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CacheArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_cache_bytes == 0 {
            return Err("memory_cache_bytes must be greater than 0".to_string());
        }
        if self.disk_cache_bytes == 0 {
            return Err("disk_cache_bytes must be greater than 0".to_string());
        }
        if self.disk_cache_slots < 2 {
            return Err(format!(
                "disk_cache_slots must be at least 2 (payload + metadata), got {}",
                self.disk_cache_slots
            ));
        }
        if let Some(dir) = &self.disk_cache_dir {
            if dir.as_os_str().is_empty() {
                return Err("disk_cache_dir must not be empty".to_string());
            }
        }
        if self.s3_region.is_empty() {
            return Err("s3_region must not be empty".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Load Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct LoadConfig {
    /// Image locator: a path, file:// URL or s3://bucket/key.
    pub locator: String,

    /// Transform to apply, in order (resize:WxH, crop:WxH, grayscale,
    /// rotate:90|180|270, blur:SIGMA, flip:h|v). Repeatable.
    #[arg(short, long = "transform")]
    pub transforms: Vec<String>,

    /// Decode every GIF frame instead of the first.
    #[arg(long, default_value_t = false, env = "BITMAP_ANIMATE")]
    pub animate: bool,

    /// Keep a region decoder instead of a raster.
    #[arg(long, default_value_t = false, conflicts_with = "animate")]
    pub deep_zoom: bool,

    /// Issue the request this many times before waiting, to observe dedup.
    #[arg(long, default_value_t = 1)]
    pub repeat: usize,

    #[command(flatten)]
    pub cache: CacheArgs,
}

impl LoadConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;
        if self.locator.is_empty() {
            return Err("locator is required".to_string());
        }
        if self.repeat == 0 {
            return Err("repeat must be greater than 0".to_string());
        }
        if self.deep_zoom && !self.transforms.is_empty() {
            return Err("transforms cannot be combined with --deep-zoom".to_string());
        }
        self.transform_chain().map(|_| ())
    }

    pub fn mode(&self) -> DecodeMode {
        if self.deep_zoom {
            DecodeMode::DeepZoom
        } else if self.animate {
            DecodeMode::Animated
        } else {
            DecodeMode::Still
        }
    }

    pub fn transform_chain(&self) -> Result<TransformChain, String> {
        TransformChain::from_specs(&self.transforms).map_err(|e| e.to_string())
    }
}

// =============================================================================
// Plan Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct PlanConfig {
    /// Source image width in pixels.
    #[arg(long)]
    pub width: u32,

    /// Source image height in pixels.
    #[arg(long)]
    pub height: u32,

    /// Size the image is drawn at, as WxH. Defaults to the image size.
    #[arg(long)]
    pub bounds: Option<String>,

    /// Canvas zoom factor.
    #[arg(long, default_value_t = DEFAULT_ZOOM)]
    pub zoom: f64,

    /// Visible rectangle as x,y,w,h in drawn pixels. Defaults to everything.
    #[arg(long)]
    pub visible: Option<String>,

    /// Base key the tile keys are derived from.
    #[arg(long, default_value = "image")]
    pub key: String,
}

impl PlanConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("width and height must be greater than 0".to_string());
        }
        if !self.zoom.is_finite() || self.zoom <= 0.0 {
            return Err(format!("zoom must be a positive number, got {}", self.zoom));
        }
        self.viewport().map(|_| ())
    }

    pub fn image_size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Viewport described by `--bounds`, `--visible` and `--zoom`.
    pub fn viewport(&self) -> Result<Viewport, String> {
        let bounds = match &self.bounds {
            Some(bounds) => parse_size(bounds)?,
            None => self.image_size(),
        };
        let visible = match &self.visible {
            Some(visible) => parse_rect(visible)?,
            None => Rect::from_size(bounds),
        };
        Ok(Viewport::new(bounds, visible, self.zoom))
    }
}

// =============================================================================
// Evict Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct EvictConfig {
    /// Image locator the entry was loaded from.
    pub locator: String,

    /// Transforms the entry was produced with, in order. Repeatable.
    #[arg(short, long = "transform")]
    pub transforms: Vec<String>,

    #[command(flatten)]
    pub cache: CacheArgs,
}

impl EvictConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;
        if self.cache.disk_cache_dir.is_none() {
            return Err(
                "evict needs a disk cache. Set --disk-cache-dir or BITMAP_DISK_CACHE_DIR"
                    .to_string(),
            );
        }
        self.transform_chain().map(|_| ())
    }

    pub fn transform_chain(&self) -> Result<TransformChain, String> {
        TransformChain::from_specs(&self.transforms).map_err(|e| e.to_string())
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// Parse `WxH`.
pub fn parse_size(s: &str) -> Result<Size, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{}': expected WxH", s))?;
    let width = w
        .trim()
        .parse()
        .map_err(|_| format!("invalid width in '{}'", s))?;
    let height = h
        .trim()
        .parse()
        .map_err(|_| format!("invalid height in '{}'", s))?;
    Ok(Size::new(width, height))
}

/// Parse `x,y,w,h`.
pub fn parse_rect(s: &str) -> Result<Rect, String> {
    let parts: Vec<i64> = s
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid rectangle '{}': expected x,y,w,h", s))?;

    match parts.as_slice() {
        [x, y, w, h] if *w >= 0 && *h >= 0 => Ok(Rect::from_xywh(*x, *y, *w, *h)),
        [_, _, _, _] => Err(format!("invalid rectangle '{}': negative size", s)),
        _ => Err(format!("invalid rectangle '{}': expected x,y,w,h", s)),
    }
}
