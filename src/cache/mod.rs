//! Caching layers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              ImageLoader                │
//! └──────────┬──────────────────┬───────────┘
//!            │                  │
//!            ▼                  ▼
//! ┌──────────────────┐ ┌──────────────────────┐
//! │ KeyedResultCache │ │      DiskCache       │
//! │ (decoded, LRU by │ │ (encode + scoped     │
//! │  byte budget)    │ │  edit / commit)      │
//! └──────────────────┘ └──────────┬───────────┘
//!                                 │
//!                                 ▼
//!                      ┌──────────────────────┐
//!                      │   PersistentStore    │
//!                      │   (DiskLruStore)     │
//!                      └──────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`KeyedResultCache`]: process-wide map of decoded results, owned by the
//!   coordination context
//! - [`DiskCache`]: write-through and read-back of encoded results
//! - [`PersistentStore`] / [`Editor`] / [`Snapshot`]: the store interface
//! - [`DiskLruStore`]: file-backed store with atomic commits and LRU eviction

mod disk;
mod memory;
mod store;

pub use disk::{encode_bitmap, DiskCache, PAYLOAD_SLOT, PERSISTED_JPEG_QUALITY};
pub use memory::{KeyedResultCache, DEFAULT_MEMORY_CACHE_CAPACITY};
pub use store::{
    DiskLruStore, Editor, PersistentStore, Snapshot, DEFAULT_DISK_CACHE_CAPACITY,
    DEFAULT_SLOT_COUNT,
};
