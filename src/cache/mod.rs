//! Stashpoint cache engine.
//!
//! One versioned cache generation is active at a time:
//!
//! - **warm**: fetch the asset manifest into the active store on install
//! - **reconcile**: delete every store from older versions on activate
//! - **resolve**: answer requests from the store, falling back to the network
//! - **refresh**: re-fetch stored entries on a background sync
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! version = "random-saccade-v1.0.0"
//! manifest = ["./", "./index.html", "./manifest.json"]
//! fallback = "./index.html"
//! directory = ".stashpoint"
//! ```

mod config;
mod disk;
mod fetch;
mod keys;
mod lock;
mod manager;
mod policy;
mod request;
mod store;

pub use config::{CacheConfig, DEFAULT_CACHE_VERSION, DEFAULT_FALLBACK, DEFAULT_MANIFEST};
pub use disk::{DiskStorage, DiskStore};
pub use fetch::{FetchError, Fetcher};
pub use keys::{RequestKey, VaryRule};
pub use manager::{
    CacheManager, ReconcileReport, RefreshReport, UPDATE_CACHE_TAG, WarmError, WarmReport,
};
pub use policy::{is_cacheable, is_refreshable};
pub use request::{Destination, FetchRequest, FetchResponse, ResponseType};
pub use store::{CacheStorage, CacheStore, CachedEntry, MemoryStorage, MemoryStore, StoreError};

pub(crate) use manager::{
    METRIC_CACHE_FALLBACK, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_PASSTHROUGH,
    METRIC_CACHE_REFRESH, METRIC_CACHE_WARM_MS, METRIC_CACHE_WRITE, METRIC_NETWORK_FAILURE,
};
