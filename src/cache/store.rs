//! Cache storage abstractions and the in-memory backend.
//!
//! A [`CacheStorage`] owns any number of named [`CacheStore`]s, one per cache
//! version. Entries inside a store are immutable [`CachedEntry`] values that are
//! replaced wholesale on update.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use super::keys::{RequestKey, VaryRule};
use super::lock::{rw_read, rw_write};
use super::request::{FetchRequest, FetchResponse, ResponseType};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode cache entry `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt cache entry at `{path}`: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("only GET requests can be cached, got `{method}`")]
    UnsupportedMethod { method: String },
}

impl StoreError {
    pub fn corrupt(path: impl Into<String>, detail: impl ToString) -> Self {
        Self::Corrupt {
            path: path.into(),
            detail: detail.to_string(),
        }
    }
}

/// A stored request/response pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub key: RequestKey,
    pub request_headers: HeaderMap,
    pub vary: VaryRule,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub kind: ResponseType,
    pub stored_at: OffsetDateTime,
}

impl CachedEntry {
    /// Build an entry from a request and the response it produced.
    pub fn new(request: &FetchRequest, response: FetchResponse) -> Result<Self, StoreError> {
        if request.method != Method::GET {
            return Err(StoreError::UnsupportedMethod {
                method: request.method.to_string(),
            });
        }

        Ok(Self {
            key: RequestKey::for_request(request),
            request_headers: request.headers.clone(),
            vary: VaryRule::capture(&request.headers, &response.headers),
            status: response.status,
            headers: response.headers,
            body: response.body,
            url: response.url,
            kind: response.kind,
            stored_at: OffsetDateTime::now_utc(),
        })
    }

    /// True when `request` may be answered by this entry.
    pub fn matches(&self, request: &FetchRequest) -> bool {
        request.method == Method::GET
            && self.key == RequestKey::for_request(request)
            && self.vary.matches(&request.headers)
    }

    pub fn to_response(&self) -> FetchResponse {
        FetchResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            url: self.url.clone(),
            kind: self.kind,
        }
    }

    /// Rebuild the request this entry was stored under.
    pub fn to_request(&self) -> Result<FetchRequest, StoreError> {
        let url = Url::parse(self.key.url())
            .map_err(|err| StoreError::corrupt(self.key.to_string(), err))?;
        let mut request = FetchRequest::get(url);
        request.headers = self.request_headers.clone();
        Ok(request)
    }
}

/// One named, versioned collection of cached entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    /// Find the entry answering `request`, if any.
    async fn lookup(&self, request: &FetchRequest) -> Result<Option<CachedEntry>, StoreError>;

    /// Insert or wholesale-replace the entry under its key.
    async fn put(&self, entry: CachedEntry) -> Result<(), StoreError>;

    /// Requests currently stored, one per key.
    async fn requests(&self) -> Result<Vec<FetchRequest>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

/// The set of all cache stores ever opened, addressed by name.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open the named store, creating it when absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError>;

    async fn names(&self) -> Result<Vec<String>, StoreError>;

    /// Delete the named store with all of its entries. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// Memory backend
// ============================================================================

/// In-process storage. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStorage {
    stores: RwLock<BTreeMap<String, Arc<MemoryStore>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        let mut stores = rw_write(&self.stores, SOURCE, "memory_open");
        let store: Arc<dyn CacheStore> = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(name)))
            .clone();
        Ok(store)
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(rw_read(&self.stores, SOURCE, "memory_names")
            .keys()
            .cloned()
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(rw_write(&self.stores, SOURCE, "memory_delete")
            .remove(name)
            .is_some())
    }
}

pub struct MemoryStore {
    name: String,
    entries: RwLock<HashMap<RequestKey, CachedEntry>>,
}

impl MemoryStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, request: &FetchRequest) -> Result<Option<CachedEntry>, StoreError> {
        if request.method != Method::GET {
            return Ok(None);
        }
        let key = RequestKey::for_request(request);
        Ok(rw_read(&self.entries, SOURCE, "memory_lookup")
            .get(&key)
            .filter(|entry| entry.matches(request))
            .cloned())
    }

    async fn put(&self, entry: CachedEntry) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "memory_put").insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn requests(&self) -> Result<Vec<FetchRequest>, StoreError> {
        rw_read(&self.entries, SOURCE, "memory_requests")
            .values()
            .map(CachedEntry::to_request)
            .collect()
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(rw_read(&self.entries, SOURCE, "memory_len").len())
    }
}
