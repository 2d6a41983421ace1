//! The cache manager: warm, reconcile, resolve, refresh.
//!
//! Owns the active cache generation named by [`CacheConfig::version`]. All
//! durable state lives in the [`CacheStorage`]; the only in-memory state is
//! the set of background writes still in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::http::StatusCode;
use futures::future::{join_all, try_join_all};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::fetch::{FetchError, Fetcher};
use super::keys::RequestKey;
use super::lock::mutex_lock;
use super::policy::{is_cacheable, is_refreshable};
use super::request::{FetchRequest, FetchResponse};
use super::store::{CacheStorage, CacheStore, CachedEntry, StoreError};

const SOURCE: &str = "cache::manager";

/// The only background-sync tag that triggers a refresh.
pub const UPDATE_CACHE_TAG: &str = "update-cache";

pub(crate) const METRIC_CACHE_HIT: &str = "stashpoint_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "stashpoint_cache_miss_total";
pub(crate) const METRIC_CACHE_PASSTHROUGH: &str = "stashpoint_cache_passthrough_total";
pub(crate) const METRIC_CACHE_FALLBACK: &str = "stashpoint_cache_fallback_total";
pub(crate) const METRIC_NETWORK_FAILURE: &str = "stashpoint_network_failure_total";
pub(crate) const METRIC_CACHE_WRITE: &str = "stashpoint_cache_write_total";
pub(crate) const METRIC_CACHE_REFRESH: &str = "stashpoint_cache_refresh_total";
pub(crate) const METRIC_CACHE_WARM_MS: &str = "stashpoint_cache_warm_ms";

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("failed to open cache `{version}`: {source}")]
    Open {
        version: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to fetch `{url}`: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("`{url}` answered with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to store `{url}`: {source}")]
    Store {
        url: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Network(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmReport {
    pub version: String,
    pub entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// False when the sync tag did not ask for a refresh.
    pub ran: bool,
    pub refreshed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

enum RefreshOutcome {
    Refreshed,
    Unchanged,
    Failed,
}

pub struct CacheManager {
    config: CacheConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    pending_writes: Mutex<JoinSet<()>>,
}

impl CacheManager {
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
            pending_writes: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Open (creating if absent) the store for the active version.
    pub async fn active_store(&self) -> Result<Arc<dyn CacheStore>, StoreError> {
        self.storage.open(&self.config.version).await
    }

    /// Fetch every manifest resource and store the batch.
    ///
    /// All resources are fetched before anything is written; a single
    /// unreachable or non-2xx resource leaves the store untouched.
    #[instrument(skip_all, fields(version = %self.config.version))]
    pub async fn warm(&self) -> Result<WarmReport, WarmError> {
        let started_at = Instant::now();
        let store = self
            .active_store()
            .await
            .map_err(|source| WarmError::Open {
                version: self.config.version.clone(),
                source,
            })?;

        let requests = self.config.manifest_requests();
        let entries =
            try_join_all(requests.iter().map(|request| self.fetch_for_warm(request))).await?;
        let stored = entries
            .iter()
            .map(|entry| entry.key.clone())
            .collect::<HashSet<RequestKey>>()
            .len();

        try_join_all(entries.into_iter().map(|entry| {
            let store = Arc::clone(&store);
            async move {
                let url = entry.key.url().to_string();
                store
                    .put(entry)
                    .await
                    .map_err(|source| WarmError::Store { url, source })
            }
        }))
        .await?;

        histogram!(METRIC_CACHE_WARM_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            target = "stashpoint::cache",
            entries = stored,
            "cache warmed"
        );

        Ok(WarmReport {
            version: self.config.version.clone(),
            entries: stored,
        })
    }

    async fn fetch_for_warm(&self, request: &FetchRequest) -> Result<CachedEntry, WarmError> {
        let url = request.url.to_string();
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|source| WarmError::Fetch {
                url: url.clone(),
                source,
            })?;
        if !response.ok() {
            return Err(WarmError::Status {
                url,
                status: response.status,
            });
        }
        CachedEntry::new(request, response).map_err(|source| WarmError::Store { url, source })
    }

    /// Delete every store except the active one.
    ///
    /// Deletions run concurrently and independently; a failed deletion is
    /// logged and reported but never retried.
    #[instrument(skip_all, fields(version = %self.config.version))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let stale: Vec<String> = self
            .storage
            .names()
            .await?
            .into_iter()
            .filter(|name| *name != self.config.version)
            .collect();

        let results = join_all(stale.into_iter().map(|name| async move {
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut report = ReconcileReport::default();
        for (name, result) in results {
            match result {
                Ok(_) => {
                    info!(target = "stashpoint::cache", cache = %name, "deleted old cache");
                    report.deleted.push(name);
                }
                Err(error) => {
                    warn!(
                        target = "stashpoint::cache",
                        cache = %name,
                        error = %error,
                        "failed to delete old cache"
                    );
                    report.failed.push(name);
                }
            }
        }

        Ok(report)
    }

    /// Answer an intercepted request: cache first, then network.
    ///
    /// Returns `None` when the request cannot be answered at all, which the
    /// host surfaces as a failed load.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn resolve(&self, request: &FetchRequest) -> Option<FetchResponse> {
        match self.try_resolve(request).await {
            Ok(response) => Some(response),
            Err(error) => {
                counter!(METRIC_NETWORK_FAILURE).increment(1);
                warn!(target = "stashpoint::cache", error = %error, "fetch failed");
                if request.destination.is_document() {
                    self.fallback().await
                } else {
                    None
                }
            }
        }
    }

    async fn try_resolve(&self, request: &FetchRequest) -> Result<FetchResponse, ResolveError> {
        let store = self.active_store().await?;

        if let Some(entry) = store.lookup(request).await? {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!(cache = store.name(), outcome = "hit", "serving cached response");
            return Ok(entry.to_response());
        }

        counter!(METRIC_CACHE_MISS).increment(1);
        debug!(cache = store.name(), outcome = "miss", "fetching from network");

        let response = self.fetcher.fetch(request).await?;
        if !is_cacheable(&response) {
            counter!(METRIC_CACHE_PASSTHROUGH).increment(1);
            debug!(
                status = response.status.as_u16(),
                kind = ?response.kind,
                "response not cacheable"
            );
            return Ok(response);
        }

        self.spawn_write(store, request.clone(), response.clone());
        Ok(response)
    }

    async fn fallback(&self) -> Option<FetchResponse> {
        let request = self.config.fallback_request();
        let lookup = match self.active_store().await {
            Ok(store) => store.lookup(&request).await,
            Err(error) => Err(error),
        };

        match lookup {
            Ok(Some(entry)) => {
                counter!(METRIC_CACHE_FALLBACK).increment(1);
                info!(
                    target = "stashpoint::cache",
                    fallback = %self.config.fallback,
                    "serving offline fallback document"
                );
                Some(entry.to_response())
            }
            Ok(None) => {
                warn!(
                    target = "stashpoint::cache",
                    fallback = %self.config.fallback,
                    "offline fallback document is not cached"
                );
                None
            }
            Err(error) => {
                warn!(
                    target = "stashpoint::cache",
                    error = %error,
                    "failed to read offline fallback document"
                );
                None
            }
        }
    }

    /// Store a response without holding up the caller.
    fn spawn_write(
        &self,
        store: Arc<dyn CacheStore>,
        request: FetchRequest,
        response: FetchResponse,
    ) {
        let task = async move {
            let key = RequestKey::for_request(&request);
            let result = match CachedEntry::new(&request, response) {
                Ok(entry) => store.put(entry).await,
                Err(error) => Err(error),
            };
            match result {
                Ok(()) => {
                    counter!(METRIC_CACHE_WRITE, "result" => "ok").increment(1);
                    debug!(key = %key, "response cached");
                }
                Err(error) => {
                    counter!(METRIC_CACHE_WRITE, "result" => "error").increment(1);
                    warn!(
                        target = "stashpoint::cache",
                        key = %key,
                        error = %error,
                        "cache write failed"
                    );
                }
            }
        };

        let mut pending = mutex_lock(&self.pending_writes, SOURCE, "spawn_write");
        while pending.try_join_next().is_some() {}
        pending.spawn(task);
    }

    /// Wait for every background write spawned so far. Returns how many settled.
    pub async fn flush_pending_writes(&self) -> usize {
        let mut pending =
            std::mem::take(&mut *mutex_lock(&self.pending_writes, SOURCE, "flush_pending_writes"));

        let mut settled = 0;
        while let Some(result) = pending.join_next().await {
            if let Err(error) = result {
                warn!(
                    target = "stashpoint::cache",
                    error = %error,
                    "background cache write aborted"
                );
            }
            settled += 1;
        }
        settled
    }

    /// Re-fetch every stored entry when `tag` asks for it.
    #[instrument(skip_all, fields(version = %self.config.version, tag = %tag))]
    pub async fn refresh_all(&self, tag: &str) -> Result<RefreshReport, StoreError> {
        if tag != UPDATE_CACHE_TAG {
            debug!(tag, "ignoring sync tag");
            return Ok(RefreshReport::default());
        }

        let store = self.active_store().await?;
        let requests = store.requests().await?;

        let outcomes = join_all(
            requests
                .into_iter()
                .map(|request| self.refresh_one(store.as_ref(), request)),
        )
        .await;

        let mut report = RefreshReport {
            ran: true,
            ..RefreshReport::default()
        };
        for outcome in outcomes {
            match outcome {
                RefreshOutcome::Refreshed => report.refreshed += 1,
                RefreshOutcome::Unchanged => report.unchanged += 1,
                RefreshOutcome::Failed => report.failed += 1,
            }
        }

        info!(
            target = "stashpoint::cache",
            refreshed = report.refreshed,
            unchanged = report.unchanged,
            failed = report.failed,
            "cache refresh complete"
        );
        Ok(report)
    }

    async fn refresh_one(&self, store: &dyn CacheStore, request: FetchRequest) -> RefreshOutcome {
        let response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(error) => {
                counter!(METRIC_CACHE_REFRESH, "result" => "failed").increment(1);
                warn!(
                    target = "stashpoint::cache",
                    url = %request.url,
                    error = %error,
                    "cache update failed"
                );
                return RefreshOutcome::Failed;
            }
        };

        if !is_refreshable(&response) {
            counter!(METRIC_CACHE_REFRESH, "result" => "unchanged").increment(1);
            return RefreshOutcome::Unchanged;
        }

        let stored = match CachedEntry::new(&request, response) {
            Ok(entry) => store.put(entry).await,
            Err(error) => Err(error),
        };
        match stored {
            Ok(()) => {
                counter!(METRIC_CACHE_REFRESH, "result" => "refreshed").increment(1);
                RefreshOutcome::Refreshed
            }
            Err(error) => {
                counter!(METRIC_CACHE_REFRESH, "result" => "failed").increment(1);
                warn!(
                    target = "stashpoint::cache",
                    url = %request.url,
                    error = %error,
                    "cache update failed"
                );
                RefreshOutcome::Failed
            }
        }
    }
}
