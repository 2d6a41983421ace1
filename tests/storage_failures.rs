mod support;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::http::StatusCode;
use stashpoint::agent::{Agent, EventOutcome, LifecycleEvent, Phase};
use stashpoint::cache::{
    CacheManager, CacheStorage, CacheStore, CachedEntry, FetchRequest, MemoryStorage, StoreError,
};
use stashpoint::config::NotificationSettings;
use url::Url;

use support::{ScriptedFetcher, body_text, config, url};

/// Memory storage that refuses to delete one named store and can be switched
/// to reject every write.
struct FaultyStorage {
    inner: MemoryStorage,
    undeletable: &'static str,
    read_only: AtomicBool,
}

impl FaultyStorage {
    fn new(undeletable: &'static str) -> Self {
        Self {
            inner: MemoryStorage::new(),
            undeletable,
            read_only: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CacheStorage for FaultyStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        let store = self.inner.open(name).await?;
        if self.read_only.load(Ordering::SeqCst) {
            return Ok(Arc::new(ReadOnlyStore { inner: store }));
        }
        Ok(store)
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.names().await
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        if name == self.undeletable {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "store is locked",
            )));
        }
        self.inner.delete(name).await
    }
}

struct ReadOnlyStore {
    inner: Arc<dyn CacheStore>,
}

#[async_trait]
impl CacheStore for ReadOnlyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn lookup(&self, request: &FetchRequest) -> Result<Option<CachedEntry>, StoreError> {
        self.inner.lookup(request).await
    }

    async fn put(&self, _entry: CachedEntry) -> Result<(), StoreError> {
        Err(StoreError::Io(io::Error::new(
            io::ErrorKind::StorageFull,
            "no space left on device",
        )))
    }

    async fn requests(&self) -> Result<Vec<FetchRequest>, StoreError> {
        self.inner.requests().await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }
}

fn notifications() -> NotificationSettings {
    let icon = Url::parse("https://saccade.example/app/icon-512.png").unwrap();
    NotificationSettings {
        title: "Random Saccade".to_string(),
        default_body: "Time to train!".to_string(),
        icon: icon.clone(),
        badge: icon,
        vibrate: vec![200, 100, 200],
        open_url: support::scope(),
    }
}

#[tokio::test]
async fn activation_survives_a_store_that_cannot_be_deleted() {
    let storage = Arc::new(FaultyStorage::new("v0-locked"));
    for name in ["v0-locked", "v0", "old"] {
        storage.open(name).await.unwrap();
    }
    let fetcher = ScriptedFetcher::new().with_app_shell("v1");
    let cache = Arc::new(CacheManager::new(config("v1"), storage.clone(), fetcher));
    let agent = Agent::headless(cache, notifications());

    agent.dispatch(LifecycleEvent::Install).await.unwrap();
    let report = match agent.dispatch(LifecycleEvent::Activate).await.unwrap() {
        EventOutcome::Activated(report) => report,
        other => panic!("unexpected outcome: {other:?}"),
    };

    assert_eq!(report.failed, vec!["v0-locked".to_string()]);
    let mut deleted = report.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["old".to_string(), "v0".to_string()]);
    assert_eq!(agent.phase(), Phase::Activated);
    assert_eq!(
        storage.names().await.unwrap(),
        vec!["v0-locked".to_string(), "v1".to_string()]
    );
}

#[tokio::test]
async fn failed_background_write_still_answers_the_request() {
    let storage = Arc::new(FaultyStorage::new("none"));
    storage.read_only.store(true, Ordering::SeqCst);
    let fetcher = ScriptedFetcher::new();
    fetcher.serve("./app.js", StatusCode::OK, "console.log(1)");
    let cache = CacheManager::new(config("v1"), storage.clone(), fetcher.clone());

    let request = FetchRequest::get(url("./app.js"));
    let response = cache.resolve(&request).await.expect("network response");
    assert_eq!(body_text(&response), "console.log(1)");
    assert_eq!(cache.flush_pending_writes().await, 1);

    assert_eq!(storage.inner.open("v1").await.unwrap().len().await.unwrap(), 0);
    let again = cache.resolve(&request).await.expect("network response");
    assert_eq!(body_text(&again), "console.log(1)");
    assert_eq!(fetcher.calls().len(), 2);
}
