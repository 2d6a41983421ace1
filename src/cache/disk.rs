//! Filesystem-backed cache storage.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/<hex(store name)>/<sha256(key)>.json            entry metadata
//! <root>/<hex(store name)>/<sha256(key)>-<body hash>.body response body
//! ```
//!
//! The metadata document names its body file. Bodies are written first and
//! the metadata is committed last through a rename, so a reader sees either
//! the previous entry or the new one, never a mix.
//!
//! A crash between those steps can leave a temp file or an unreferenced body
//! behind. The first open of each store in a process sweeps both.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::keys::{RequestKey, VaryRule};
use super::lock::mutex_lock;
use super::request::{FetchRequest, ResponseType};
use super::store::{CacheStorage, CacheStore, CachedEntry, StoreError};

const SOURCE: &str = "cache::disk";
const META_EXTENSION: &str = "json";
const BODY_EXTENSION: &str = "body";
const TEMP_PREFIX: &str = ".tmp-";

/// Persistent storage rooted at a directory.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    swept: Mutex<HashSet<String>>,
}

impl DiskStorage {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            swept: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(hex::encode(name.as_bytes()))
    }

    /// True the first time `name` is seen by this storage.
    fn claim_sweep(&self, name: &str) -> bool {
        mutex_lock(&self.swept, SOURCE, "claim_sweep").insert(name.to_string())
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        let dir = self.store_dir(name);
        fs::create_dir_all(&dir).await?;
        let store = DiskStore {
            name: name.to_string(),
            dir,
        };

        if self.claim_sweep(name) {
            match store.sweep().await {
                Ok(0) => {}
                Ok(removed) => info!(
                    target = "stashpoint::cache::disk",
                    cache = %name,
                    removed,
                    "removed leftover cache files"
                ),
                Err(error) => warn!(
                    target = "stashpoint::cache::disk",
                    cache = %name,
                    error = %error,
                    "failed to sweep cache directory"
                ),
            }
        }

        Ok(Arc::new(store))
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(decoded) = entry
                .file_name()
                .to_str()
                .and_then(|value| hex::decode(value).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
            else {
                continue;
            };
            names.push(decoded);
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        match fs::remove_dir_all(self.store_dir(name)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

/// A single store directory.
#[derive(Debug)]
pub struct DiskStore {
    name: String,
    dir: PathBuf,
}

impl DiskStore {
    fn meta_path(&self, key: &RequestKey) -> PathBuf {
        self.dir.join(format!("{}.{META_EXTENSION}", key.digest()))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<EntryRecord>, StoreError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::corrupt(path.display().to_string(), err))
    }

    async fn write_atomic(&self, target: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let temp = self.dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(contents).await?;
            file.flush().await?;
            fs::rename(&temp, target).await
        }
        .await;

        if result.is_err() {
            remove_quietly(&temp).await;
        }
        result.map_err(StoreError::Io)
    }

    /// Remove temp files and bodies no metadata document points at.
    ///
    /// Bodies sharing a key digest with an unreadable metadata document are kept.
    async fn sweep(&self) -> Result<usize, StoreError> {
        let mut leftovers = Vec::new();
        let mut bodies = Vec::new();
        let mut referenced = HashSet::new();
        let mut unreadable = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(StoreError::Io(err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if file_name.starts_with(TEMP_PREFIX) {
                leftovers.push(path);
                continue;
            }
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(META_EXTENSION) => match self.read_record(&path).await {
                    Ok(Some(record)) => {
                        referenced.insert(record.body_file);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        debug!(
                            target = "stashpoint::cache::disk",
                            path = %path.display(),
                            error = %error,
                            "keeping bodies of unreadable entry"
                        );
                        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                            unreadable.push(format!("{stem}-"));
                        }
                    }
                },
                Some(BODY_EXTENSION) => bodies.push((file_name, path)),
                _ => {}
            }
        }

        leftovers.extend(bodies.into_iter().filter_map(|(file_name, path)| {
            let kept = referenced.contains(&file_name)
                || unreadable.iter().any(|prefix| file_name.starts_with(prefix));
            (!kept).then_some(path)
        }));

        let mut removed = 0;
        for path in leftovers {
            if remove_quietly(&path).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn meta_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(StoreError::Io(err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if !is_temp && path.extension().is_some_and(|ext| ext == META_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, request: &FetchRequest) -> Result<Option<CachedEntry>, StoreError> {
        if request.method != Method::GET {
            return Ok(None);
        }

        let key = RequestKey::for_request(request);
        let path = self.meta_path(&key);
        let Some(record) = self.read_record(&path).await? else {
            return Ok(None);
        };
        if record.key != key {
            return Ok(None);
        }

        let body = match fs::read(self.dir.join(&record.body_file)).await {
            Ok(body) => Bytes::from(body),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(
                    target = "stashpoint::cache::disk",
                    key = %key,
                    "entry replaced during read"
                );
                return Ok(None);
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        let entry = record.into_entry(body, &path)?;
        Ok(entry.matches(request).then_some(entry))
    }

    async fn put(&self, entry: CachedEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;

        let meta_path = self.meta_path(&entry.key);
        let previous = self.read_record(&meta_path).await.ok().flatten();

        let body_file = format!(
            "{}-{}.{BODY_EXTENSION}",
            entry.key.digest(),
            body_hash(&entry.body)
        );
        self.write_atomic(&self.dir.join(&body_file), &entry.body).await?;

        let record = EntryRecord::from_entry(&entry, body_file.clone());
        let encoded = serde_json::to_vec(&record).map_err(|source| StoreError::Encode {
            key: entry.key.to_string(),
            source,
        })?;
        self.write_atomic(&meta_path, &encoded).await?;

        if let Some(previous) = previous
            && previous.body_file != body_file
        {
            remove_quietly(&self.dir.join(previous.body_file)).await;
        }

        Ok(())
    }

    async fn requests(&self) -> Result<Vec<FetchRequest>, StoreError> {
        let mut requests = Vec::new();
        for path in self.meta_files().await? {
            if let Some(record) = self.read_record(&path).await? {
                requests.push(record.to_request(&path)?);
            }
        }
        Ok(requests)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.meta_files().await?.len())
    }
}

/// Best-effort removal. Failures other than an already missing file are logged.
async fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            warn!(
                target = "stashpoint::cache::disk",
                path = %path.display(),
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

fn body_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// On-disk metadata document.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    key: RequestKey,
    request_headers: Vec<(String, String)>,
    vary: VaryRule,
    status: u16,
    headers: Vec<(String, String)>,
    response_url: String,
    kind: ResponseType,
    stored_at: i64,
    body_file: String,
}

impl EntryRecord {
    fn from_entry(entry: &CachedEntry, body_file: String) -> Self {
        Self {
            key: entry.key.clone(),
            request_headers: encode_headers(&entry.request_headers),
            vary: entry.vary.clone(),
            status: entry.status.as_u16(),
            headers: encode_headers(&entry.headers),
            response_url: entry.url.to_string(),
            kind: entry.kind,
            stored_at: entry.stored_at.unix_timestamp(),
            body_file,
        }
    }

    fn into_entry(self, body: Bytes, path: &Path) -> Result<CachedEntry, StoreError> {
        let location = || path.display().to_string();
        let status = StatusCode::from_u16(self.status)
            .map_err(|err| StoreError::corrupt(location(), err))?;
        let url =
            Url::parse(&self.response_url).map_err(|err| StoreError::corrupt(location(), err))?;
        let stored_at = OffsetDateTime::from_unix_timestamp(self.stored_at)
            .map_err(|err| StoreError::corrupt(location(), err))?;

        Ok(CachedEntry {
            key: self.key,
            request_headers: decode_headers(&self.request_headers),
            vary: self.vary,
            status,
            headers: decode_headers(&self.headers),
            body,
            url,
            kind: self.kind,
            stored_at,
        })
    }

    fn to_request(&self, path: &Path) -> Result<FetchRequest, StoreError> {
        let url = Url::parse(self.key.url())
            .map_err(|err| StoreError::corrupt(path.display().to_string(), err))?;
        let mut request = FetchRequest::get(url);
        request.headers = decode_headers(&self.request_headers);
        Ok(request)
    }
}

fn encode_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn decode_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}
