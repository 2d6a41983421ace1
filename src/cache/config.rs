//! Cache configuration.
//!
//! Names the active cache generation, the asset manifest warmed on install,
//! and the document served when a page load fails offline.

use url::Url;

use super::request::{Destination, FetchRequest};

pub const DEFAULT_CACHE_VERSION: &str = "random-saccade-v1.0.0";
pub const DEFAULT_FALLBACK: &str = "./index.html";
pub const DEFAULT_MANIFEST: [&str; 3] = ["./", "./index.html", "./manifest.json"];

/// Resolved cache configuration; every URL is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Name of the active cache store.
    pub version: String,
    /// Absolute base URL every relative manifest entry resolves against.
    pub scope: Url,
    /// Resources required for offline operation, in manifest order.
    pub manifest: Vec<Url>,
    /// Document returned for page loads that fail offline.
    pub fallback: Url,
}

impl CacheConfig {
    /// Resolve `manifest` and `fallback` entries against `scope`.
    pub fn resolve(
        version: impl Into<String>,
        scope: Url,
        manifest: &[String],
        fallback: &str,
    ) -> Result<Self, url::ParseError> {
        let manifest = manifest
            .iter()
            .map(|entry| scope.join(entry))
            .collect::<Result<Vec<_>, _>>()?;
        let fallback = scope.join(fallback)?;

        Ok(Self {
            version: version.into(),
            scope,
            manifest,
            fallback,
        })
    }

    /// Manifest entries as requests, duplicates removed, order preserved.
    pub fn manifest_requests(&self) -> Vec<FetchRequest> {
        let mut seen = Vec::with_capacity(self.manifest.len());
        for url in &self.manifest {
            if !seen.contains(url) {
                seen.push(url.clone());
            }
        }
        seen.into_iter().map(FetchRequest::get).collect()
    }

    pub fn fallback_request(&self) -> FetchRequest {
        FetchRequest::get(self.fallback.clone()).with_destination(Destination::Document)
    }
}
