//! The network seam used by the cache manager.

use async_trait::async_trait;
use thiserror::Error;

use super::request::{FetchRequest, FetchResponse};

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced a response (offline, DNS, refused, reset).
    #[error("network request to `{url}` failed: {detail}")]
    Network { url: String, detail: String },
    #[error("request could not be built for `{url}`: {detail}")]
    InvalidRequest { url: String, detail: String },
}

impl FetchError {
    pub fn network(url: impl ToString, detail: impl ToString) -> Self {
        Self::Network {
            url: url.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn invalid_request(url: impl ToString, detail: impl ToString) -> Self {
        Self::InvalidRequest {
            url: url.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Performs network fetches on behalf of the cache manager.
///
/// Any HTTP status, including errors, is a successful fetch; only transport
/// failures are reported as [`FetchError`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}
