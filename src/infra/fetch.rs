//! Network fetcher backed by `reqwest`.

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::cache::{FetchError, FetchRequest, FetchResponse, Fetcher, ResponseType};

use super::error::InfraError;

/// Headers owned by the connection rather than the request.
const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::HOST,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
    header::TE,
];

/// Fetches over HTTP and classifies responses against the application scope.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
    scope: Url,
}

impl HttpFetcher {
    pub fn new(scope: Url) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self { client, scope })
    }

    pub fn user_agent() -> &'static str {
        concat!("stashpoint/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(forwardable(&request.headers));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_builder() {
                FetchError::invalid_request(&request.url, err)
            } else {
                FetchError::network(&request.url, err)
            }
        })?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::network(&request.url, err))?;

        let kind = ResponseType::classify(&self.scope, &final_url);
        debug!(
            target = "stashpoint::fetch",
            url = %request.url,
            status = status.as_u16(),
            kind = ?kind,
            "network response"
        );

        Ok(FetchResponse {
            status,
            headers,
            body,
            url: final_url,
            kind,
        })
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in &HOP_BY_HOP {
        forwarded.remove(name);
    }
    forwarded
}
