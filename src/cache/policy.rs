//! Which fetched responses may be written to the cache.

use axum::http::StatusCode;

use super::request::{FetchResponse, ResponseType};

/// Responses fetched on the request path are stored only when they are a
/// plain `200 OK` from the application's own origin.
pub fn is_cacheable(response: &FetchResponse) -> bool {
    response.status == StatusCode::OK && response.kind == ResponseType::Basic
}

/// Background refresh overwrites an entry on any `200 OK`.
pub fn is_refreshable(response: &FetchResponse) -> bool {
    response.status == StatusCode::OK
}
