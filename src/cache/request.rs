//! Intercepted requests and the responses produced for them.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the requesting page intends to use the resource.
///
/// Mirrors the `Sec-Fetch-Dest` vocabulary; only [`Destination::Document`]
/// changes the offline behaviour of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Top-level page load.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    /// No destination reported (XHR, `fetch()`, prefetch).
    #[default]
    Empty,
    Other,
}

impl Destination {
    /// Parse a `Sec-Fetch-Dest` header value.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            "script" => Self::Script,
            "style" => Self::Style,
            "image" => Self::Image,
            "font" => Self::Font,
            "manifest" => Self::Manifest,
            "" | "empty" => Self::Empty,
            _ => Self::Other,
        }
    }

    pub fn is_document(self) -> bool {
        matches!(self, Self::Document)
    }
}

/// A request intercepted on behalf of the application.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// Forwarded upstream as-is; never part of the cache key.
    pub body: Bytes,
    pub destination: Destination,
}

impl FetchRequest {
    /// Plain `GET` with no headers and no destination.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            destination: Destination::Empty,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Classification of a response relative to the application origin.
///
/// Only `basic` (same-origin, readable) responses are ever cached from the
/// request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Basic,
    Cors,
    Opaque,
    Error,
}

impl ResponseType {
    /// Classify a response by comparing its final URL against the scope origin.
    pub fn classify(scope: &Url, response_url: &Url) -> Self {
        if scope.origin() == response_url.origin() {
            Self::Basic
        } else {
            Self::Cors
        }
    }
}

/// A fully buffered response.
///
/// Cloning shares the body buffer, so handing one copy to the caller and
/// another to the cache writer never consumes the original.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub kind: ResponseType,
}

impl FetchResponse {
    pub fn new(status: StatusCode, url: Url, kind: ResponseType, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            url,
            kind,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// True for any 2xx status.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_parses_known_values() {
        assert_eq!(Destination::from_header("document"), Destination::Document);
        assert_eq!(Destination::from_header(" Image "), Destination::Image);
        assert_eq!(Destination::from_header(""), Destination::Empty);
        assert_eq!(Destination::from_header("audioworklet"), Destination::Other);
    }

    #[test]
    fn only_document_is_document() {
        assert!(Destination::Document.is_document());
        assert!(!Destination::Image.is_document());
        assert!(!Destination::Empty.is_document());
    }

    #[test]
    fn classify_compares_origins() {
        let scope = Url::parse("https://app.example/saccade/").unwrap();
        let same = Url::parse("https://app.example/other/a.js").unwrap();
        let cross = Url::parse("https://cdn.example/a.js").unwrap();

        assert_eq!(ResponseType::classify(&scope, &same), ResponseType::Basic);
        assert_eq!(ResponseType::classify(&scope, &cross), ResponseType::Cors);
    }
}
