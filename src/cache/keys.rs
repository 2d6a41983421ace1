//! Cache key definitions.
//!
//! Entries are keyed by request identity: the method plus the URL with its
//! fragment removed. Header-sensitive matching (`Vary`) is layered on top by
//! [`VaryRule`].

use std::fmt;

use axum::http::{HeaderMap, Method, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use super::request::FetchRequest;

/// Negotiated by the connection, never by the page; `Vary` on these is ignored.
const TRANSPORT_HEADERS: [&str; 8] = [
    "accept-encoding",
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
];

fn is_transport_header(name: &str) -> bool {
    TRANSPORT_HEADERS.contains(&name)
}

/// Normalized request identity; unique within a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &FetchRequest) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stable hex digest used to name on-disk entries.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Request headers that a stored response varies on, with the values the
/// original request carried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryRule {
    wildcard: bool,
    headers: Vec<(String, Option<String>)>,
}

impl VaryRule {
    /// Capture the rule from a response's `Vary` header and the request that produced it.
    pub fn capture(request_headers: &HeaderMap, response_headers: &HeaderMap) -> Self {
        let mut rule = Self::default();

        for value in response_headers.get_all(header::VARY) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for name in value.split(',') {
                let name = name.trim().to_ascii_lowercase();
                if name.is_empty() {
                    continue;
                }
                if name == "*" {
                    rule.wildcard = true;
                    continue;
                }
                if is_transport_header(&name) {
                    continue;
                }
                if rule.headers.iter().any(|(existing, _)| *existing == name) {
                    continue;
                }
                let request_value = request_headers
                    .get(name.as_str())
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                rule.headers.push((name, request_value));
            }
        }

        rule
    }

    /// True when `request_headers` satisfies the captured rule.
    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        if self.wildcard {
            return false;
        }
        self.headers.iter().all(|(name, expected)| {
            if is_transport_header(name) {
                return true;
            }
            let actual = request_headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok());
            actual == expected.as_deref()
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).unwrap()
    }

    #[test]
    fn key_ignores_fragment() {
        let a = RequestKey::new(&Method::GET, &url("https://app.example/index.html#top"));
        let b = RequestKey::new(&Method::GET, &url("https://app.example/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn key_distinguishes_method_and_query() {
        let get = RequestKey::new(&Method::GET, &url("https://app.example/a?x=1"));
        let head = RequestKey::new(&Method::HEAD, &url("https://app.example/a?x=1"));
        let other = RequestKey::new(&Method::GET, &url("https://app.example/a?x=2"));
        assert_ne!(get, head);
        assert_ne!(get, other);
        assert_ne!(get.digest(), other.digest());
    }

    #[test]
    fn key_displays_method_and_url() {
        let key = RequestKey::new(&Method::GET, &url("https://app.example/"));
        assert_eq!(key.to_string(), "GET https://app.example/");
    }

    #[test]
    fn vary_rule_matches_recorded_header() {
        let mut request = HeaderMap::new();
        request.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("ja"));
        let mut response = HeaderMap::new();
        response.insert(header::VARY, HeaderValue::from_static("Accept-Language"));

        let rule = VaryRule::capture(&request, &response);
        assert!(rule.matches(&request));

        let mut english = HeaderMap::new();
        english.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        assert!(!rule.matches(&english));
        assert!(!rule.matches(&HeaderMap::new()));
    }

    #[test]
    fn vary_wildcard_never_matches() {
        let mut response = HeaderMap::new();
        response.insert(header::VARY, HeaderValue::from_static("*"));
        let rule = VaryRule::capture(&HeaderMap::new(), &response);
        assert!(!rule.matches(&HeaderMap::new()));
    }

    #[test]
    fn missing_vary_matches_everything() {
        let rule = VaryRule::capture(&HeaderMap::new(), &HeaderMap::new());
        assert_eq!(rule, VaryRule::default());
        let mut request = HeaderMap::new();
        request.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        assert!(rule.matches(&request));
    }

    #[test]
    fn vary_on_accept_encoding_ignores_transport_negotiation() {
        let mut response = HeaderMap::new();
        response.insert(
            header::VARY,
            HeaderValue::from_static("Accept-Encoding, Accept-Language"),
        );
        let rule = VaryRule::capture(&HeaderMap::new(), &response);

        let mut browser = HeaderMap::new();
        browser.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );
        browser.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(rule.matches(&browser));

        browser.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("ja"));
        assert!(!rule.matches(&browser));
    }

    #[test]
    fn stored_transport_values_do_not_block_matches() {
        let rule = VaryRule {
            wildcard: false,
            headers: vec![("accept-encoding".to_string(), Some("identity".to_string()))],
        };
        let mut browser = HeaderMap::new();
        browser.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br"));
        assert!(rule.matches(&browser));
    }
}
