#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode, header};
use stashpoint::cache::{
    CacheConfig, CacheManager, CacheStorage, FetchError, FetchRequest, FetchResponse, Fetcher,
    ResponseType,
};
use url::Url;

pub const SCOPE: &str = "https://saccade.example/app/";

pub fn scope() -> Url {
    Url::parse(SCOPE).expect("scope should parse")
}

pub fn url(path: &str) -> Url {
    scope().join(path).expect("path should resolve")
}

pub fn config(version: &str) -> CacheConfig {
    CacheConfig::resolve(
        version,
        scope(),
        &[
            "./".to_string(),
            "./index.html".to_string(),
            "./manifest.json".to_string(),
        ],
        "./index.html",
    )
    .expect("default manifest should resolve")
}

pub fn manager(
    version: &str,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<ScriptedFetcher>,
) -> CacheManager {
    CacheManager::new(config(version), storage, fetcher)
}

#[derive(Clone)]
struct Route {
    status: StatusCode,
    kind: ResponseType,
    body: String,
    vary: Option<String>,
}

/// In-process network: answers from a route table, or fails every request
/// while offline.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    offline: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_app_shell(self: Arc<Self>, label: &str) -> Arc<Self> {
        self.serve_app_shell(label);
        self
    }

    /// Answer every manifest entry of [`config`] with 200 and `"{label} {path}"`.
    pub fn serve_app_shell(&self, label: &str) {
        for path in ["./", "./index.html", "./manifest.json"] {
            self.serve(path, StatusCode::OK, &format!("{label} {path}"));
        }
    }

    pub fn serve(&self, path: &str, status: StatusCode, body: &str) {
        self.route(path, status, ResponseType::Basic, body);
    }

    pub fn route(&self, path: &str, status: StatusCode, kind: ResponseType, body: &str) {
        self.routes.lock().unwrap().insert(
            url(path).to_string(),
            Route {
                status,
                kind,
                body: body.to_string(),
                vary: None,
            },
        );
    }

    /// Attach a `Vary` header to an existing route.
    pub fn vary(&self, path: &str, value: &str) {
        if let Some(route) = self.routes.lock().unwrap().get_mut(url(path).as_str()) {
            route.vary = Some(value.to_string());
        }
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(request.url.to_string());
        if *self.offline.lock().unwrap() {
            return Err(FetchError::network(&request.url, "network unreachable"));
        }

        let mut target = request.url.clone();
        target.set_fragment(None);
        let route = self.routes.lock().unwrap().get(target.as_str()).cloned();
        match route {
            Some(route) => {
                let response =
                    FetchResponse::new(route.status, request.url.clone(), route.kind, route.body);
                Ok(match route.vary {
                    Some(vary) => response.with_header(
                        header::VARY,
                        HeaderValue::from_str(&vary).expect("vary header value"),
                    ),
                    None => response,
                })
            }
            None => Ok(FetchResponse::new(
                StatusCode::NOT_FOUND,
                request.url.clone(),
                ResponseType::Basic,
                "not found",
            )),
        }
    }
}

pub fn body_text(response: &FetchResponse) -> String {
    String::from_utf8(response.body.to_vec()).expect("utf-8 body")
}
