//! Interception proxy: every inbound request becomes a `Fetch` event.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use http_body_util::BodyExt;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::agent::{Agent, AppError, EventOutcome, LifecycleEvent};
use crate::cache::{Destination, FetchRequest, FetchResponse};

const SEC_FETCH_DEST: &str = "sec-fetch-dest";
const OFFLINE_BODY: &str = "offline: resource unavailable";

/// Headers recomputed by the server for every response.
const STRIPPED_RESPONSE_HEADERS: [header::HeaderName; 3] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
];

#[derive(Clone)]
pub struct ProxyState {
    agent: Arc<Agent>,
    scope: Url,
}

impl ProxyState {
    pub fn new(agent: Arc<Agent>) -> Self {
        let scope = agent.cache().config().scope.clone();
        Self { agent, scope }
    }
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/__stashpoint/sync/{tag}", post(sync_handler))
        .route("/__stashpoint/push", post(push_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    request: Request,
) -> Result<Response, AppError> {
    let request = to_fetch_request(&state.scope, request).await?;
    debug!(
        target = "stashpoint::proxy",
        method = %request.method,
        url = %request.url,
        destination = ?request.destination,
        "intercepted request"
    );

    match state.agent.dispatch(LifecycleEvent::Fetch(request)).await? {
        EventOutcome::Responded(Some(response)) => Ok(into_http_response(response)),
        EventOutcome::Responded(None) => {
            Ok((StatusCode::GATEWAY_TIMEOUT, OFFLINE_BODY).into_response())
        }
        other => Err(AppError::unexpected(format!(
            "fetch produced unexpected outcome: {other:?}"
        ))),
    }
}

async fn sync_handler(
    State(state): State<ProxyState>,
    Path(tag): Path<String>,
) -> Result<Response, AppError> {
    match state.agent.dispatch(LifecycleEvent::Sync { tag }).await? {
        EventOutcome::Synced(report) => Ok(Json(json!({
            "ran": report.ran,
            "refreshed": report.refreshed,
            "unchanged": report.unchanged,
            "failed": report.failed,
        }))
        .into_response()),
        other => Err(AppError::unexpected(format!(
            "sync produced unexpected outcome: {other:?}"
        ))),
    }
}

async fn push_handler(State(state): State<ProxyState>, body: Bytes) -> Result<Response, AppError> {
    let payload = if body.is_empty() {
        None
    } else {
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| AppError::validation("push payload must be UTF-8 text"))?;
        Some(text)
    };

    match state.agent.dispatch(LifecycleEvent::Push { payload }).await? {
        EventOutcome::Notified(notification) => Ok(Json(notification).into_response()),
        other => Err(AppError::unexpected(format!(
            "push produced unexpected outcome: {other:?}"
        ))),
    }
}

async fn to_fetch_request(scope: &Url, request: Request) -> Result<FetchRequest, AppError> {
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = scope
        .join(path_and_query.trim_start_matches('/'))
        .map_err(|err| AppError::validation(format!("unroutable request target: {err}")))?;

    let body = body
        .collect()
        .await
        .map_err(|err| AppError::unexpected(format!("failed to read request body: {err}")))?
        .to_bytes();

    let destination = destination_of(&parts.method, &parts.headers);

    Ok(FetchRequest {
        method: parts.method,
        url,
        headers: parts.headers,
        body,
        destination,
    })
}

/// `Sec-Fetch-Dest` when present; otherwise an HTML-accepting GET is a page load.
fn destination_of(method: &Method, headers: &HeaderMap) -> Destination {
    if let Some(value) = headers
        .get(SEC_FETCH_DEST)
        .and_then(|value| value.to_str().ok())
    {
        return Destination::from_header(value);
    }

    let wants_html = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/html"));

    if method == Method::GET && wants_html {
        Destination::Document
    } else {
        Destination::Empty
    }
}

fn into_http_response(response: FetchResponse) -> Response {
    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = response.status;

    let headers = http.headers_mut();
    *headers = response.headers;
    for name in &STRIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }

    http
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::{
        CacheConfig, CacheManager, FetchError, Fetcher, MemoryStorage, ResponseType,
    };
    use crate::config::NotificationSettings;

    #[derive(Default)]
    struct ScriptedFetcher {
        online: Mutex<bool>,
        seen: Mutex<Vec<(Method, String, Destination)>>,
    }

    impl ScriptedFetcher {
        fn set_online(&self, online: bool) {
            *self.online.lock().unwrap() = online;
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            self.seen.lock().unwrap().push((
                request.method.clone(),
                request.url.to_string(),
                request.destination,
            ));
            if !*self.online.lock().unwrap() {
                return Err(FetchError::network(&request.url, "offline"));
            }
            Ok(FetchResponse::new(
                StatusCode::OK,
                request.url.clone(),
                ResponseType::Basic,
                format!("fresh {}", request.url.path()),
            )
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("999"))
            .with_header(header::VARY, HeaderValue::from_static("Accept-Encoding")))
        }
    }

    fn router() -> (Router, Arc<Agent>, Arc<ScriptedFetcher>) {
        let scope = Url::parse("https://app.example/saccade/").unwrap();
        let config = CacheConfig::resolve(
            "v1",
            scope.clone(),
            &["./".to_string(), "./index.html".to_string()],
            "./index.html",
        )
        .unwrap();
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.set_online(true);
        let cache = Arc::new(CacheManager::new(
            config,
            Arc::new(MemoryStorage::new()),
            fetcher.clone(),
        ));
        let icon = scope.join("icon-512.png").unwrap();
        let notifications = NotificationSettings {
            title: "Random Saccade".to_string(),
            default_body: "Time to train!".to_string(),
            icon: icon.clone(),
            badge: icon,
            vibrate: vec![200, 100, 200],
            open_url: scope,
        };
        let agent = Arc::new(Agent::headless(cache, notifications));
        (build_router(ProxyState::new(agent.clone())), agent, fetcher)
    }

    fn request(method: Method, uri: &str, headers: &[(&'static str, &'static str)]) -> Request {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).expect("request should build")
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn destination_prefers_sec_fetch_dest() {
        let mut headers = HeaderMap::new();
        headers.insert(SEC_FETCH_DEST, HeaderValue::from_static("image"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        assert_eq!(destination_of(&Method::GET, &headers), Destination::Image);
    }

    #[test]
    fn html_get_without_dest_is_document() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert_eq!(destination_of(&Method::GET, &headers), Destination::Document);
        assert_eq!(destination_of(&Method::POST, &headers), Destination::Empty);
        assert_eq!(
            destination_of(&Method::GET, &HeaderMap::new()),
            Destination::Empty
        );
    }

    #[tokio::test]
    async fn requests_are_mapped_under_the_scope() {
        let (app, agent, fetcher) = router();

        let response = app
            .oneshot(request(Method::GET, "/app.js?v=2", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_LENGTH)
                .is_none_or(|value| value != "999")
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(body_text(response).await, "fresh /saccade/app.js");

        agent.cache().flush_pending_writes().await;
        let seen = fetcher.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(
                Method::GET,
                "https://app.example/saccade/app.js?v=2".to_string(),
                Destination::Empty
            )]
        );
    }

    #[tokio::test]
    async fn offline_miss_becomes_gateway_timeout() {
        let (app, _, fetcher) = router();
        fetcher.set_online(false);

        let response = app
            .oneshot(request(Method::GET, "/missing.png", &[("sec-fetch-dest", "image")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_text(response).await, OFFLINE_BODY);
    }

    #[tokio::test]
    async fn offline_page_load_serves_fallback() {
        let (app, agent, fetcher) = router();
        agent.dispatch(LifecycleEvent::Install).await.unwrap();
        fetcher.set_online(false);

        let response = app
            .oneshot(request(Method::GET, "/deep/link", &[("accept", "text/html")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "fresh /saccade/index.html");
    }

    #[tokio::test]
    async fn offline_browser_request_hits_warmed_entry() {
        let (app, agent, fetcher) = router();
        agent.dispatch(LifecycleEvent::Install).await.unwrap();
        fetcher.set_online(false);

        let response = app
            .oneshot(request(
                Method::GET,
                "/index.html",
                &[
                    ("accept-encoding", "gzip, deflate, br"),
                    ("connection", "keep-alive"),
                    ("sec-fetch-dest", "empty"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "fresh /saccade/index.html");
    }

    #[tokio::test]
    async fn sync_route_reports_refresh() {
        let (app, agent, _) = router();
        agent.dispatch(LifecycleEvent::Install).await.unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/__stashpoint/sync/update-cache", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(report["ran"], true);
        assert_eq!(report["refreshed"], 2);

        let response = app
            .oneshot(request(Method::POST, "/__stashpoint/sync/other-tag", &[]))
            .await
            .unwrap();
        let report: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(report["ran"], false);
    }

    #[tokio::test]
    async fn push_route_returns_notification() {
        let (app, _, _) = router();

        let push = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/__stashpoint/push")
            .body(Body::from("Round two"))
            .unwrap();
        let response = app.clone().oneshot(push).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let notification: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(notification["title"], "Random Saccade");
        assert_eq!(notification["body"], "Round two");
        assert_eq!(notification["data"]["primaryKey"], 1);

        let invalid = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/__stashpoint/push")
            .body(Body::from(vec![0xff, 0xfe]))
            .unwrap();
        let response = app.oneshot(invalid).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
