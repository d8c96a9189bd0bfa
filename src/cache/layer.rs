//! Cache layer that answers requests with one of the three strategies.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, error, warn};
use url::Url;

use super::storage::CacheStorage;
use crate::db::PayloadStore;
use crate::http::{FetchError, Fetcher, Request, Response};

/// Cache layer that combines the network, the named cache bucket and the
/// payload store.
///
/// Clones share the same fetcher and stores.
pub struct CacheLayer<F: Fetcher, S: CacheStorage> {
  fetcher: Arc<F>,
  storage: Arc<S>,
  payloads: Arc<PayloadStore>,
  /// Bucket that receives every write
  bucket: String,
  /// Page served when a navigation fails and is not cached
  offline_url: Url,
}

impl<F: Fetcher, S: CacheStorage> CacheLayer<F, S> {
  pub fn new(
    fetcher: F,
    storage: S,
    payloads: PayloadStore,
    bucket: impl Into<String>,
    offline_url: Url,
  ) -> Self {
    Self {
      fetcher: Arc::new(fetcher),
      storage: Arc::new(storage),
      payloads: Arc::new(payloads),
      bucket: bucket.into(),
      offline_url,
    }
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn payloads(&self) -> &PayloadStore {
    &self.payloads
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  /// Serve from cache, never revalidating.
  ///
  /// 1. Cached response -> returned without touching the network
  /// 2. Miss -> network, and the response is cached whatever its status
  /// 3. Network failure -> cached offline page, or `None` if that is missing
  ///
  /// Only GET requests can hit; anything else always goes to the network.
  pub async fn cache_first(&self, request: &Request) -> Option<Response> {
    if request.method == Method::GET {
      if let Some(cached) = self.lookup(&request.url) {
        debug!(url = %request.url, "cache hit");
        return Some(cached);
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(request, &response);
        Some(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "navigation failed, trying offline page");
        self.lookup(&self.offline_url)
      }
    }
  }

  /// Prefer fresh data, falling back to the last payload that was good.
  ///
  /// The caller always gets a response: the network response on success, a
  /// `200` wrapping the stored payload on failure, or a `200` with `[]` when
  /// nothing was ever stored. The original error status is not preserved.
  pub async fn network_first(&self, request: &Request) -> Response {
    let url = request.cache_key();

    match self.fetch_json(request).await {
      Ok((response, payload)) => {
        if let Err(e) = self.payloads.put(&url, &payload) {
          warn!(url = %url, error = %e, "failed to store payload");
        }
        response
      }
      Err(e) => {
        warn!(url = %url, error = %e, "network-first fetch failed, serving stored payload");
        let payload = self
          .payloads
          .get(&url)
          .unwrap_or_else(|| Value::Array(Vec::new()));
        Response::json(url, &payload)
      }
    }
  }

  /// Always go to the network and cache whatever comes back.
  ///
  /// This strategy never reads the cache and has no fallback: a network
  /// failure yields `None`.
  pub async fn dynamic(&self, request: &Request) -> Option<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(request, &response);
        Some(response)
      }
      Err(e) => {
        error!(url = %request.url, error = %e, "fetch failed");
        None
      }
    }
  }

  /// Fetch and require a 2xx response with a JSON body.
  pub async fn fetch_json(&self, request: &Request) -> Result<(Response, Value), FetchError> {
    let response = self.fetcher.fetch(request).await?;

    if !response.ok() {
      return Err(FetchError::Status {
        status: response.status,
        url: request.url.to_string(),
      });
    }

    let payload = response.json_body()?;
    Ok((response, payload))
  }

  fn lookup(&self, url: &Url) -> Option<Response> {
    match self.storage.match_any(url) {
      Ok(found) => found,
      Err(e) => {
        warn!(url = %url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  fn store(&self, request: &Request, response: &Response) {
    match self.storage.put(&self.bucket, request, response) {
      Ok(()) => debug!(url = %request.url, bucket = %self.bucket, "cached response"),
      Err(e) => warn!(url = %request.url, error = %e, "failed to cache response"),
    }
  }
}

impl<F: Fetcher, S: CacheStorage> Clone for CacheLayer<F, S> {
  fn clone(&self) -> Self {
    Self {
      fetcher: Arc::clone(&self.fetcher),
      storage: Arc::clone(&self.storage),
      payloads: Arc::clone(&self.payloads),
      bucket: self.bucket.clone(),
      offline_url: self.offline_url.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::StoreLocation;
  use crate::http::scripted::ScriptedFetcher;
  use serde_json::json;

  const ORIGIN: &str = "http://localhost:3000";
  const API: &str = "https://localhost:3000/events";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn layer() -> CacheLayer<ScriptedFetcher, SqliteStorage> {
    CacheLayer::new(
      ScriptedFetcher::new(),
      SqliteStorage::open_in_memory().unwrap(),
      PayloadStore::new(StoreLocation::Memory, "test", 1, "api-responses"),
      "shell-v1",
      url("/offline"),
    )
  }

  fn api_request() -> Request {
    Request::get(Url::parse(API).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let layer = layer();
    let request = Request::navigate(url("/login"));
    let cached = Response::new(url("/login").as_str(), 200, "<login>");
    layer.storage().put("shell-v1", &request, &cached).unwrap();

    let response = layer.cache_first(&request).await;

    assert_eq!(response, Some(cached));
    assert_eq!(layer.fetcher().total_calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_post_goes_to_network() {
    let layer = layer();
    let login = url("/login");
    let form = Response::new(login.as_str(), 200, "<login form>");
    layer
      .storage()
      .put("shell-v1", &Request::get(login.clone()), &form)
      .unwrap();
    layer.fetcher().respond(login.as_str(), 303, "");

    let submit = Request::navigate(login.clone()).with_method(Method::POST);
    let response = layer.cache_first(&submit).await.unwrap();

    assert_eq!(response.status, 303);
    assert_eq!(layer.fetcher().calls_for(login.as_str()), 1);
    // The POST response does not replace the cached form
    let cached = layer.storage().match_in("shell-v1", &login).unwrap();
    assert_eq!(cached, Some(form));
  }

  #[tokio::test]
  async fn test_cache_first_post_offline_serves_offline_page() {
    let layer = layer();
    let offline = Response::new(url("/offline").as_str(), 200, "you are offline");
    layer
      .storage()
      .put("shell-v1", &Request::get(url("/offline")), &offline)
      .unwrap();

    let submit = Request::navigate(url("/login")).with_method(Method::POST);
    let response = layer.cache_first(&submit).await;

    assert_eq!(response, Some(offline));
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let layer = layer();
    layer.fetcher().respond(url("/events/42").as_str(), 200, "<event>");
    let request = Request::navigate(url("/events/42"));

    let first = layer.cache_first(&request).await.unwrap();
    let second = layer.cache_first(&request).await.unwrap();

    assert_eq!(first.body, b"<event>");
    assert_eq!(second, first);
    assert_eq!(layer.fetcher().calls_for(url("/events/42").as_str()), 1);
  }

  #[tokio::test]
  async fn test_cache_first_stores_error_pages_too() {
    let layer = layer();
    layer.fetcher().respond(url("/missing").as_str(), 404, "not found");
    let request = Request::navigate(url("/missing"));

    let response = layer.cache_first(&request).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(layer
      .storage()
      .match_in("shell-v1", &url("/missing"))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_cache_first_failure_serves_offline_page() {
    let layer = layer();
    let offline = Response::new(url("/offline").as_str(), 200, "you are offline");
    layer
      .storage()
      .put("shell-v1", &Request::get(url("/offline")), &offline)
      .unwrap();

    let response = layer.cache_first(&Request::navigate(url("/checkout"))).await;

    assert_eq!(response, Some(offline));
  }

  #[tokio::test]
  async fn test_cache_first_double_miss_yields_nothing() {
    let layer = layer();

    let response = layer.cache_first(&Request::navigate(url("/checkout"))).await;

    assert!(response.is_none());
  }

  #[tokio::test]
  async fn test_network_first_success_stores_payload() {
    let layer = layer();
    layer.fetcher().respond(API, 200, r#"[{"id":1}]"#);

    let response = layer.network_first(&api_request()).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, br#"[{"id":1}]"#);
    assert_eq!(layer.payloads().get(API), Some(json!([{"id": 1}])));
    // Network-first never writes into the bucket
    assert!(layer.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_offline_serves_stored_payload() {
    let layer = layer();
    layer.fetcher().respond(API, 200, r#"[{"id":7}]"#);
    layer.network_first(&api_request()).await;

    layer.fetcher().go_offline();
    let response = layer.network_first(&api_request()).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.json_body().unwrap(), json!([{"id": 7}]));
    assert_eq!(response.header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_network_first_without_history_serves_empty_list() {
    let layer = layer();

    let response = layer.network_first(&api_request()).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"[]");
  }

  #[tokio::test]
  async fn test_network_first_ignores_fragment() {
    let layer = layer();
    layer.fetcher().respond(API, 200, r#"[{"id":3}]"#);
    let with_fragment = Request::get(Url::parse(&format!("{}#upcoming", API)).unwrap());

    layer.network_first(&with_fragment).await;
    layer.fetcher().go_offline();
    let response = layer.network_first(&api_request()).await;

    assert_eq!(layer.payloads().get(API), Some(json!([{"id": 3}])));
    assert_eq!(response.json_body().unwrap(), json!([{"id": 3}]));
  }

  #[tokio::test]
  async fn test_network_first_error_status_is_masked() {
    let layer = layer();
    layer.payloads().put(API, &json!(["stale"])).unwrap();
    layer.fetcher().respond(API, 503, r#"{"error":"down"}"#);

    let response = layer.network_first(&api_request()).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.json_body().unwrap(), json!(["stale"]));
    // The failed body must not replace the stored payload
    assert_eq!(layer.payloads().get(API), Some(json!(["stale"])));
  }

  #[tokio::test]
  async fn test_network_first_invalid_json_falls_back() {
    let layer = layer();
    layer.fetcher().respond(API, 200, "<html>oops</html>");

    let response = layer.network_first(&api_request()).await;

    assert_eq!(response.body, b"[]");
    assert_eq!(layer.payloads().get(API), None);
  }

  #[tokio::test]
  async fn test_fetch_json_distinguishes_failures() {
    let layer = layer();

    layer.fetcher().fail(API);
    assert!(matches!(
      layer.fetch_json(&api_request()).await,
      Err(FetchError::Network(_))
    ));

    layer.fetcher().respond(API, 500, "[]");
    assert!(matches!(
      layer.fetch_json(&api_request()).await,
      Err(FetchError::Status { status: 500, .. })
    ));

    layer.fetcher().respond(API, 200, "{not json");
    assert!(matches!(
      layer.fetch_json(&api_request()).await,
      Err(FetchError::Parse(_))
    ));
  }

  #[tokio::test]
  async fn test_dynamic_always_fetches_and_overwrites() {
    let layer = layer();
    let script = url("/_next/static/app.js");
    let request = Request::get(script.clone());

    layer.fetcher().respond(script.as_str(), 200, "v1");
    layer.dynamic(&request).await.unwrap();
    layer.fetcher().respond(script.as_str(), 200, "v2");
    let response = layer.dynamic(&request).await.unwrap();

    assert_eq!(response.body, b"v2");
    assert_eq!(layer.fetcher().calls_for(script.as_str()), 2);
    let cached = layer.storage().match_in("shell-v1", &script).unwrap().unwrap();
    assert_eq!(cached.body, b"v2");
  }

  #[tokio::test]
  async fn test_dynamic_post_is_fetched_but_not_cached() {
    let layer = layer();
    let checkout = url("/api/checkout");
    layer.fetcher().respond(checkout.as_str(), 201, r#"{"ok":true}"#);

    let request = Request::get(checkout.clone()).with_method(Method::POST);
    let response = layer.dynamic(&request).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(layer.fetcher().calls_for(checkout.as_str()), 1);
    assert!(layer.storage().match_in("shell-v1", &checkout).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_dynamic_failure_has_no_fallback() {
    let layer = layer();
    let script = url("/_next/static/app.js");
    let request = Request::get(script.clone());
    let cached = Response::new(script.as_str(), 200, "cached");
    layer.storage().put("shell-v1", &request, &cached).unwrap();

    let response = layer.dynamic(&request).await;

    // A cached copy exists, but dynamic never reads it
    assert!(response.is_none());
  }
}
