use reqwest::Method;
use serde_json::Value;
use url::Url;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// A full document load (address bar, link click, reload)
  Navigate,
  /// Scripts, styles, images, API calls
  #[default]
  Subresource,
}

/// A single intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  /// A sub-resource GET.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::default(),
    }
  }

  /// A top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Key used for cache lookups. Fragments never reach the server, so they
  /// never distinguish entries.
  pub fn cache_key(&self) -> String {
    cache_key(&self.url)
  }
}

pub fn cache_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// A complete, buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url: url.into(),
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Synthesize a `200 OK` JSON response around a payload.
  pub fn json(url: impl Into<String>, payload: &Value) -> Self {
    Self {
      url: url.into(),
      status: 200,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: payload.to_string().into_bytes(),
    }
  }

  /// Status in the 200-299 range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Parse the body as JSON.
  pub fn json_body(&self) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(&self.body)
  }
}
