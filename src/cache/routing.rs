//! Request classification: an ordered list of rules, first match wins.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::Request;

/// How a fetch event is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Network, falling back to the last stored payload, then `[]`
  NetworkFirst,
  /// Cache, falling back to network, then the offline page
  CacheFirst,
  /// Network only, writing every success into the cache
  Dynamic,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Strategy::NetworkFirst => "network-first",
      Strategy::CacheFirst => "cache-first",
      Strategy::Dynamic => "dynamic",
    };
    f.pad(name)
  }
}

/// A predicate over requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
  /// Origin and path equal the target's; query and fragment are ignored.
  OriginPath(Url),
  /// The request is a full document load.
  Navigate,
  /// The request path starts with the prefix.
  PathPrefix(String),
}

impl Rule {
  pub fn matches(&self, request: &Request) -> bool {
    match self {
      Rule::OriginPath(target) => {
        request.url.origin() == target.origin() && request.url.path() == target.path()
      }
      Rule::Navigate => request.is_navigation(),
      Rule::PathPrefix(prefix) => request.url.path().starts_with(prefix.as_str()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Route {
  pub rule: Rule,
  pub strategy: Strategy,
}

/// Ordered routes plus a mandatory fallback strategy.
#[derive(Debug, Clone)]
pub struct Router {
  routes: Vec<Route>,
  fallback: Strategy,
}

impl Router {
  pub fn new(routes: Vec<Route>, fallback: Strategy) -> Self {
    Self { routes, fallback }
  }

  /// The stock routing table: the live events endpoint goes network-first,
  /// page loads go cache-first, everything else is cached dynamically.
  pub fn standard(api_match: Url) -> Self {
    Self::new(
      vec![
        Route {
          rule: Rule::OriginPath(api_match),
          strategy: Strategy::NetworkFirst,
        },
        Route {
          rule: Rule::Navigate,
          strategy: Strategy::CacheFirst,
        },
      ],
      Strategy::Dynamic,
    )
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    self
      .routes
      .iter()
      .find(|route| route.rule.matches(request))
      .map(|route| route.strategy)
      .unwrap_or(self.fallback)
  }

  pub fn routes(&self) -> &[Route] {
    &self.routes
  }
}
