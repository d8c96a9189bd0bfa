use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{Route, Router, Rule, Strategy};
use crate::db::StoreLocation;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the app is served from; relative URLs resolve against it
  pub origin: String,
  pub cache: CacheConfig,
  pub store: StoreConfig,
  pub routing: RoutingConfig,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Versioned bucket name; any other bucket is purged on activation
  pub bucket: String,
  /// App-shell URLs cached at install time
  pub core_assets: Vec<String>,
  /// Page served when a navigation fails and is not cached
  pub offline_url: String,
  /// Cache database file (default: <data_dir>/shellcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Payload database name
  pub name: String,
  /// Schema version; raising it upgrades the store on next open
  pub version: u32,
  pub object_store: String,
  /// Directory holding the payload database (default: <data_dir>/shellcache)
  pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Endpoint answered network-first. Only origin and path are compared.
  pub api_match: String,
  /// Replaces the standard routing table when set
  pub routes: Option<Vec<RouteConfig>>,
  /// Strategy for requests no route matches
  pub fallback: Strategy,
}

/// One routing rule. Exactly one of the match fields must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
  pub strategy: Strategy,
  #[serde(default)]
  pub origin_path: Option<String>,
  #[serde(default)]
  pub navigate: bool,
  #[serde(default)]
  pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout; unset means wait as long as the network does
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      store: StoreConfig::default(),
      routing: RoutingConfig::default(),
      network: NetworkConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      bucket: "ticketing-shell-v1".to_string(),
      core_assets: ["/", "/login", "/events", "/images/logo.png"]
        .into_iter()
        .map(String::from)
        .collect(),
      offline_url: "/offline".to_string(),
      path: None,
    }
  }
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      name: "ticketing-offline".to_string(),
      version: 1,
      object_store: "api-responses".to_string(),
      dir: None,
    }
  }
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      api_match: "https://localhost:3000/events".to_string(),
      routes: None,
      fallback: Strategy::Dynamic,
    }
  }
}

fn parse_absolute(s: &str) -> Result<Url> {
  Url::parse(s).map_err(|e| eyre!("Invalid URL {}: {}", s, e))
}

impl RouteConfig {
  fn to_route(&self) -> Result<Route> {
    let rule = match (&self.origin_path, self.navigate, &self.path_prefix) {
      (Some(url), false, None) => Rule::OriginPath(parse_absolute(url)?),
      (None, true, None) => Rule::Navigate,
      (None, false, Some(prefix)) => Rule::PathPrefix(prefix.clone()),
      _ => {
        return Err(eyre!(
          "Route for {} must set exactly one of origin_path, navigate, path_prefix",
          self.strategy
        ))
      }
    };

    Ok(Route {
      rule,
      strategy: self.strategy,
    })
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()?.validated()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Apply `SHELLCACHE_ORIGIN` if set.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("SHELLCACHE_ORIGIN") {
      self.origin = origin;
    }
    Ok(self)
  }

  /// Reject configurations the worker cannot run with.
  pub fn validated(self) -> Result<Self> {
    if self.cache.bucket.trim().is_empty() {
      return Err(eyre!("cache.bucket must not be empty"));
    }
    if self.store.version == 0 {
      return Err(eyre!("store.version must be at least 1"));
    }
    if self.store.name.trim().is_empty() || self.store.object_store.trim().is_empty() {
      return Err(eyre!("store.name and store.object_store must not be empty"));
    }
    self.origin_url()?;
    self.core_asset_urls()?;
    self.offline_url()?;
    self.router()?;
    Ok(self)
  }

  pub fn origin_url(&self) -> Result<Url> {
    parse_absolute(&self.origin)
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL {}: {}", target, e))
  }

  pub fn core_asset_urls(&self) -> Result<Vec<Url>> {
    self
      .cache
      .core_assets
      .iter()
      .map(|asset| self.resolve(asset))
      .collect()
  }

  pub fn offline_url(&self) -> Result<Url> {
    self.resolve(&self.cache.offline_url)
  }

  pub fn router(&self) -> Result<Router> {
    match &self.routing.routes {
      Some(routes) => {
        let routes = routes
          .iter()
          .map(RouteConfig::to_route)
          .collect::<Result<Vec<_>>>()?;
        Ok(Router::new(routes, self.routing.fallback))
      }
      None => Ok(Router::standard(parse_absolute(&self.routing.api_match)?)),
    }
  }

  fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  pub fn store_location(&self) -> Result<StoreLocation> {
    let dir = match &self.store.dir {
      Some(dir) => dir.clone(),
      None => Self::data_dir()?,
    };
    Ok(StoreLocation::Dir(dir))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Request;

  #[test]
  fn test_defaults() {
    let config = Config::default().validated().unwrap();

    assert_eq!(config.cache.bucket, "ticketing-shell-v1");
    assert_eq!(
      config
        .core_asset_urls()
        .unwrap()
        .iter()
        .map(Url::as_str)
        .collect::<Vec<_>>(),
      vec![
        "http://localhost:3000/",
        "http://localhost:3000/login",
        "http://localhost:3000/events",
        "http://localhost:3000/images/logo.png",
      ]
    );
    assert_eq!(config.offline_url().unwrap().as_str(), "http://localhost:3000/offline");
    assert_eq!(config.routing.api_match, "https://localhost:3000/events");
    assert_eq!(config.network.timeout_secs, None);
  }

  #[test]
  fn test_partial_yaml_keeps_other_defaults() {
    let config = Config::parse(
      r#"
origin: https://tickets.example.com
cache:
  bucket: ticketing-shell-v7
routing:
  api_match: https://api.example.com/events
"#,
    )
    .unwrap()
    .validated()
    .unwrap();

    assert_eq!(config.cache.bucket, "ticketing-shell-v7");
    assert_eq!(config.cache.core_assets.len(), 4);
    assert_eq!(config.store.name, "ticketing-offline");
    assert_eq!(
      config.core_asset_urls().unwrap()[1].as_str(),
      "https://tickets.example.com/login"
    );

    let router = config.router().unwrap();
    let request = Request::get(Url::parse("https://api.example.com/events?x=1").unwrap());
    assert_eq!(router.classify(&request), Strategy::NetworkFirst);
  }

  #[test]
  fn test_custom_routes() {
    let config = Config::parse(
      r#"
routing:
  routes:
    - path_prefix: /api/
      strategy: network_first
    - navigate: true
      strategy: cache_first
  fallback: dynamic
"#,
    )
    .unwrap();

    let router = config.router().unwrap();
    assert_eq!(router.routes().len(), 2);
    assert_eq!(router.routes()[0].rule, Rule::PathPrefix("/api/".to_string()));

    let request = Request::get(Url::parse("http://localhost:3000/api/events").unwrap());
    assert_eq!(router.classify(&request), Strategy::NetworkFirst);
  }

  #[test]
  fn test_ambiguous_route_rejected() {
    let config = Config::parse(
      r#"
routing:
  routes:
    - path_prefix: /api/
      navigate: true
      strategy: network_first
"#,
    )
    .unwrap();

    assert!(config.validated().is_err());
  }

  #[test]
  fn test_relative_origin_rejected() {
    let config = Config::parse("origin: not a url\n").unwrap();
    assert!(config.validated().is_err());
  }

  #[test]
  fn test_zero_store_version_rejected() {
    let config = Config::parse("store:\n  version: 0\n").unwrap();
    assert!(config.validated().is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shellcache.yaml");
    std::fs::write(&path, "cache:\n  offline_url: /offline.html\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.cache.offline_url, "/offline.html");
  }
}
