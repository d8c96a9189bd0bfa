//! The offline cache coordinator: worker lifecycle plus fetch dispatch.

use std::sync::Arc;

use futures::future::try_join_all;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Router, StoreError, Strategy};
use crate::http::{FetchError, Fetcher, Request, Response};

/// Lifecycle of a worker, in the order a healthy worker passes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting; skip-waiting makes it eligible right away
  Installed,
  Activating,
  /// Controls its clients and intercepts their fetches
  Activated,
  /// Install failed; this worker will never activate
  Redundant,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("Failed to fetch core asset {url}: {source}")]
  Fetch {
    url: String,
    #[source]
    source: FetchError,
  },

  #[error("Core asset {url} answered with status {status}")]
  Status { url: String, status: u16 },

  #[error("Cache storage error: {0}")]
  Store(#[from] StoreError),

  #[error("Cannot {action} while worker is {state:?}")]
  InvalidState {
    action: &'static str,
    state: WorkerState,
  },

  #[error("Worker host stopped before it could {0}")]
  HostStopped(&'static str),
}

/// Everything the coordinator needs besides its stores.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  /// Resolved app-shell URLs cached at install time
  pub core_assets: Vec<Url>,
  pub router: Router,
}

/// Coordinates the worker lifecycle and answers fetch events.
///
/// Clones share state, so one clone can be moved into each fetch task.
pub struct Coordinator<F: Fetcher, S: CacheStorage> {
  layer: CacheLayer<F, S>,
  router: Arc<Router>,
  core_assets: Arc<Vec<Url>>,
  fingerprint: Arc<str>,
  state: Arc<watch::Sender<WorkerState>>,
}

impl<F: Fetcher, S: CacheStorage> Coordinator<F, S> {
  pub fn new(layer: CacheLayer<F, S>, settings: WorkerSettings) -> Self {
    let fingerprint = fingerprint(layer.bucket(), &settings.core_assets);
    let (state, _) = watch::channel(WorkerState::Parsed);

    Self {
      layer,
      router: Arc::new(settings.router),
      core_assets: Arc::new(settings.core_assets),
      fingerprint: fingerprint.into(),
      state: Arc::new(state),
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub fn layer(&self) -> &CacheLayer<F, S> {
    &self.layer
  }

  fn set_state(&self, state: WorkerState) {
    let previous = self.state.send_replace(state);
    debug!(from = ?previous, to = ?state, "worker state changed");
  }

  /// True unless this exact worker was installed before and its bucket
  /// still holds the whole app shell.
  pub fn needs_install(&self) -> Result<bool, LifecycleError> {
    let storage = self.layer.storage();
    if storage.registration()?.as_deref() != Some(&*self.fingerprint) {
      return Ok(true);
    }

    for url in self.core_assets.iter() {
      if storage.match_in(self.layer.bucket(), url)?.is_none() {
        return Ok(true);
      }
    }
    Ok(false)
  }

  /// Pick up a previous install of this same worker without redoing it.
  ///
  /// Returns false (and leaves the state alone) when an install is needed.
  pub fn resume(&self) -> Result<bool, LifecycleError> {
    if self.needs_install()? {
      return Ok(false);
    }
    if self.state() == WorkerState::Parsed {
      self.set_state(WorkerState::Installed);
      info!(bucket = %self.layer.bucket(), "resumed installed worker");
    }
    Ok(true)
  }

  /// Cache the app shell into the current bucket.
  ///
  /// Every core asset must come back with a 2xx status; otherwise nothing is
  /// written and the worker becomes redundant.
  pub async fn install(&self) -> Result<(), LifecycleError> {
    match self.state() {
      WorkerState::Parsed | WorkerState::Installed => {}
      state => {
        return Err(LifecycleError::InvalidState {
          action: "install",
          state,
        })
      }
    }

    self.set_state(WorkerState::Installing);
    info!(bucket = %self.layer.bucket(), assets = self.core_assets.len(), "installing");

    match self.populate_shell().await {
      Ok(()) => {
        self.layer.storage().set_registration(&self.fingerprint)?;
        // Skip waiting: eligible for activation right away
        self.set_state(WorkerState::Installed);
        info!(bucket = %self.layer.bucket(), "installed");
        Ok(())
      }
      Err(e) => {
        warn!(error = %e, "install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn populate_shell(&self) -> Result<(), LifecycleError> {
    let fetches = self.core_assets.iter().map(|url| self.fetch_asset(url));
    let entries = try_join_all(fetches).await?;
    self.layer.storage().add_all(self.layer.bucket(), &entries)?;
    Ok(())
  }

  async fn fetch_asset(&self, url: &Url) -> Result<(Request, Response), LifecycleError> {
    let request = Request::get(url.clone());
    let response = self
      .layer
      .fetcher()
      .fetch(&request)
      .await
      .map_err(|source| LifecycleError::Fetch {
        url: url.to_string(),
        source,
      })?;

    if !response.ok() {
      return Err(LifecycleError::Status {
        url: url.to_string(),
        status: response.status,
      });
    }

    Ok((request, response))
  }

  /// Purge every bucket but the current one, then claim all clients.
  ///
  /// Returns the names of the purged buckets.
  pub async fn activate(&self) -> Result<Vec<String>, LifecycleError> {
    match self.state() {
      WorkerState::Installed => {}
      state => {
        return Err(LifecycleError::InvalidState {
          action: "activate",
          state,
        })
      }
    }

    self.set_state(WorkerState::Activating);

    let storage = self.layer.storage();
    let mut purged = Vec::new();
    for name in storage.keys()? {
      if name != self.layer.bucket() && storage.delete(&name)? {
        info!(bucket = %name, "purged stale bucket");
        purged.push(name);
      }
    }

    // Claim: from here on every fetch is intercepted
    self.set_state(WorkerState::Activated);
    info!(bucket = %self.layer.bucket(), "activated");
    Ok(purged)
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    self.router.classify(request)
  }

  /// Answer one fetch event.
  ///
  /// `None` means no response: the page sees a failed fetch. Until the worker
  /// is activated it does not control the page, so requests go straight to
  /// the network without touching any cache.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
    if self.state() != WorkerState::Activated {
      debug!(url = %request.url, "uncontrolled fetch");
      return match self.layer.fetcher().fetch(request).await {
        Ok(response) => Some(response),
        Err(e) => {
          warn!(url = %request.url, error = %e, "uncontrolled fetch failed");
          None
        }
      };
    }

    let strategy = self.classify(request);
    debug!(url = %request.url, %strategy, "dispatching fetch");

    match strategy {
      Strategy::NetworkFirst => Some(self.layer.network_first(request).await),
      Strategy::CacheFirst => self.layer.cache_first(request).await,
      Strategy::Dynamic => self.layer.dynamic(request).await,
    }
  }
}

impl<F: Fetcher, S: CacheStorage> Clone for Coordinator<F, S> {
  fn clone(&self) -> Self {
    Self {
      layer: self.layer.clone(),
      router: Arc::clone(&self.router),
      core_assets: Arc::clone(&self.core_assets),
      fingerprint: Arc::clone(&self.fingerprint),
      state: Arc::clone(&self.state),
    }
  }
}

/// Identifies a worker configuration: same bucket and same shell, same worker.
fn fingerprint(bucket: &str, core_assets: &[Url]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bucket.as_bytes());
  for url in core_assets {
    hasher.update(b"\n");
    hasher.update(url.as_str().as_bytes());
  }
  hex::encode(hasher.finalize())
}
