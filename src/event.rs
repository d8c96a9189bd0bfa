use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

use crate::cache::CacheStorage;
use crate::http::{Fetcher, Request, Response};
use crate::worker::{Coordinator, LifecycleError};

/// A request waiting for the worker's answer.
#[derive(Debug)]
pub struct FetchEvent {
  pub request: Request,
  respond_to: oneshot::Sender<Option<Response>>,
}

impl FetchEvent {
  pub fn new(request: Request) -> (Self, oneshot::Receiver<Option<Response>>) {
    let (tx, rx) = oneshot::channel();
    (
      Self {
        request,
        respond_to: tx,
      },
      rx,
    )
  }

  /// Deliver the answer. Consumes the event, so it can be answered only once.
  pub fn respond_with(self, response: Option<Response>) {
    if self.respond_to.send(response).is_err() {
      debug!(url = %self.request.url, "page went away before the response");
    }
  }
}

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  Install(oneshot::Sender<Result<(), LifecycleError>>),
  Activate(oneshot::Sender<Result<Vec<String>, LifecycleError>>),
  Fetch(FetchEvent),
}

/// Runs a coordinator on its own task and feeds it events.
///
/// Lifecycle events are handled one at a time, in order. Each fetch event
/// gets its own task; the host only finishes once all of them have settled.
pub struct WorkerHost {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  task: JoinHandle<()>,
}

impl WorkerHost {
  pub fn spawn<F: Fetcher, S: CacheStorage + 'static>(coordinator: Coordinator<F, S>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      let mut in_flight = JoinSet::new();

      while let Some(event) = rx.recv().await {
        match event {
          WorkerEvent::Install(done) => {
            let _ = done.send(coordinator.install().await);
          }
          WorkerEvent::Activate(done) => {
            let _ = done.send(coordinator.activate().await);
          }
          WorkerEvent::Fetch(event) => {
            let coordinator = coordinator.clone();
            in_flight.spawn(async move {
              let response = coordinator.handle_fetch(&event.request).await;
              event.respond_with(response);
            });
          }
        }

        // Reap finished fetches so the set does not grow without bound
        while let Some(result) = in_flight.try_join_next() {
          if let Err(e) = result {
            error!(error = %e, "fetch task failed");
          }
        }
      }

      // Extend the host's lifetime until every outstanding fetch settles
      while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
          error!(error = %e, "fetch task failed");
        }
      }
    });

    Self { tx, task }
  }

  pub async fn install(&self) -> Result<(), LifecycleError> {
    let (done, rx) = oneshot::channel();
    self.send(WorkerEvent::Install(done))?;
    rx.await.map_err(|_| host_gone("install"))?
  }

  pub async fn activate(&self) -> Result<Vec<String>, LifecycleError> {
    let (done, rx) = oneshot::channel();
    self.send(WorkerEvent::Activate(done))?;
    rx.await.map_err(|_| host_gone("activate"))?
  }

  /// Dispatch a fetch event and wait for its answer.
  ///
  /// `None` covers both "the worker gave no response" and a host that has
  /// already stopped.
  pub async fn fetch(&self, request: Request) -> Option<Response> {
    let (event, rx) = FetchEvent::new(request);
    if !self.dispatch(event) {
      return None;
    }
    rx.await.ok().flatten()
  }

  /// Hand a fetch event to the worker without waiting for the answer.
  ///
  /// Returns false if the host has stopped.
  pub fn dispatch(&self, event: FetchEvent) -> bool {
    self.tx.send(WorkerEvent::Fetch(event)).is_ok()
  }

  /// Stop accepting events and wait for in-flight fetches to finish.
  pub async fn shutdown(self) {
    drop(self.tx);
    if let Err(e) = self.task.await {
      error!(error = %e, "worker host task failed");
    }
  }

  fn send(&self, event: WorkerEvent) -> Result<(), LifecycleError> {
    self.tx.send(event).map_err(|_| host_gone("deliver event"))
  }
}

fn host_gone(action: &'static str) -> LifecycleError {
  LifecycleError::HostStopped(action)
}
