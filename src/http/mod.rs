//! Request/response model and the network boundary the worker fetches through.

mod client;
mod error;
#[cfg(test)]
pub mod scripted;
mod types;

use std::future::Future;

pub use client::HttpClient;
pub use error::FetchError;
pub use types::{cache_key, Request, Response};

/// Anything that can turn a request into a response over the network.
///
/// Implementations must report transport failures as `FetchError::Network`.
/// A response with a non-2xx status is still a successful fetch; strategies
/// decide for themselves whether to reject it.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}
