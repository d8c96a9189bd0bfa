use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::config::NetworkConfig;

use super::error::FetchError;
use super::types::{Request, Response};
use super::Fetcher;

/// Network fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));

    // No timeout unless configured: a hung request stays pending
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    debug!(method = %request.method, url = %request.url, "network fetch");

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await?;

    let url = response.url().to_string();
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      headers,
      ..Response::new(url, status, body)
    })
  }
}
