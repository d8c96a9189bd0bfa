use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Network(String),

  #[error("Unexpected status {status} from {url}")]
  Status { status: u16, url: String },

  #[error("Invalid JSON body: {0}")]
  Parse(#[from] serde_json::Error),
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    FetchError::Network(err.to_string())
  }
}
