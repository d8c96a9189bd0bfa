use thiserror::Error;

/// Failures of the on-disk stores (cache buckets and the payload database).
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Failed to open store at {path}: {source}")]
  Open {
    path: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("Store query failed: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Failed to encode or decode stored value: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("Store {name} is at version {found}, newer than requested version {requested}")]
  VersionTooNew {
    name: String,
    found: u32,
    requested: u32,
  },

  #[error("Store lock poisoned")]
  Lock,

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}
