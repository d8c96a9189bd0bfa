//! Named cache buckets and their SQLite implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use url::Url;

use super::error::StoreError;
use crate::http::{cache_key, Request, Response};

/// Overview of one bucket for listings.
#[derive(Debug, Clone)]
pub struct BucketSummary {
  pub name: String,
  pub entries: usize,
  /// Most recent write into the bucket
  pub last_write: Option<DateTime<Utc>>,
}

/// Trait for cache bucket backends.
///
/// Each call is atomic on its own; nothing spans several calls.
pub trait CacheStorage: Send + Sync {
  /// Bucket names in creation order.
  fn keys(&self) -> Result<Vec<String>, StoreError>;

  /// Drop a bucket and everything in it. Returns false if it did not exist.
  fn delete(&self, bucket: &str) -> Result<bool, StoreError>;

  /// Look up a response in one bucket.
  fn match_in(&self, bucket: &str, url: &Url) -> Result<Option<Response>, StoreError>;

  /// Look up a response across every bucket, oldest bucket first.
  fn match_any(&self, url: &Url) -> Result<Option<Response>, StoreError>;

  /// Store a response for a request, replacing any previous entry.
  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<(), StoreError>;

  /// Store a batch of entries; either all of them land or none do.
  fn add_all(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<(), StoreError>;

  fn summaries(&self) -> Result<Vec<BucketSummary>, StoreError>;

  /// Fingerprint of the last successfully installed worker.
  fn registration(&self) -> Result<Option<String>, StoreError>;

  fn set_registration(&self, fingerprint: &str) -> Result<(), StoreError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at the given path.
  pub fn open_at(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path).map_err(|source| StoreError::Open {
      path: path.display().to_string(),
      source,
    })?;

    Self::with_connection(conn)
  }

  /// Cache storage that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
      path: ":memory:".to_string(),
      source,
    })?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Lock)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Buckets, id preserves creation order
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Request URL -> response, one row per bucket and URL
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, url)
);

-- Worker registration bookkeeping
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const REGISTRATION_KEY: &str = "registration";

fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<(), StoreError> {
  conn.execute(
    "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
    params![bucket],
  )?;
  Ok(())
}

fn write_entry(
  conn: &Connection,
  bucket: &str,
  request: &Request,
  response: &Response,
) -> Result<(), StoreError> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO entries (bucket, url, response_url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      bucket,
      request.cache_key(),
      response.url,
      response.status,
      headers,
      response.body
    ],
  )?;
  Ok(())
}

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, u16, String, Vec<u8>)> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_response(
  (url, status, headers, body): (String, u16, String, Vec<u8>),
) -> Result<Response, StoreError> {
  Ok(Response {
    url,
    status,
    headers: serde_json::from_str(&headers)?,
    body,
  })
}

impl CacheStorage for SqliteStorage {
  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM buckets ORDER BY id")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete(&self, bucket: &str) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])?;
    let removed = tx.execute("DELETE FROM buckets WHERE name = ?", params![bucket])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn match_in(&self, bucket: &str, url: &Url) -> Result<Option<Response>, StoreError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT response_url, status, headers, body FROM entries
         WHERE bucket = ? AND url = ?",
        params![bucket, cache_key(url)],
        read_entry,
      )
      .optional()?;

    row.map(into_response).transpose()
  }

  fn match_any(&self, url: &Url) -> Result<Option<Response>, StoreError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT e.response_url, e.status, e.headers, e.body FROM entries e
         INNER JOIN buckets b ON b.name = e.bucket
         WHERE e.url = ?
         ORDER BY b.id
         LIMIT 1",
        params![cache_key(url)],
        read_entry,
      )
      .optional()?;

    row.map(into_response).transpose()
  }

  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<(), StoreError> {
    if request.method != reqwest::Method::GET {
      debug!(method = %request.method, url = %request.url, "not caching non-GET request");
      return Ok(());
    }

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    ensure_bucket(&tx, bucket)?;
    write_entry(&tx, bucket, request, response)?;
    tx.commit()?;
    Ok(())
  }

  fn add_all(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    ensure_bucket(&tx, bucket)?;
    for (request, response) in entries {
      write_entry(&tx, bucket, request, response)?;
    }
    // Dropping the transaction on an early return rolls everything back
    tx.commit()?;
    Ok(())
  }

  fn summaries(&self) -> Result<Vec<BucketSummary>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT b.name, COUNT(e.url), MAX(e.cached_at) FROM buckets b
       LEFT JOIN entries e ON e.bucket = b.name
       GROUP BY b.id
       ORDER BY b.id",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, Option<String>>(2)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(
      rows
        .into_iter()
        .map(|(name, entries, last_write)| BucketSummary {
          name,
          entries: entries as usize,
          last_write: last_write.as_deref().and_then(parse_datetime),
        })
        .collect(),
    )
  }

  fn registration(&self) -> Result<Option<String>, StoreError> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM meta WHERE key = ?",
        params![REGISTRATION_KEY],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_registration(&self, fingerprint: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
      params![REGISTRATION_KEY, fingerprint],
    )?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .ok()
}
