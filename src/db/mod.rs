//! Last-known-good JSON payloads, keyed by request URL.
//!
//! The database is opened lazily on first use and its single object store is
//! created or upgraded according to the requested schema version.

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::StoreError;

/// Where the payload database lives.
#[derive(Debug, Clone)]
pub enum StoreLocation {
  /// `<dir>/<name>.db`
  Dir(PathBuf),
  Memory,
}

/// One stored record, as written to the object store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPayload {
  pub url: String,
  /// The JSON payload, serialized
  pub response: String,
}

/// Persistent key-value store for API payloads.
pub struct PayloadStore {
  location: StoreLocation,
  name: String,
  version: u32,
  object_store: String,
  conn: Mutex<Option<Connection>>,
}

impl PayloadStore {
  pub fn new(
    location: StoreLocation,
    name: impl Into<String>,
    version: u32,
    object_store: impl Into<String>,
  ) -> Self {
    Self {
      location,
      name: name.into(),
      version,
      object_store: object_store.into(),
      conn: Mutex::new(None),
    }
  }

  /// Read the payload stored for a URL.
  ///
  /// Failures to open or query the store are logged and reported as a miss.
  pub fn get(&self, url: &str) -> Option<Value> {
    match self.try_get(url) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(url, error = %e, "failed to read stored payload");
        None
      }
    }
  }

  /// Read the payload stored for a URL, surfacing store errors.
  pub fn try_get(&self, url: &str) -> Result<Option<Value>, StoreError> {
    let record = self.with_conn(|conn, table| {
      let sql = format!("SELECT url, response FROM {} WHERE url = ?", table);
      let record = conn
        .query_row(&sql, params![url], |row| {
          Ok(StoredPayload {
            url: row.get(0)?,
            response: row.get(1)?,
          })
        })
        .optional()?;
      Ok(record)
    })?;

    record
      .map(|r| serde_json::from_str(&r.response).map_err(StoreError::from))
      .transpose()
  }

  /// Upsert the payload for a URL. Newest write wins.
  pub fn put(&self, url: &str, payload: &Value) -> Result<(), StoreError> {
    let record = StoredPayload {
      url: url.to_string(),
      response: serde_json::to_string(payload)?,
    };

    self.with_conn(|conn, table| {
      let sql = format!(
        "INSERT OR REPLACE INTO {} (url, response) VALUES (?, ?)",
        table
      );
      conn.execute(&sql, params![record.url, record.response])?;
      Ok(())
    })
  }

  /// Run `f` against the open database, opening it first if needed.
  ///
  /// A failed open is not remembered; the next call tries again.
  fn with_conn<T>(
    &self,
    f: impl FnOnce(&Connection, &str) -> Result<T, StoreError>,
  ) -> Result<T, StoreError> {
    let mut guard = self.conn.lock().map_err(|_| StoreError::Lock)?;

    let conn = match guard.take() {
      Some(conn) => conn,
      None => self.open_connection()?,
    };

    let result = f(&conn, &quote_ident(&self.object_store));
    *guard = Some(conn);
    result
  }

  fn open_connection(&self) -> Result<Connection, StoreError> {
    let (conn, path) = match &self.location {
      StoreLocation::Dir(dir) => {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.db", self.name));
        (Connection::open(&path), path.display().to_string())
      }
      StoreLocation::Memory => (Connection::open_in_memory(), ":memory:".to_string()),
    };
    let conn = conn.map_err(|source| StoreError::Open { path, source })?;

    self.upgrade(&conn)?;
    Ok(conn)
  }

  /// Bring the schema up to the requested version.
  fn upgrade(&self, conn: &Connection) -> Result<(), StoreError> {
    let found: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if found > self.version {
      return Err(StoreError::VersionTooNew {
        name: self.name.clone(),
        found,
        requested: self.version,
      });
    }

    conn.execute(
      &format!(
        "CREATE TABLE IF NOT EXISTS {} (
             url TEXT PRIMARY KEY,
             response TEXT NOT NULL
         )",
        quote_ident(&self.object_store)
      ),
      [],
    )?;

    if found < self.version {
      conn.pragma_update(None, "user_version", self.version)?;
      info!(
        store = %self.name,
        from = found,
        to = self.version,
        "upgraded payload store"
      );
    }

    Ok(())
  }
}

fn quote_ident(name: &str) -> String {
  format!("\"{}\"", name.replace('"', "\"\""))
}
