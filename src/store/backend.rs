//! Persistence backends for the outbox records.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{StoreError, StoreResult};

/// Storage for named opaque records, grouped by scope.
///
/// Implementations must either persist the whole record or fail; a partially
/// written record is never acceptable.
pub trait Persistence: Send + Sync {
  /// Load a record. Returns `Ok(None)` if it has never been written.
  fn load(&self, scope: &str, name: &str) -> StoreResult<Option<Vec<u8>>>;

  /// Replace a record.
  fn save(&self, scope: &str, name: &str, data: &[u8]) -> StoreResult<()>;
}

/// Hex encoded SHA-256 of a record body.
pub fn checksum(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// SQLite-backed persistence.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

/// Schema for outbox records.
const RECORDS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    data BLOB NOT NULL,
    checksum TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope, name)
);
"#;

impl SqliteBackend {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Backend(format!(
          "Failed to create data directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Backend(format!(
        "Failed to open outbox database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StoreResult<Self> {
    conn.execute_batch(RECORDS_SCHEMA)?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  #[cfg(test)]
  pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
    self.conn.lock().unwrap()
  }
}

impl Persistence for SqliteBackend {
  fn load(&self, scope: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
    let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, checksum FROM records WHERE scope = ? AND name = ?",
        params![scope, name],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, stored)) => {
        if checksum(&data) != stored {
          tracing::error!(scope, record = name, "outbox record failed checksum verification");
          return Err(StoreError::Corrupted {
            scope: scope.to_string(),
            record: name.to_string(),
          });
        }
        Ok(Some(data))
      }
      None => Ok(None),
    }
  }

  fn save(&self, scope: &str, name: &str, data: &[u8]) -> StoreResult<()> {
    let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

    conn.execute(
      "INSERT OR REPLACE INTO records (scope, name, data, checksum, updated_at)
       VALUES (?, ?, ?, ?, datetime('now'))",
      params![scope, name, data, checksum(data)],
    )?;

    Ok(())
  }
}
