//! Durable local state for the outbox.
//!
//! Everything lives in a handful of named records per scope:
//! - `queue`: ordered pending actions
//! - `attempts`: rejection counts per pending action
//! - `dead_letters`: actions given up on after repeated rejection
//! - `snapshots`: last-known-good read results

mod backend;
mod queue;
mod snapshot;

pub use backend::{Persistence, SqliteBackend};
pub use queue::{DeadLetter, QueueStore};
pub use snapshot::{CachedSnapshot, FetchSource, SnapshotStore};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StoreError, StoreResult};

/// Load and decode a record, falling back to the empty value if it was never written.
fn load_record<T>(backend: &dyn Persistence, scope: &str, name: &str) -> StoreResult<T>
where
  T: DeserializeOwned + Default,
{
  match backend.load(scope, name)? {
    Some(data) => serde_json::from_slice(&data).map_err(|source| StoreError::Serialization {
      record: name.to_string(),
      source,
    }),
    None => Ok(T::default()),
  }
}

/// Encode and replace a record.
fn save_record<T: Serialize>(
  backend: &dyn Persistence,
  scope: &str,
  name: &str,
  value: &T,
) -> StoreResult<()> {
  let data = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
    record: name.to_string(),
    source,
  })?;
  backend.save(scope, name, &data)
}
