//! Last-known-good read results for offline fallback.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::backend::Persistence;
use super::{load_record, save_record};
use crate::error::{StoreError, StoreResult};

const SNAPSHOT_RECORD: &str = "snapshots";

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot<T> {
  pub value: T,
  pub captured_at: DateTime<Utc>,
}

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// Fresh data from the remote store
  Network,
  /// Remote fetch failed, serving the last cached snapshot
  Offline,
}

/// Result of [`SnapshotStore::fetch_with_fallback`].
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  pub data: T,
  pub source: FetchSource,
  /// When the data was captured (only set for cached data)
  pub captured_at: Option<DateTime<Utc>>,
}

/// Best-effort key/value cache of read results.
///
/// No eviction and no staleness bound; callers decide whether an old
/// snapshot is still acceptable from `captured_at`.
pub struct SnapshotStore {
  backend: Arc<dyn Persistence>,
  scope: String,
  write_lock: Mutex<()>,
}

impl SnapshotStore {
  pub fn new(backend: Arc<dyn Persistence>, scope: impl Into<String>) -> Self {
    Self {
      backend,
      scope: scope.into(),
      write_lock: Mutex::new(()),
    }
  }

  fn load_all(&self) -> StoreResult<BTreeMap<String, CachedSnapshot<Value>>> {
    load_record(self.backend.as_ref(), &self.scope, SNAPSHOT_RECORD)
  }

  /// Store or overwrite the snapshot for `key`.
  pub fn save<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
      record: SNAPSHOT_RECORD.to_string(),
      source,
    })?;

    let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
    let mut snapshots = self.load_all()?;
    snapshots.insert(
      key.to_string(),
      CachedSnapshot {
        value,
        captured_at: Utc::now(),
      },
    );
    save_record(self.backend.as_ref(), &self.scope, SNAPSHOT_RECORD, &snapshots)
  }

  /// Load the snapshot for `key`, if one was ever saved.
  pub fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<CachedSnapshot<T>>> {
    let Some(snapshot) = self.load_all()?.remove(key) else {
      return Ok(None);
    };

    let value = serde_json::from_value(snapshot.value).map_err(|source| {
      StoreError::Serialization {
        record: format!("{}:{}", SNAPSHOT_RECORD, key),
        source,
      }
    })?;

    Ok(Some(CachedSnapshot {
      value,
      captured_at: snapshot.captured_at,
    }))
  }

  /// Fetch with network-first strategy and cached fallback.
  ///
  /// 1. Run the fetcher
  /// 2. On success, overwrite the snapshot and return the fresh data
  /// 3. On failure, return the cached snapshot (offline mode) if there is one
  /// 4. Otherwise return the fetch error
  pub async fn fetch_with_fallback<T, E, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
  ) -> Result<Fetched<T>, E>
  where
    T: Serialize + DeserializeOwned,
    E: From<StoreError> + std::fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    match fetcher().await {
      Ok(data) => {
        self.save(key, &data)?;
        Ok(Fetched {
          data,
          source: FetchSource::Network,
          captured_at: None,
        })
      }
      Err(err) => match self.load::<T>(key)? {
        Some(cached) => {
          tracing::warn!(key, error = %err, "fetch failed, serving cached snapshot");
          Ok(Fetched {
            data: cached.value,
            source: FetchSource::Offline,
            captured_at: Some(cached.captured_at),
          })
        }
        None => Err(err),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::MemoryBackend;
  use serde_json::json;

  fn store() -> SnapshotStore {
    SnapshotStore::new(Arc::new(MemoryBackend::new()), "facility-1")
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Child {
    id: u32,
    name: String,
  }

  #[test]
  fn test_save_and_load() {
    let store = store();
    assert!(store.load::<Value>("children").unwrap().is_none());

    let roster = vec![
      Child {
        id: 1,
        name: "Aoi".into(),
      },
      Child {
        id: 2,
        name: "Ren".into(),
      },
    ];
    store.save("children", &roster).unwrap();

    let cached = store.load::<Vec<Child>>("children").unwrap().unwrap();
    assert_eq!(cached.value, roster);
  }

  #[test]
  fn test_save_overwrites() {
    let store = store();
    store.save("announcements", &json!(["old"])).unwrap();
    store.save("announcements", &json!(["new"])).unwrap();
    store.save("calendar", &json!([])).unwrap();

    let cached = store.load::<Value>("announcements").unwrap().unwrap();
    assert_eq!(cached.value, json!(["new"]));
  }

  #[test]
  fn test_wrong_shape_is_reported() {
    let store = store();
    store.save("children", &json!({"not": "a list"})).unwrap();
    assert!(store.load::<Vec<Child>>("children").is_err());
  }

  #[tokio::test]
  async fn test_fetch_with_fallback() {
    let store = store();

    // No cache, fetch fails: error surfaces
    let result: Result<Fetched<Vec<u32>>, color_eyre::Report> = store
      .fetch_with_fallback("ids", || async { Err(color_eyre::eyre::eyre!("offline")) })
      .await;
    assert!(result.is_err());

    // Fetch succeeds: snapshot is written
    let fetched = store
      .fetch_with_fallback("ids", || async { Ok::<_, color_eyre::Report>(vec![1, 2, 3]) })
      .await
      .unwrap();
    assert_eq!(fetched.source, FetchSource::Network);
    assert_eq!(fetched.data, vec![1, 2, 3]);

    // Fetch fails: cached snapshot is served
    let fetched: Fetched<Vec<u32>> = store
      .fetch_with_fallback("ids", || async { Err(color_eyre::eyre::eyre!("offline")) })
      .await
      .unwrap();
    assert_eq!(fetched.source, FetchSource::Offline);
    assert_eq!(fetched.data, vec![1, 2, 3]);
    assert!(fetched.captured_at.is_some());
  }
}
