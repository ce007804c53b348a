//! In-memory stand-ins for the persistence medium and the remote store.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::action::Target;
use crate::error::{RemoteError, StoreError, StoreResult};
use crate::remote::RemoteStore;
use crate::store::Persistence;

/// Persistence that lives only as long as the process.
#[derive(Default)]
pub struct MemoryBackend {
  records: Mutex<HashMap<(String, String), Vec<u8>>>,
  unavailable: AtomicBool,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate the storage medium going away; every call fails until restored.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  fn check_available(&self) -> StoreResult<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Backend("storage unavailable".into()));
    }
    Ok(())
  }
}

impl Persistence for MemoryBackend {
  fn load(&self, scope: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
    self.check_available()?;
    let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
    Ok(records.get(&(scope.to_string(), name.to_string())).cloned())
  }

  fn save(&self, scope: &str, name: &str, data: &[u8]) -> StoreResult<()> {
    self.check_available()?;
    let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
    records.insert((scope.to_string(), name.to_string()), data.to_vec());
    Ok(())
  }
}

/// A call received by [`FakeRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
  Insert {
    target: Target,
    payload: Value,
    owner: String,
  },
  Update {
    target: Target,
    identity: String,
    payload: Value,
    owner: String,
  },
  Delete {
    target: Target,
    identity: String,
    owner: String,
  },
}

type RejectRule = Box<dyn Fn(&RemoteCall) -> bool + Send + Sync>;

/// Scriptable remote store that records every call it receives.
#[derive(Default)]
pub struct FakeRemote {
  calls: Mutex<Vec<RemoteCall>>,
  offline: AtomicBool,
  latency: Mutex<Option<Duration>>,
  reject_rules: Mutex<Vec<RejectRule>>,
  next_id: AtomicU64,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every call fails with a transient error while set.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Delay every call by `latency` before answering.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  /// Reject every call matching `rule`.
  pub fn reject_when(&self, rule: impl Fn(&RemoteCall) -> bool + Send + Sync + 'static) {
    self.reject_rules.lock().unwrap().push(Box::new(rule));
  }

  pub fn calls(&self) -> Vec<RemoteCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  async fn handle(&self, call: RemoteCall) -> Result<(), RemoteError> {
    self.calls.lock().unwrap().push(call.clone());

    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(RemoteError::transient("connection refused"));
    }
    if self.reject_rules.lock().unwrap().iter().any(|rule| rule(&call)) {
      return Err(RemoteError::rejected("HTTP 400: rejected by fake"));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn insert(
    &self,
    target: Target,
    payload: &Value,
    owner: &str,
  ) -> Result<Option<Value>, RemoteError> {
    self
      .handle(RemoteCall::Insert {
        target,
        payload: payload.clone(),
        owner: owner.to_string(),
      })
      .await?;
    Ok(Some(json!(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)))
  }

  async fn update(
    &self,
    target: Target,
    identity: &str,
    payload: &Value,
    owner: &str,
  ) -> Result<(), RemoteError> {
    self
      .handle(RemoteCall::Update {
        target,
        identity: identity.to_string(),
        payload: payload.clone(),
        owner: owner.to_string(),
      })
      .await
  }

  async fn delete(&self, target: Target, identity: &str, owner: &str) -> Result<(), RemoteError> {
    self
      .handle(RemoteCall::Delete {
        target,
        identity: identity.to_string(),
        owner: owner.to_string(),
      })
      .await
  }
}
