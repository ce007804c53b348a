//! Remote store abstraction and the hosted REST implementation.

mod client;

pub use client::RestClient;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::Target;
use crate::error::RemoteError;

/// Write operations of the hosted data store.
///
/// Every call is scoped by `owner`; credentials are the implementation's
/// concern.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Insert a new record. Returns the server-assigned id when one is reported.
  async fn insert(
    &self,
    target: Target,
    payload: &Value,
    owner: &str,
  ) -> Result<Option<Value>, RemoteError>;

  /// Apply a partial update to the record identified by `identity`.
  async fn update(
    &self,
    target: Target,
    identity: &str,
    payload: &Value,
    owner: &str,
  ) -> Result<(), RemoteError>;

  /// Delete the record identified by `identity`.
  async fn delete(&self, target: Target, identity: &str, owner: &str) -> Result<(), RemoteError>;
}
