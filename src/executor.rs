//! Applies a single queued action against the remote store.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{ActionKind, OfflineAction};
use crate::error::RemoteError;
use crate::remote::RemoteStore;

/// Successful application of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
  /// Server-assigned id, for inserts that report one
  pub remote_id: Option<Value>,
}

/// Routes `kind` + `target` of an [`OfflineAction`] to one remote call.
///
/// The executor never touches the queue; retry and removal are decided by
/// the caller.
pub struct MutationExecutor {
  remote: Arc<dyn RemoteStore>,
  timeout: Duration,
}

impl MutationExecutor {
  pub fn new(remote: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
    Self { remote, timeout }
  }

  pub async fn execute(&self, action: &OfflineAction) -> Result<Applied, RemoteError> {
    match tokio::time::timeout(self.timeout, self.dispatch(action)).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::transient(format!(
        "timed out after {:?}",
        self.timeout
      ))),
    }
  }

  async fn dispatch(&self, action: &OfflineAction) -> Result<Applied, RemoteError> {
    let target = action.target;
    let owner = action.owner.as_str();

    match action.kind {
      ActionKind::Insert => {
        let remote_id = self.remote.insert(target, &action.payload, owner).await?;
        Ok(Applied { remote_id })
      }
      ActionKind::Update => {
        let identity = Self::require_identity(action)?;
        self
          .remote
          .update(target, &identity, &action.payload, owner)
          .await?;
        Ok(Applied { remote_id: None })
      }
      ActionKind::Delete => {
        let identity = Self::require_identity(action)?;
        self.remote.delete(target, &identity, owner).await?;
        Ok(Applied { remote_id: None })
      }
    }
  }

  /// Update and delete cannot address a record without its identity; retrying
  /// will never help, so this is a rejection rather than a transient failure.
  fn require_identity(action: &OfflineAction) -> Result<String, RemoteError> {
    action.identity().ok_or_else(|| {
      RemoteError::rejected(format!(
        "{} on {} has no record identity in its payload",
        action.kind, action.target
      ))
    })
  }
}
