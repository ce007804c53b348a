//! Feature-facing entry point for writes and cached reads.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::action::ActionTemplate;
use crate::connectivity::ConnectivityMonitor;
use crate::error::StoreResult;
use crate::executor::MutationExecutor;
use crate::store::{CachedSnapshot, QueueStore, SnapshotStore};
use crate::sync::{SyncOrchestrator, TriggerOutcome};

/// What happened to a mutation handed to [`Outbox::perform`].
///
/// Both variants are success from the caller's point of view; `Queued` only
/// means delivery is still pending.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// Applied remotely right away
  Written { id: Uuid, remote_id: Option<Value> },
  /// Stored in the queue for a later sync pass
  Queued { id: Uuid },
}

impl Outcome {
  pub fn id(&self) -> Uuid {
    match self {
      Outcome::Written { id, .. } | Outcome::Queued { id } => *id,
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, Outcome::Queued { .. })
  }
}

/// Hides the online/offline branching from feature code.
pub struct Outbox {
  monitor: ConnectivityMonitor,
  executor: Arc<MutationExecutor>,
  queue: Arc<QueueStore>,
  snapshots: Arc<SnapshotStore>,
  sync: Arc<SyncOrchestrator>,
}

impl Outbox {
  pub fn new(
    monitor: ConnectivityMonitor,
    executor: Arc<MutationExecutor>,
    queue: Arc<QueueStore>,
    snapshots: Arc<SnapshotStore>,
    sync: Arc<SyncOrchestrator>,
  ) -> Self {
    Self {
      monitor,
      executor,
      queue,
      snapshots,
      sync,
    }
  }

  /// Write now if possible, otherwise queue for later.
  ///
  /// Only a local persistence failure is an error: it means the mutation was
  /// neither applied nor durably queued.
  pub async fn perform(&self, template: ActionTemplate) -> StoreResult<Outcome> {
    let action = template.stamp();
    let id = action.id;

    if self.monitor.is_online() {
      match self.executor.execute(&action).await {
        Ok(applied) => {
          tracing::debug!(action = %action.describe(), "written directly");
          return Ok(Outcome::Written {
            id,
            remote_id: applied.remote_id,
          });
        }
        Err(e) => {
          tracing::warn!(
            action = %action.describe(),
            error = %e,
            retryable = e.is_retryable(),
            "direct write failed, queueing"
          );
        }
      }
    } else {
      tracing::debug!(action = %action.describe(), "offline, queueing");
    }

    self.queue.enqueue(action)?;
    Ok(Outcome::Queued { id })
  }

  /// Manual "retry now".
  pub async fn trigger_sync(&self) -> StoreResult<TriggerOutcome> {
    self.sync.trigger().await
  }

  pub fn load_cached<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<CachedSnapshot<T>>> {
    self.snapshots.load(key)
  }

  pub fn save_cached<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
    self.snapshots.save(key, value)
  }

  /// Number of mutations waiting for delivery.
  pub fn pending(&self) -> StoreResult<usize> {
    self.queue.len()
  }

  pub fn queue(&self) -> &QueueStore {
    &self.queue
  }

  pub fn snapshots(&self) -> &SnapshotStore {
    &self.snapshots
  }

  pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
    &self.sync
  }
}
