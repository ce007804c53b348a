//! Durable ordered queue of pending mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::backend::Persistence;
use super::{load_record, save_record};
use crate::action::OfflineAction;
use crate::error::{StoreError, StoreResult};

const QUEUE_RECORD: &str = "queue";
const ATTEMPTS_RECORD: &str = "attempts";
const DEAD_LETTER_RECORD: &str = "dead_letters";

type AttemptLedger = BTreeMap<Uuid, u32>;

/// An action removed from the queue after being rejected too many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub action: OfflineAction,
  /// Number of rejections observed before giving up
  pub rejections: u32,
  /// Message of the last rejection
  pub last_error: String,
  pub dead_at: DateTime<Utc>,
}

/// Ordered, persisted queue of [`OfflineAction`]s.
///
/// All mutations run as read-modify-write of the whole record under one
/// process-local lock, so concurrent enqueues and removals never interleave.
/// Reads go straight to the backend and may observe either side of a
/// concurrent write.
pub struct QueueStore {
  backend: Arc<dyn Persistence>,
  scope: String,
  write_lock: Mutex<()>,
}

impl QueueStore {
  pub fn new(backend: Arc<dyn Persistence>, scope: impl Into<String>) -> Self {
    Self {
      backend,
      scope: scope.into(),
      write_lock: Mutex::new(()),
    }
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, ()>> {
    self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)
  }

  fn load_queue(&self) -> StoreResult<Vec<OfflineAction>> {
    load_record(self.backend.as_ref(), &self.scope, QUEUE_RECORD)
  }

  fn save_queue(&self, queue: &[OfflineAction]) -> StoreResult<()> {
    save_record(self.backend.as_ref(), &self.scope, QUEUE_RECORD, &queue)
  }

  fn load_attempts(&self) -> StoreResult<AttemptLedger> {
    load_record(self.backend.as_ref(), &self.scope, ATTEMPTS_RECORD)
  }

  fn save_attempts(&self, attempts: &AttemptLedger) -> StoreResult<()> {
    save_record(self.backend.as_ref(), &self.scope, ATTEMPTS_RECORD, attempts)
  }

  /// Drop ledger entries for the given ids, if any exist.
  fn forget_attempts(&self, ids: &HashSet<Uuid>) -> StoreResult<()> {
    let mut attempts = self.load_attempts()?;
    let before = attempts.len();
    attempts.retain(|id, _| !ids.contains(id));
    if attempts.len() != before {
      self.save_attempts(&attempts)?;
    }
    Ok(())
  }

  /// Append an action to the end of the queue.
  pub fn enqueue(&self, action: OfflineAction) -> StoreResult<()> {
    let _guard = self.lock()?;
    let mut queue = self.load_queue()?;
    tracing::debug!(action = %action.describe(), position = queue.len(), "enqueue");
    queue.push(action);
    self.save_queue(&queue).inspect_err(|e| {
      tracing::error!(error = %e, scope = %self.scope, "failed to persist queued action");
    })
  }

  /// Snapshot of the queue in enqueue order.
  pub fn all(&self) -> StoreResult<Vec<OfflineAction>> {
    self.load_queue()
  }

  pub fn len(&self) -> StoreResult<usize> {
    Ok(self.load_queue()?.len())
  }

  /// Remove the given ids, keeping the relative order of everything else.
  pub fn remove_by_ids(&self, ids: &HashSet<Uuid>) -> StoreResult<()> {
    if ids.is_empty() {
      return Ok(());
    }

    let _guard = self.lock()?;
    let mut queue = self.load_queue()?;
    queue.retain(|action| !ids.contains(&action.id));
    self.save_queue(&queue)?;
    self.forget_attempts(ids)
  }

  /// Empty the queue and its rejection ledger.
  pub fn clear(&self) -> StoreResult<()> {
    let _guard = self.lock()?;
    self.save_queue(&[])?;
    self.save_attempts(&AttemptLedger::new())
  }

  /// Count one more rejection for each id and return the updated totals.
  pub fn record_rejections(&self, ids: &[Uuid]) -> StoreResult<HashMap<Uuid, u32>> {
    if ids.is_empty() {
      return Ok(HashMap::new());
    }

    let _guard = self.lock()?;
    let mut attempts = self.load_attempts()?;
    let mut totals = HashMap::with_capacity(ids.len());
    for id in ids {
      let count = attempts.entry(*id).or_insert(0);
      *count += 1;
      totals.insert(*id, *count);
    }
    self.save_attempts(&attempts)?;
    Ok(totals)
  }

  /// Move the given entries out of the queue into the dead-letter record.
  ///
  /// The dead-letter record is written before the queue, so a failure in
  /// between leaves a duplicate rather than a lost action.
  pub fn move_to_dead_letters(&self, entries: Vec<DeadLetter>) -> StoreResult<()> {
    if entries.is_empty() {
      return Ok(());
    }

    let _guard = self.lock()?;
    let ids: HashSet<Uuid> = entries.iter().map(|e| e.action.id).collect();

    let mut dead: Vec<DeadLetter> =
      load_record(self.backend.as_ref(), &self.scope, DEAD_LETTER_RECORD)?;
    dead.extend(entries);
    save_record(self.backend.as_ref(), &self.scope, DEAD_LETTER_RECORD, &dead)?;

    let mut queue = self.load_queue()?;
    queue.retain(|action| !ids.contains(&action.id));
    self.save_queue(&queue)?;
    self.forget_attempts(&ids)
  }

  pub fn dead_letters(&self) -> StoreResult<Vec<DeadLetter>> {
    load_record(self.backend.as_ref(), &self.scope, DEAD_LETTER_RECORD)
  }

  /// Put a dead letter back at the end of the queue with a clean ledger.
  pub fn requeue_dead_letter(&self, id: Uuid) -> StoreResult<OfflineAction> {
    let _guard = self.lock()?;

    let mut dead: Vec<DeadLetter> =
      load_record(self.backend.as_ref(), &self.scope, DEAD_LETTER_RECORD)?;
    let position = dead
      .iter()
      .position(|d| d.action.id == id)
      .ok_or(StoreError::UnknownDeadLetter(id))?;
    let letter = dead.remove(position);

    let mut queue = self.load_queue()?;
    queue.push(letter.action.clone());
    self.save_queue(&queue)?;
    save_record(self.backend.as_ref(), &self.scope, DEAD_LETTER_RECORD, &dead)?;

    Ok(letter.action)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{ActionTemplate, Target};
  use crate::testing::MemoryBackend;
  use serde_json::json;

  fn store() -> (Arc<MemoryBackend>, QueueStore) {
    let backend = Arc::new(MemoryBackend::new());
    let store = QueueStore::new(backend.clone(), "facility-1");
    (backend, store)
  }

  fn child(name: &str) -> OfflineAction {
    ActionTemplate::insert(Target::Children, json!({ "name": name }), "staff-1").stamp()
  }

  fn ids(actions: &[OfflineAction]) -> Vec<Uuid> {
    actions.iter().map(|a| a.id).collect()
  }

  #[test]
  fn test_enqueue_preserves_order() {
    let (_, store) = store();
    let actions: Vec<_> = ["Aoi", "Ren", "Mei", "Sora"].iter().map(|n| child(n)).collect();
    for action in &actions {
      store.enqueue(action.clone()).unwrap();
    }

    assert_eq!(store.all().unwrap(), actions);
    assert_eq!(store.len().unwrap(), 4);
  }

  #[test]
  fn test_remove_by_ids_keeps_relative_order() {
    let (_, store) = store();
    let actions: Vec<_> = (0..6).map(|i| child(&format!("c{}", i))).collect();
    for action in &actions {
      store.enqueue(action.clone()).unwrap();
    }

    let remove: HashSet<Uuid> = [actions[0].id, actions[3].id, actions[4].id].into();
    store.remove_by_ids(&remove).unwrap();

    assert_eq!(
      ids(&store.all().unwrap()),
      vec![actions[1].id, actions[2].id, actions[5].id]
    );
  }

  #[test]
  fn test_remove_unknown_ids_is_noop() {
    let (_, store) = store();
    let action = child("Aoi");
    store.enqueue(action.clone()).unwrap();

    store.remove_by_ids(&[Uuid::new_v4()].into()).unwrap();
    assert_eq!(store.all().unwrap(), vec![action]);
  }

  #[test]
  fn test_clear() {
    let (_, store) = store();
    store.enqueue(child("Aoi")).unwrap();
    store.enqueue(child("Ren")).unwrap();
    store.clear().unwrap();
    assert!(store.all().unwrap().is_empty());
  }

  #[test]
  fn test_scopes_are_independent() {
    let backend = Arc::new(MemoryBackend::new());
    let a = QueueStore::new(backend.clone(), "a");
    let b = QueueStore::new(backend, "b");

    a.enqueue(child("Aoi")).unwrap();
    assert_eq!(a.len().unwrap(), 1);
    assert_eq!(b.len().unwrap(), 0);
  }

  #[test]
  fn test_unavailable_backend_fails_loudly() {
    let (backend, store) = store();
    backend.set_unavailable(true);

    assert!(store.enqueue(child("Aoi")).is_err());
    assert!(store.all().is_err());
    assert!(store.remove_by_ids(&[Uuid::new_v4()].into()).is_err());
  }

  #[test]
  fn test_undecodable_queue_is_reported() {
    let (backend, store) = store();
    backend.save("facility-1", QUEUE_RECORD, b"{not json").unwrap();

    let err = store.all().unwrap_err();
    assert!(matches!(err, StoreError::Serialization { .. }));
  }

  #[test]
  fn test_concurrent_enqueues_are_not_lost() {
    let (_, store) = store();
    let store = Arc::new(store);

    let handles: Vec<_> = (0..8)
      .map(|t| {
        let store = store.clone();
        std::thread::spawn(move || {
          for i in 0..25 {
            store.enqueue(child(&format!("t{}-{}", t, i))).unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(store.len().unwrap(), 200);
  }

  #[test]
  fn test_rejection_ledger() {
    let (_, store) = store();
    let a = child("Aoi");
    let b = child("Ren");
    store.enqueue(a.clone()).unwrap();
    store.enqueue(b.clone()).unwrap();

    store.record_rejections(&[a.id]).unwrap();
    let totals = store.record_rejections(&[a.id, b.id]).unwrap();
    assert_eq!(totals[&a.id], 2);
    assert_eq!(totals[&b.id], 1);

    // The queued actions themselves are untouched.
    assert_eq!(store.all().unwrap(), vec![a.clone(), b.clone()]);

    // Removal forgets the ledger entry.
    store.remove_by_ids(&[a.id].into()).unwrap();
    store.enqueue(a.clone()).unwrap();
    assert_eq!(store.record_rejections(&[a.id]).unwrap()[&a.id], 1);
  }

  #[test]
  fn test_dead_letter_and_requeue() {
    let (_, store) = store();
    let a = child("Aoi");
    let b = child("Ren");
    store.enqueue(a.clone()).unwrap();
    store.enqueue(b.clone()).unwrap();

    store
      .move_to_dead_letters(vec![DeadLetter {
        action: a.clone(),
        rejections: 5,
        last_error: "HTTP 422".into(),
        dead_at: Utc::now(),
      }])
      .unwrap();

    assert_eq!(store.all().unwrap(), vec![b.clone()]);
    let dead = store.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].action, a);

    let requeued = store.requeue_dead_letter(a.id).unwrap();
    assert_eq!(requeued, a);
    assert_eq!(store.all().unwrap(), vec![b, a]);
    assert!(store.dead_letters().unwrap().is_empty());
  }

  #[test]
  fn test_requeue_unknown_dead_letter() {
    let (_, store) = store();
    let err = store.requeue_dead_letter(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, StoreError::UnknownDeadLetter(_)));
  }
}
