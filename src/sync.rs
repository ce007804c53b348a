//! Sync passes: replay the queue against the remote store and reconcile.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::action::OfflineAction;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::error::{RemoteError, StoreResult};
use crate::executor::{Applied, MutationExecutor};
use crate::store::{DeadLetter, QueueStore};

/// Capped exponential backoff between automatic retry passes.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
}

impl RetryConfig {
  pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
    Self {
      initial_delay,
      max_delay,
      multiplier,
    }
  }

  /// Delay before the n-th consecutive retry (1-indexed; 0 means no delay).
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    if attempt == 0 {
      return Duration::ZERO;
    }

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
    let capped = delay_ms.min(self.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
  }
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self::new(Duration::from_secs(2), Duration::from_secs(300), 2.0)
  }
}

/// Outcomes of one fan-out, split by what the queue should do with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
  /// Applied remotely; remove from the queue
  pub succeeded: Vec<Uuid>,
  /// Could not complete; keep queued
  pub transient: Vec<Uuid>,
  /// Refused by the remote; keep queued and count toward the ceiling
  pub rejected: Vec<(Uuid, String)>,
}

impl Partition {
  pub fn failed(&self) -> usize {
    self.transient.len() + self.rejected.len()
  }
}

/// Split executor outcomes into succeeded and failed ids, keeping input order.
pub fn partition_outcomes(
  outcomes: impl IntoIterator<Item = (Uuid, Result<Applied, RemoteError>)>,
) -> Partition {
  let mut partition = Partition::default();
  for (id, outcome) in outcomes {
    match outcome {
      Ok(_) => partition.succeeded.push(id),
      Err(RemoteError::Transient(_)) => partition.transient.push(id),
      Err(RemoteError::Rejected(message)) => partition.rejected.push((id, message)),
    }
  }
  partition
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
  /// Pass did not run because the monitor reported offline
  pub skipped: bool,
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub dead_lettered: usize,
  /// Queue length after reconciliation
  pub remaining: usize,
  pub duration: Duration,
}

/// Result of [`SyncOrchestrator::trigger`].
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
  /// Not online; nothing was attempted
  Offline,
  /// A pass was already running; it will run once more when it finishes
  Coalesced,
  /// This trigger drove `passes` passes; `last` is the final one
  Ran { passes: u32, last: PassReport },
}

/// Running totals across passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
  pub passes_completed: u64,
  pub actions_delivered: u64,
  pub transient_failures: u64,
  pub rejections: u64,
  pub dead_lettered: u64,
  /// Consecutive passes that left failed actions in the queue
  pub consecutive_failed_passes: u32,
  pub last_pass_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct RunState {
  running: bool,
  rerun: bool,
}

/// Ownership of the running flag for one `trigger` call.
///
/// `finish` releases the flag in the same critical section that checks for a
/// pending rerun. Dropping an unfinished guard (error return, cancelled
/// future) resets both flags.
struct RunningGuard<'a> {
  state: &'a Mutex<RunState>,
  armed: bool,
}

impl RunningGuard<'_> {
  /// Returns true if another trigger arrived and one more pass must run.
  fn finish(&mut self) -> bool {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if std::mem::take(&mut state.rerun) {
      return true;
    }
    state.running = false;
    self.armed = false;
    false
  }
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.running = false;
    state.rerun = false;
  }
}

/// Drains the durable queue through the executor.
pub struct SyncOrchestrator {
  queue: Arc<QueueStore>,
  executor: Arc<MutationExecutor>,
  monitor: ConnectivityMonitor,
  rejection_ceiling: Option<u32>,
  retry: RetryConfig,
  state: Mutex<RunState>,
  stats: Mutex<SyncStats>,
  retry_wakeup: Notify,
}

impl SyncOrchestrator {
  pub fn new(
    queue: Arc<QueueStore>,
    executor: Arc<MutationExecutor>,
    monitor: ConnectivityMonitor,
  ) -> Self {
    Self {
      queue,
      executor,
      monitor,
      rejection_ceiling: None,
      retry: RetryConfig::default(),
      state: Mutex::new(RunState::default()),
      stats: Mutex::new(SyncStats::default()),
      retry_wakeup: Notify::new(),
    }
  }

  /// Move actions to the dead-letter record after this many rejections.
  pub fn with_rejection_ceiling(mut self, ceiling: Option<u32>) -> Self {
    self.rejection_ceiling = ceiling.filter(|c| *c > 0);
    self
  }

  pub fn with_retry(mut self, retry: RetryConfig) -> Self {
    self.retry = retry;
    self
  }

  pub fn stats(&self) -> SyncStats {
    self.lock_stats().clone()
  }

  fn lock_stats(&self) -> MutexGuard<'_, SyncStats> {
    self.stats.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_state(&self) -> MutexGuard<'_, RunState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run sync passes until no further trigger is pending.
  ///
  /// A trigger arriving while a pass is in flight is folded into one extra
  /// pass after the current one, never run in parallel. Remote failures stay
  /// inside the pass; only local persistence errors are returned.
  pub async fn trigger(&self) -> StoreResult<TriggerOutcome> {
    if !self.monitor.is_online() {
      tracing::debug!("sync trigger ignored while offline");
      return Ok(TriggerOutcome::Offline);
    }

    let Some(mut running) = self.try_begin() else {
      tracing::debug!("sync pass in flight, coalescing trigger");
      return Ok(TriggerOutcome::Coalesced);
    };

    let mut passes = 0;
    loop {
      let last = match self.run_pass().await {
        Ok(report) => report,
        Err(e) => {
          tracing::error!(error = %e, "sync pass aborted by local storage failure");
          self.lock_stats().last_error = Some(e.to_string());
          return Err(e);
        }
      };
      passes += 1;

      if !running.finish() {
        return Ok(TriggerOutcome::Ran { passes, last });
      }
    }
  }

  /// Claim the running flag, or record a rerun if a pass is in flight.
  fn try_begin(&self) -> Option<RunningGuard<'_>> {
    let mut state = self.lock_state();
    if state.running {
      state.rerun = true;
      return None;
    }
    state.running = true;
    Some(RunningGuard {
      state: &self.state,
      armed: true,
    })
  }

  /// One drain-and-reconcile pass over the current queue.
  async fn run_pass(&self) -> StoreResult<PassReport> {
    let start = Instant::now();

    if !self.monitor.is_online() {
      return Ok(PassReport {
        skipped: true,
        ..PassReport::default()
      });
    }

    let snapshot = self.queue.all()?;
    if snapshot.is_empty() {
      return Ok(PassReport::default());
    }

    tracing::info!(actions = snapshot.len(), "sync pass started");

    let outcomes = join_all(snapshot.iter().map(|action| async move {
      let outcome = self.executor.execute(action).await;
      match &outcome {
        Ok(_) => tracing::debug!(action = %action.describe(), "replayed"),
        Err(e) => tracing::warn!(action = %action.describe(), error = %e, "replay failed"),
      }
      (action.id, outcome)
    }))
    .await;

    let partition = partition_outcomes(outcomes);

    let succeeded: HashSet<Uuid> = partition.succeeded.iter().copied().collect();
    self.queue.remove_by_ids(&succeeded)?;

    let dead_lettered = self.apply_rejection_ceiling(&snapshot, &partition.rejected)?;
    let remaining = self.queue.len()?;

    let report = PassReport {
      skipped: false,
      attempted: snapshot.len(),
      succeeded: partition.succeeded.len(),
      failed: partition.failed(),
      dead_lettered,
      remaining,
      duration: start.elapsed(),
    };

    self.record_pass(&partition, &report);

    tracing::info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      dead_lettered = report.dead_lettered,
      remaining = report.remaining,
      "sync pass finished"
    );

    Ok(report)
  }

  /// Count rejections and dead-letter actions that reached the ceiling.
  fn apply_rejection_ceiling(
    &self,
    snapshot: &[OfflineAction],
    rejected: &[(Uuid, String)],
  ) -> StoreResult<usize> {
    let Some(ceiling) = self.rejection_ceiling else {
      return Ok(0);
    };
    if rejected.is_empty() {
      return Ok(0);
    }

    let ids: Vec<Uuid> = rejected.iter().map(|(id, _)| *id).collect();
    let totals = self.queue.record_rejections(&ids)?;
    let by_id: HashMap<Uuid, &OfflineAction> = snapshot.iter().map(|a| (a.id, a)).collect();

    let letters: Vec<DeadLetter> = rejected
      .iter()
      .filter_map(|(id, message)| {
        let count = totals.get(id).copied().unwrap_or(0);
        if count < ceiling {
          return None;
        }
        let action = by_id.get(id)?;
        tracing::warn!(
          action = %action.describe(),
          rejections = count,
          "giving up on action, moving to dead letters"
        );
        Some(DeadLetter {
          action: (*action).clone(),
          rejections: count,
          last_error: message.clone(),
          dead_at: Utc::now(),
        })
      })
      .collect();

    let moved = letters.len();
    self.queue.move_to_dead_letters(letters)?;
    Ok(moved)
  }

  fn record_pass(&self, partition: &Partition, report: &PassReport) {
    let failures_left = report.failed > report.dead_lettered;
    {
      let mut stats = self.lock_stats();
      stats.passes_completed += 1;
      stats.actions_delivered += report.succeeded as u64;
      stats.transient_failures += partition.transient.len() as u64;
      stats.rejections += partition.rejected.len() as u64;
      stats.dead_lettered += report.dead_lettered as u64;
      stats.last_pass_at = Some(Utc::now());
      stats.last_error = None;
      if failures_left {
        stats.consecutive_failed_passes += 1;
      } else {
        stats.consecutive_failed_passes = 0;
      }
    }

    if failures_left {
      self.retry_wakeup.notify_one();
    }
  }

  /// Delay before the next automatic retry, if failed actions are waiting.
  pub fn retry_delay(&self) -> Option<Duration> {
    if !self.monitor.is_online() {
      return None;
    }
    let failed_passes = self.lock_stats().consecutive_failed_passes;
    (failed_passes > 0).then(|| self.retry.delay_for_attempt(failed_passes))
  }

  /// Trigger a pass whenever the monitor goes online.
  ///
  /// Must be called from within a tokio runtime. The subscription holds only a
  /// weak reference, so it does not keep the orchestrator alive.
  pub fn attach(self: &Arc<Self>) -> Subscription {
    let handle = tokio::runtime::Handle::current();
    let weak = Arc::downgrade(self);

    self.monitor.on_transition(
      move || {
        let Some(this) = weak.upgrade() else {
          return;
        };
        handle.spawn(async move {
          if let Err(e) = this.trigger().await {
            tracing::error!(error = %e, "sync after reconnect failed");
          }
        });
      },
      || tracing::debug!("offline, sync passes paused"),
    )
  }

  /// Retry failed actions with backoff until aborted.
  pub fn spawn_retry_loop(self: &Arc<Self>) -> JoinHandle<()> {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        match this.retry_delay() {
          Some(delay) => {
            tracing::debug!(?delay, "retrying failed actions after backoff");
            tokio::time::sleep(delay).await;
            if let Err(e) = this.trigger().await {
              tracing::error!(error = %e, "retry pass failed");
            }
          }
          None => this.retry_wakeup.notified().await,
        }
      }
    })
  }
}
