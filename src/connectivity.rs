//! Online/offline state with transition notifications.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
  id: u64,
  to_online: Callback,
  to_offline: Callback,
}

struct Inner {
  online: AtomicBool,
  listeners: Mutex<Vec<Listener>>,
  next_id: AtomicU64,
}

/// Tracks connectivity and notifies subscribers on every transition edge.
///
/// Rapid flapping is not coalesced: each edge fires its callbacks.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    Self {
      inner: Arc::new(Inner {
        online: AtomicBool::new(initially_online),
        listeners: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Feed the platform signal. Repeating the current state is not an edge.
  pub fn set_online(&self, online: bool) {
    // The flag flips under the listeners lock, so a concurrent subscriber
    // either sees the new state or is in the snapshot, never both.
    let callbacks: Vec<Callback> = {
      let listeners = self
        .inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      let previous = self.inner.online.swap(online, Ordering::SeqCst);
      if previous == online {
        return;
      }
      listeners
        .iter()
        .map(|l| {
          if online {
            l.to_online.clone()
          } else {
            l.to_offline.clone()
          }
        })
        .collect()
    };

    if online {
      tracing::info!("connectivity: online");
    } else {
      tracing::warn!("connectivity: offline");
    }

    // Callbacks run outside the lock so they may subscribe or unsubscribe.
    for callback in callbacks {
      callback();
    }
  }

  /// Register transition callbacks.
  ///
  /// If the monitor is already online, `to_online` runs once immediately so a
  /// fresh subscriber sees the edge it missed. The returned handle removes the
  /// callbacks when dropped.
  pub fn on_transition(
    &self,
    to_online: impl Fn() + Send + Sync + 'static,
    to_offline: impl Fn() + Send + Sync + 'static,
  ) -> Subscription {
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
    let to_online: Callback = Arc::new(to_online);

    let already_online = {
      let mut listeners = self
        .inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      listeners.push(Listener {
        id,
        to_online: to_online.clone(),
        to_offline: Arc::new(to_offline),
      });
      self.is_online()
    };

    if already_online {
      to_online();
    }

    Subscription {
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  #[cfg(test)]
  fn listener_count(&self) -> usize {
    self.inner.listeners.lock().unwrap().len()
  }
}

/// Handle returned by [`ConnectivityMonitor::on_transition`].
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  inner: Weak<Inner>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|l| l.id != self.id);
    }
  }
}

/// Polls the remote health endpoint and feeds the result into a monitor.
///
/// Any HTTP response means the remote is reachable; only transport failures
/// count as offline.
pub struct ConnectivityProbe {
  http: reqwest::Client,
  url: Url,
  interval: Duration,
}

impl ConnectivityProbe {
  pub fn new(url: Url, interval: Duration) -> color_eyre::Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(5))
      .build()?;
    Ok(Self {
      http,
      url,
      interval,
    })
  }

  pub async fn check(&self) -> bool {
    match self.http.head(self.url.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        tracing::debug!(error = %e, url = %self.url, "connectivity probe failed");
        false
      }
    }
  }

  /// Probe forever on a background task.
  pub fn spawn(self, monitor: ConnectivityMonitor) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        let online = self.check().await;
        monitor.set_online(online);
      }
    })
  }
}
