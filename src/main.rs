mod action;
mod config;
mod connectivity;
mod error;
mod executor;
mod logging;
mod outbox;
mod remote;
mod store;
mod sync;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use action::{ActionKind, ActionTemplate, Target};
use config::Config;
use connectivity::{ConnectivityMonitor, ConnectivityProbe};
use executor::MutationExecutor;
use outbox::{Outbox, Outcome};
use remote::RestClient;
use store::{FetchSource, QueueStore, SnapshotStore, SqliteBackend};
use sync::{RetryConfig, SyncOrchestrator, TriggerOutcome};

#[derive(Parser, Debug)]
#[command(name = "nursery-sync")]
#[command(about = "Offline-first outbox for the nursery admin backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nursery-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Write a mutation, queueing it if the remote is unreachable
  Perform {
    /// insert, update or delete
    kind: ActionKind,
    /// Target collection, e.g. children or growth_records
    target: Target,
    /// JSON payload; update and delete need an "id"
    payload: String,
  },
  /// Run a sync pass now
  Sync,
  /// Show pending mutations
  Queue {
    /// Drop every pending mutation
    #[arg(long)]
    clear: bool,
  },
  /// Show mutations given up on after repeated rejection
  DeadLetters {
    /// Move a dead letter back into the queue
    #[arg(long)]
    requeue: Option<Uuid>,
  },
  /// List a collection, falling back to the last cached copy when offline
  List { target: Target },
  /// Inspect or seed the snapshot cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Probe connectivity and sync automatically until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get { key: String },
  Put { key: String, value: String },
}

/// Wired-up engine for one configured scope.
struct Engine {
  outbox: Outbox,
  monitor: ConnectivityMonitor,
  client: Arc<RestClient>,
  probe: ConnectivityProbe,
}

impl Engine {
  fn build(config: &Config) -> Result<Self> {
    let client = Arc::new(RestClient::new(&config.remote)?);
    let probe = ConnectivityProbe::new(
      client.health_url(&config.sync.health_path)?,
      config.sync.probe_interval(),
    )?;

    let db_path = config.data_dir()?.join("outbox.db");
    let backend = Arc::new(SqliteBackend::open(&db_path)?);

    let monitor = ConnectivityMonitor::new(false);
    let queue = Arc::new(QueueStore::new(backend.clone(), config.scope.clone()));
    let snapshots = Arc::new(SnapshotStore::new(backend, config.scope.clone()));
    let executor = Arc::new(MutationExecutor::new(
      client.clone(),
      config.remote.timeout(),
    ));
    let sync = Arc::new(
      SyncOrchestrator::new(queue.clone(), executor.clone(), monitor.clone())
        .with_rejection_ceiling(config.sync.rejection_ceiling())
        .with_retry(RetryConfig::from(&config.sync.retry)),
    );

    let outbox = Outbox::new(monitor.clone(), executor, queue, snapshots, sync);

    Ok(Self {
      outbox,
      monitor,
      client,
      probe,
    })
  }

  /// Probe once so one-shot commands know which branch to take.
  async fn refresh_connectivity(&self) {
    self.monitor.set_online(self.probe.check().await);
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?.join("logs"), args.verbose)?;

  let engine = Engine::build(&config)?;

  match args.command {
    Command::Perform {
      kind,
      target,
      payload,
    } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      if !payload.is_object() {
        return Err(eyre!("Payload must be a JSON object"));
      }

      engine.refresh_connectivity().await;
      let template = ActionTemplate::new(kind, target, payload, config.owner.clone());
      match engine.outbox.perform(template).await? {
        Outcome::Written { id, remote_id } => match remote_id {
          Some(remote_id) => println!("written {} (remote id {})", id, remote_id),
          None => println!("written {}", id),
        },
        outcome @ Outcome::Queued { .. } => println!(
          "queued {} ({} pending)",
          outcome.id(),
          engine.outbox.pending()?
        ),
      }
    }

    Command::Sync => {
      engine.refresh_connectivity().await;
      match engine.outbox.trigger_sync().await? {
        TriggerOutcome::Offline => println!("offline, nothing sent"),
        TriggerOutcome::Coalesced => println!("sync already running"),
        TriggerOutcome::Ran { last, .. } if last.skipped => println!("went offline, nothing sent"),
        TriggerOutcome::Ran { last, .. } => println!(
          "sent {}, failed {}, dead-lettered {}, {} pending ({:.1?})",
          last.succeeded, last.failed, last.dead_lettered, last.remaining, last.duration
        ),
      }
    }

    Command::Queue { clear } => {
      if clear {
        engine.outbox.queue().clear()?;
        println!("queue cleared");
      } else {
        for action in engine.outbox.queue().all()? {
          println!(
            "{}  {}  {:<7} {:<16} {}",
            action.id,
            action.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            action.kind,
            action.target,
            action.payload
          );
        }
      }
    }

    Command::DeadLetters { requeue } => {
      if let Some(id) = requeue {
        let action = engine.outbox.queue().requeue_dead_letter(id)?;
        println!("requeued {}", action.describe());
      } else {
        for letter in engine.outbox.queue().dead_letters()? {
          println!(
            "{}  {}  rejected {}x, gave up {}: {}",
            letter.action.id,
            letter.action.describe(),
            letter.rejections,
            letter.dead_at.format("%Y-%m-%d %H:%M:%S"),
            letter.last_error
          );
        }
      }
    }

    Command::List { target } => {
      let key = format!("list:{}", target.table());
      let client = engine.client.clone();
      let owner = config.owner.clone();
      let fetched = engine
        .outbox
        .snapshots()
        .fetch_with_fallback(&key, || async move {
          client
            .select(target, &owner)
            .await
            .map_err(color_eyre::Report::from)
        })
        .await?;

      if let (FetchSource::Offline, Some(captured_at)) = (fetched.source, fetched.captured_at) {
        eprintln!("offline, showing copy from {}", captured_at);
      }
      println!("{}", serde_json::to_string_pretty(&fetched.data)?);
    }

    Command::Cache { command } => match command {
      CacheCommand::Get { key } => match engine.outbox.load_cached::<Value>(&key)? {
        Some(snapshot) => println!(
          "{} (captured {})",
          serde_json::to_string_pretty(&snapshot.value)?,
          snapshot.captured_at
        ),
        None => println!("no snapshot for '{}'", key),
      },
      CacheCommand::Put { key, value } => {
        let value: Value =
          serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
        engine.outbox.save_cached(&key, &value)?;
      }
    },

    Command::Watch => watch(engine).await?,
  }

  Ok(())
}

/// Keep the queue flowing: probe connectivity, sync on reconnect, retry with
/// backoff while failures remain.
async fn watch(engine: Engine) -> Result<()> {
  let Engine {
    outbox,
    monitor,
    probe,
    ..
  } = engine;

  tracing::info!(pending = outbox.pending()?, "watching for connectivity");

  let orchestrator = outbox.orchestrator().clone();
  let subscription = orchestrator.attach();
  let retry = orchestrator.spawn_retry_loop();
  let prober = probe.spawn(monitor);

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  subscription.unsubscribe();
  prober.abort();
  retry.abort();

  let stats = orchestrator.stats();
  tracing::info!(
    passes = stats.passes_completed,
    delivered = stats.actions_delivered,
    transient_failures = stats.transient_failures,
    rejections = stats.rejections,
    dead_lettered = stats.dead_lettered,
    last_pass_at = ?stats.last_pass_at,
    last_error = ?stats.last_error,
    pending = outbox.pending()?,
    "stopped"
  );

  Ok(())
}
