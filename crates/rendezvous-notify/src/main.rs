use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use rendezvous_core::clock::{Clock, ManualClock, SystemClock};
use rendezvous_core::config::NotifyConfig;
use rendezvous_core::dedup_key::{DedupKey, MATCH_KEY_PREFIX, MESSAGE_KEY_PREFIX};
use rendezvous_core::types::SessionContext;
use rendezvous_notify::dedup::DeduplicationCache;
use rendezvous_notify::error::HostError;
use rendezvous_notify::host::{HostBindings, LocalNotification, LocalNotifier, RenderRequest, Renderer};
use rendezvous_notify::recorder::Recorder;
use rendezvous_notify::router::RouterNotification;
use rendezvous_notify::service::{NotificationService, ServiceDeps};
use rendezvous_notify::sources::feed::FeedSource;
use rendezvous_notify::store::{KeyValueStore, MemoryStore, SqliteStore};

const DEFAULT_RUNTIME_DIR: &str = "/tmp/rendezvous";
const DEFAULT_DB: &str = "/tmp/rendezvous/dedup.db";
const DEFAULT_FEED_SOCKET: &str = "/tmp/rendezvous/feed.sock";

/// How long `replay` waits for the pipeline to go quiet after the last document.
const REPLAY_SETTLE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "rendezvous", about = "Match and message notification engine")]
struct Cli {
    /// Engine policy (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = "RENDEZVOUS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite file for persisted dedup entries
    #[arg(long, global = true, default_value = DEFAULT_DB)]
    db: PathBuf,

    /// Keep dedup entries in memory only
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SessionArgs {
    /// Session id of the signed-in attendee
    #[arg(long)]
    session: String,

    /// Profile id of the signed-in attendee
    #[arg(long)]
    profile: String,

    /// Live event the session belongs to
    #[arg(long)]
    event: String,

    /// Pretend the app is in the background (fallbacks instead of toasts)
    #[arg(long)]
    background: bool,
}

impl SessionArgs {
    fn context(&self) -> SessionContext {
        SessionContext::new(&self.session, &self.profile, &self.event)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against documents arriving on a Unix socket
    Daemon {
        #[command(flatten)]
        session: SessionArgs,

        /// Socket accepting newline-delimited JSON documents
        #[arg(long, default_value = DEFAULT_FEED_SOCKET)]
        socket: PathBuf,

        /// Record every router outcome to a JSONL file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Push a JSONL file of documents through the engine and print outcomes
    Replay {
        /// JSONL file of raw documents
        file: PathBuf,

        #[command(flatten)]
        session: SessionArgs,

        /// Freeze the clock at this instant (RFC 3339) instead of using wall time
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Inspect or wipe persisted dedup entries
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List persisted dedup entries with their age
    List,
    /// Remove every persisted dedup entry
    Clear,
}

/// Prints what a phone would show.
struct ConsoleHost;

impl Renderer for ConsoleHost {
    fn render(&self, request: RenderRequest) -> Result<(), HostError> {
        println!(
            "[{:?}] {} | {} (opens {})",
            request.style, request.title, request.body, request.participant_id
        );
        Ok(())
    }
}

impl LocalNotifier for ConsoleHost {
    fn deliver(&self, notification: &LocalNotification) -> Result<(), HostError> {
        println!(
            "[local {}] {} | {}",
            notification.fallback_id, notification.title, notification.body
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing. Respects RUST_LOG env var, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => NotifyConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => NotifyConfig::default(),
    };

    match cli.command {
        Commands::Daemon {
            ref session,
            ref socket,
            ref record,
        } => {
            let store = open_store(&cli.db, cli.in_memory)?;
            run_daemon(config, store, session.clone(), socket.clone(), record.clone()).await?;
        }
        Commands::Replay {
            ref file,
            ref session,
            at,
        } => {
            let store = open_store(&cli.db, cli.in_memory)?;
            let clock: Arc<dyn Clock> = match at {
                Some(at) => Arc::new(ManualClock::starting_at(at)),
                None => Arc::new(SystemClock),
            };
            run_replay(config, store, clock, session.clone(), file).await?;
        }
        Commands::Cache { ref action } => {
            let store = open_store(&cli.db, cli.in_memory)?;
            match action {
                CacheAction::List => run_cache_list(store.as_ref()).await?,
                CacheAction::Clear => run_cache_clear(config, store).await?,
            }
        }
    }

    Ok(())
}

fn open_store(db: &Path, in_memory: bool) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(dir) = db.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let store =
        SqliteStore::open(db).with_context(|| format!("opening dedup store {}", db.display()))?;
    Ok(Arc::new(store))
}

fn console_bindings(background: bool) -> HostBindings {
    let foreground = Arc::new(AtomicBool::new(!background));
    HostBindings {
        presence: Arc::new(move || foreground.load(Ordering::Relaxed)),
        navigator: Arc::new(|participant_id: &str| {
            println!("-> open conversation with {participant_id}");
        }),
        renderer: Arc::new(ConsoleHost),
        match_modal: None,
    }
}

async fn run_daemon(
    config: NotifyConfig,
    store: Arc<dyn KeyValueStore>,
    session: SessionArgs,
    socket: PathBuf,
    record: Option<PathBuf>,
) -> anyhow::Result<()> {
    tracing::info!(
        socket = %socket.display(),
        session_id = %session.session,
        background = session.background,
        record = ?record,
        "starting rendezvous daemon"
    );
    std::fs::create_dir_all(DEFAULT_RUNTIME_DIR)?;

    let feed = FeedSource::new();
    let service = NotificationService::start(
        config,
        ServiceDeps::new(
            store,
            Arc::new(feed.clone()),
            Arc::new(ConsoleHost),
            Arc::new(SystemClock),
        ),
    );

    let cancel = CancellationToken::new();
    let mut recorder = match record {
        Some(ref path) => {
            let r = Recorder::open(path, service.router().subscribe(), service.session().clone())
                .await
                .with_context(|| format!("opening recorder {}", path.display()))?
                .with_cancel(cancel.clone());
            tracing::info!(path = %path.display(), "JSONL recorder enabled");
            Some(tokio::spawn(r.run()))
        }
        None => None,
    };

    service.init(console_bindings(session.background));
    let subscriptions = service.begin_session(session.context()).await;
    tracing::info!(subscriptions, "session listeners ready");

    let mut recorder_finished = false;
    tokio::select! {
        result = feed.listen(socket.clone(), cancel.clone()) => {
            match result {
                Ok(()) => tracing::warn!("feed socket exited unexpectedly"),
                Err(e) => tracing::warn!("feed socket error: {e}"),
            }
        }
        _ = async {
            match recorder.as_mut() {
                Some(task) => {
                    let _ = task.await;
                }
                None => std::future::pending::<()>().await,
            }
        } => {
            tracing::warn!("recorder exited unexpectedly");
            recorder_finished = true;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    cancel.cancel();
    service.shutdown().await;
    if let Some(task) = recorder.filter(|_| !recorder_finished) {
        match task.await {
            Ok(summary) => tracing::info!(
                written = summary.written,
                missed = summary.missed,
                by_disposition = ?summary.by_disposition,
                "recorder stopped"
            ),
            Err(e) => tracing::warn!("recorder task failed: {e}"),
        }
    }
    if socket.exists() {
        if let Err(e) = std::fs::remove_file(&socket) {
            tracing::warn!(path = %socket.display(), "failed to remove socket file: {e}");
        }
    }
    tracing::info!("rendezvous daemon stopped");
    Ok(())
}

async fn run_replay(
    config: NotifyConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    session: SessionArgs,
    file: &Path,
) -> anyhow::Result<()> {
    let settle = config.fallback.delay() + REPLAY_SETTLE;
    let feed = FeedSource::new();
    let service = NotificationService::start(
        config,
        ServiceDeps::new(store, Arc::new(feed.clone()), Arc::new(ConsoleHost), clock),
    );
    let mut outcomes = service.router().subscribe();

    service.init(console_bindings(session.background));
    service.begin_session(session.context()).await;
    let published = feed
        .replay_file(file)
        .await
        .with_context(|| format!("replaying {}", file.display()))?;

    let mut seen = 0usize;
    loop {
        match tokio::time::timeout(settle, outcomes.recv()).await {
            Ok(Ok(outcome)) => {
                print_outcome(&outcome);
                seen += 1;
            }
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                tracing::warn!(skipped = n, "outcome stream lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }

    service.shutdown().await;
    println!("{published} documents replayed, {seen} outcomes");
    Ok(())
}

fn print_outcome(outcome: &RouterNotification) {
    println!(
        "{:<14} {:<8} {}",
        format!("{:?}", outcome.disposition),
        format!("{:?}", outcome.kind),
        outcome.event_id
    );
}

async fn run_cache_list(store: &dyn KeyValueStore) -> anyhow::Result<()> {
    let now = SystemClock.now_ms();
    let mut total = 0usize;
    for prefix in [MATCH_KEY_PREFIX, MESSAGE_KEY_PREFIX] {
        for key in store.keys_with_prefix(prefix).await? {
            let value = store.get(&key).await?.unwrap_or_default();
            let age = value
                .trim()
                .parse::<i64>()
                .map(|shown_at| format!("{}s ago", (now - shown_at) / 1000))
                .unwrap_or_else(|_| format!("unreadable value {value:?}"));
            let kind = DedupKey::parse(&key)
                .and_then(|k| k.kind())
                .map(|k| format!("{k:?}"))
                .unwrap_or_else(|| "?".into());
            println!("{key}  {kind}  {age}");
            total += 1;
        }
    }
    println!("{total} persisted entries");
    Ok(())
}

async fn run_cache_clear(config: NotifyConfig, store: Arc<dyn KeyValueStore>) -> anyhow::Result<()> {
    let mut before = 0usize;
    for prefix in [MATCH_KEY_PREFIX, MESSAGE_KEY_PREFIX] {
        before += store.keys_with_prefix(prefix).await?.len();
    }
    let cache = DeduplicationCache::new(
        store,
        Arc::new(SystemClock),
        config.dedup,
        config.store.timeout(),
    );
    cache.clear().await;
    println!("removed {before} persisted entries");
    Ok(())
}
