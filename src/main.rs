use clap::{Parser, Subcommand};
use offline_outbox::analytics::AnalyticsService;
use offline_outbox::config::{load_preferences, QueueConfig};
use offline_outbox::crypto::HeaderCipher;
use offline_outbox::events::EventBus;
use offline_outbox::network::NetworkMonitor;
use offline_outbox::notifications::NotificationService;
use offline_outbox::sync::{EnqueueRequest, QueueStore, SyncQueue};
use offline_outbox::transport::{HttpTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "offline-outbox")]
#[command(about = "Replay mutations queued while offline")]
#[command(version)]
struct Cli {
    /// Directory holding the queue database
    #[arg(long, env = "OUTBOX_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Base URL relative endpoints are sent to
    #[arg(long, env = "OUTBOX_API_BASE", global = true)]
    api_base: Option<String>,

    /// Treat the network as down (nothing is sent)
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flush everything that is due
    Drain {
        /// Keep flushing on the retry schedule until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Queue a mutation for later delivery
    Enqueue {
        endpoint: String,
        #[arg(short = 'X', long, default_value = "POST")]
        method: String,
        /// JSON request body
        #[arg(long)]
        json: Option<String>,
    },
    /// Show queued operations and recent delivery stats
    Status {
        #[arg(long, default_value_t = 7)]
        days: i32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("offline_outbox=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = QueueConfig::from_env()?;
    if let Some(dir) = cli.db_path {
        config.store.data_dir = Some(dir);
    }
    config.store = config.store.or_user_data_dir();
    if config.store.data_dir.is_none() {
        return Err("No data directory available, pass --db-path or set OUTBOX_DB_PATH".into());
    }
    if cli.api_base.is_some() {
        config.api_base = cli.api_base;
    }
    // Only a long-running process needs timers.
    config.auto_flush = matches!(cli.command, Commands::Drain { watch: true });

    let events = EventBus::new();
    let network = Arc::new(NetworkMonitor::new(!cli.offline, events.clone()));

    let mut transport = HttpTransport::new()?;
    if let Some(base) = &config.api_base {
        transport = transport.with_base_url(base.clone());
    }
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let mut store = QueueStore::init(&config.store).await?;
    let db = store.database().cloned();

    if let Some(db) = &db {
        if let Some(prefs) = load_preferences(db.pool()).await? {
            tracing::info!("Applying stored queue preferences");
            config.apply_preferences(&prefs);
        }
    }
    if config.encrypt_headers && store.is_available() {
        store = store.with_cipher(HeaderCipher::from_keychain()?);
    }

    let notifications = Arc::new(NotificationService::logging());
    notifications.attach(&events);
    let analytics = db.map(|db| Arc::new(AnalyticsService::new(db)));
    let recorder = analytics
        .as_ref()
        .map(|analytics| analytics.clone().spawn_recorder(&events));

    let queue = SyncQueue::new(store, config, Some(transport), network, events);

    match cli.command {
        Commands::Drain { watch } => {
            let report = queue.process_queue().await?;
            println!("processed {}, pending {}", report.processed, report.pending);

            if watch {
                let watcher = queue.watch_connectivity();
                tracing::info!("Watching queue, press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                watcher.abort();
                queue.cancel_scheduled_flush().await;
            }
        }
        Commands::Enqueue {
            endpoint,
            method,
            json,
        } => {
            let mut request = EnqueueRequest::new(endpoint, method);
            if let Some(json) = json {
                request = request.json(serde_json::from_str(&json)?);
            }
            let op = queue.enqueue(request).await?;
            println!("{}", op.id);
        }
        Commands::Status { days } => {
            for op in queue.store().get_all().await? {
                println!(
                    "{}  {} {}  attempts={}  next={}{}",
                    op.id,
                    op.method,
                    op.endpoint,
                    op.attempts,
                    op.next_attempt_at,
                    op.last_error
                        .map(|e| format!("  last_error={}", e))
                        .unwrap_or_default()
                );
            }
            if let Some(analytics) = &analytics {
                let summary = analytics.get_summary(days).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
    }

    // Closing the bus lets the recorder store what is left and exit.
    drop(queue);
    if let Some(recorder) = recorder {
        recorder.await?;
    }
    Ok(())
}
