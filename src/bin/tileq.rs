//! tileq: operator CLI for a tile queue.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tilequeue_rs::config::Config;
use tilequeue_rs::config::secrets::{ExposeSecret, redact_url};
use tilequeue_rs::telemetry::{TelemetryConfig, init_telemetry};
use tilequeue_rs::{
    OnEmpty, PgmqBackend, QueueStore, StopWhenEmpty, TileCoord, WorkItem, codec,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tileq", about = "Feed and drain tile queues")]
struct Cli {
    /// TOML file overriding queue settings from the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue (idempotent)
    Create,
    /// Show queue attributes
    Status,
    /// Enqueue tiles or raw payloads
    Send {
        /// Tile coordinates (z/x/y or z/x/y:+n/+n) or JSON objects
        #[arg(required = true)]
        items: Vec<String>,
        /// Send each item on its own instead of batching
        #[arg(long)]
        single: bool,
    },
    /// List queued items, deleting each once printed
    Drain {
        /// Leave items in flight instead of deleting them; stops at the
        /// first empty round
        #[arg(long)]
        keep: bool,
        /// Stop after this many items
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(ref path) = cli.config {
        config = config.with_overrides_file(path)?;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "tileq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    info!(database = %redact_url(&config.database_url), queue = %config.queue, "connecting");
    let backend =
        PgmqBackend::connect(config.database_url.expose_secret(), config.pgmq_options()).await?;
    backend.migrate().await?;
    backend.create_queue().await?;

    let store = QueueStore::new(backend).with_batch_size(config.batch_size);

    match cli.command {
        Command::Create => {
            println!("Queue {} ready.", config.queue);
            Ok(())
        }
        Command::Status => cmd_status(&store).await,
        Command::Send { items, single } => cmd_send(&store, items, single).await,
        Command::Drain { keep: true, limit } => {
            cmd_drain(&store.with_on_empty(StopWhenEmpty), true, limit).await
        }
        Command::Drain { keep: false, limit } => cmd_drain(&store, false, limit).await,
    }
}

async fn cmd_status(store: &QueueStore<PgmqBackend>) -> anyhow::Result<()> {
    let status = store.get_status().await?;
    print!("{status}");
    Ok(())
}

/// Parse one CLI argument as a tile coordinate, falling back to a JSON payload.
fn parse_item(raw: &str) -> anyhow::Result<WorkItem> {
    if let Ok(coord) = raw.parse::<TileCoord>() {
        return Ok(WorkItem::for_tile(coord));
    }
    let payload = codec::decode_message(raw)
        .map_err(|e| anyhow::anyhow!("{raw:?} is neither a tile coordinate nor a JSON object: {e}"))?;
    Ok(WorkItem::new(payload))
}

async fn cmd_send(
    store: &QueueStore<PgmqBackend>,
    raw: Vec<String>,
    single: bool,
) -> anyhow::Result<()> {
    let items = raw
        .iter()
        .map(|r| parse_item(r))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let sent = if single {
        let mut sent = Vec::with_capacity(items.len());
        for item in items {
            sent.push(store.put_one(item).await);
        }
        sent
    } else {
        store.put(items).collect().await
    };

    let failed = sent.iter().filter(|item| item.is_failed()).count();
    for (raw, item) in raw.iter().zip(&sent) {
        if let Some(ref err) = item.error {
            println!("FAILED  {raw}: {err}");
        }
    }
    println!("{} sent, {failed} failed", sent.len() - failed);

    if failed > 0 {
        anyhow::bail!("{failed} item(s) could not be queued");
    }
    Ok(())
}

async fn cmd_drain<H: OnEmpty<PgmqBackend>>(
    store: &QueueStore<PgmqBackend, H>,
    keep: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut listing = store.list();
    let mut count = 0usize;

    while limit.is_none_or(|limit| count < limit) {
        let Some(item) = listing.next().await? else {
            break;
        };
        match item.tile_coord() {
            Some(Ok(coord)) => println!("{coord}"),
            _ => println!("{}", serde_json::Value::Object(item.payload.clone())),
        }
        if !keep {
            store.delete_one(item).await?;
        }
        count += 1;
    }

    println!("\n{count} item(s)");
    Ok(())
}
