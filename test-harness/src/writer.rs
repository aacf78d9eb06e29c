// Test harness writer: appends change rows to a feed at a configured rate.
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pgfeed::store::memory::MemoryStore;
use pgfeed::store::postgres::PostgresStore;
use pgfeed::{
    ChangefeedStore, FeedOptions, PgfeedConfig, StorageBackend, TransactionOptions,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WriteMode {
    /// Uncoordinated inserts; a sweeper assigns order later.
    Outbox,
    /// Serialized writers; order is assigned at commit.
    Blocking,
}

#[derive(Parser, Debug)]
#[command(name = "writer")]
#[command(about = "Test harness writer for pgfeed change feeds")]
struct Args {
    /// Feed id (any UUID; created on first use)
    #[arg(long, default_value = "6f1c1d9e-0000-4000-8000-000000000001")]
    feed: Uuid,

    /// Shard to write to
    #[arg(long, default_value = "0")]
    shard: i32,

    /// Write mode
    #[arg(long, value_enum, default_value = "outbox")]
    mode: WriteMode,

    /// Sweep group for outbox mode
    #[arg(long, default_value = "0")]
    group: i32,

    /// Register the feed with longpoll wakeups enabled
    #[arg(long, default_value = "false")]
    longpoll: bool,

    /// Rows per second (0 = unlimited)
    #[arg(long, default_value = "100")]
    rate: u64,

    /// Total rows to write (0 = unlimited)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Rows per blocking transaction
    #[arg(long, default_value = "10")]
    batch: u64,

    /// Approximate payload size in bytes
    #[arg(long, default_value = "256")]
    payload_size: usize,

    /// Writer ID for logging and payloads
    #[arg(long, default_value = "writer-1")]
    id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        id = %args.id,
        feed = %args.feed,
        shard = args.shard,
        mode = ?args.mode,
        rate = args.rate,
        count = args.count,
        "starting writer"
    );

    let store = build_store().await?;
    let options = match args.mode {
        WriteMode::Outbox => FeedOptions::outbox(args.group),
        WriteMode::Blocking => FeedOptions::blocking(),
    };
    let options = if args.longpoll {
        options.with_longpoll()
    } else {
        options
    };
    store.ensure_feed(args.feed, options).await?;

    let filler = "x".repeat(args.payload_size);
    let mut written = 0u64;
    let started = Instant::now();
    let mut last_report = Instant::now();

    while args.count == 0 || written < args.count {
        let result = match args.mode {
            WriteMode::Outbox => write_outbox(store.as_ref(), &args, &filler, written).await,
            WriteMode::Blocking => write_blocking(store.as_ref(), &args, &filler, written).await,
        };
        match result {
            Ok(n) => written += n,
            Err(err) => {
                error!(error = %err, "write failed, backing off");
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        }

        if args.rate > 0 {
            // Pace against the wall clock rather than sleeping a fixed
            // interval, so batches do not distort the rate.
            let target = Duration::from_secs_f64(written as f64 / args.rate as f64);
            if let Some(pause) = target.checked_sub(started.elapsed()) {
                sleep(pause).await;
            }
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            let rate = written as f64 / started.elapsed().as_secs_f64();
            info!(written, rate = format!("{rate:.0}/s"), "writer progress");
            last_report = Instant::now();
        }
    }

    info!(
        written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "writer finished"
    );
    Ok(())
}

async fn write_outbox(
    store: &dyn ChangefeedStore,
    args: &Args,
    filler: &str,
    written: u64,
) -> Result<u64> {
    store
        .insert_outbox(
            args.feed,
            args.shard,
            None,
            serde_json::json!({ "writer": args.id, "n": written, "fill": filler }),
        )
        .await?;
    Ok(1)
}

async fn write_blocking(
    store: &dyn ChangefeedStore,
    args: &Args,
    filler: &str,
    written: u64,
) -> Result<u64> {
    let mut txn = store
        .begin(args.feed, args.shard, TransactionOptions::default())
        .await?;
    let batch = args.batch.max(1);
    for offset in 0..batch {
        txn.insert_change(
            serde_json::json!({ "writer": args.id, "n": written + offset, "fill": filler }),
        )
        .await?;
    }
    txn.commit().await?;
    Ok(batch)
}

async fn build_store() -> Result<Arc<dyn ChangefeedStore>> {
    let config = PgfeedConfig::from_env_or_yaml()?;
    let store_config = config.store_config();
    let store: Arc<dyn ChangefeedStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new(store_config)),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresStore::connect(pg, store_config).await?)
        }
    };
    Ok(store)
}
