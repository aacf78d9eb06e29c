// Test harness reader: follows a feed cursor and reports throughput.
use anyhow::{Context, Result};
use clap::Parser;
use pgfeed::longpoll;
use pgfeed::store::memory::MemoryStore;
use pgfeed::store::postgres::PostgresStore;
use pgfeed::{ChangefeedStore, Cursor, PgfeedConfig, StorageBackend};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "reader")]
#[command(about = "Test harness reader for pgfeed change feeds")]
struct Args {
    /// Feed id to follow
    #[arg(long, default_value = "6f1c1d9e-0000-4000-8000-000000000001")]
    feed: Uuid,

    /// Shard to follow
    #[arg(long, default_value = "0")]
    shard: i32,

    /// Rows per page
    #[arg(long, default_value = "100")]
    page_size: usize,

    /// Park on the shard's longpoll signal between empty pages instead
    /// of sleeping a fixed interval
    #[arg(long, default_value = "false")]
    longpoll: bool,

    /// Sleep between empty pages when not longpolling, in milliseconds
    #[arg(long, default_value = "250")]
    poll_interval_ms: u64,

    /// Longpoll timeout, in milliseconds
    #[arg(long, default_value = "10000")]
    longpoll_timeout_ms: u64,

    /// Stop after this many rows (0 = follow forever)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Verify that sequence numbers arrive dense and in order
    #[arg(long, default_value = "true")]
    check_order: bool,

    /// Reader ID for logging
    #[arg(long, default_value = "reader-1")]
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
        page_size = args.page_size,
        longpoll = args.longpoll,
        count = args.count,
        "starting reader"
    );

    let store = build_store().await?;
    let mut cursor = Cursor::START;
    let mut seen = 0u64;
    let mut last_sequence: Option<i64> = None;
    let started = Instant::now();
    let mut last_report = Instant::now();

    while args.count == 0 || seen < args.count {
        let page = store
            .read_feed(args.feed, args.shard, cursor, Some(args.page_size))
            .await?;
        if page.events.is_empty() {
            if args.longpoll {
                // An empty page means the reader is caught up, so the
                // shard's current counter is the "seen" watermark.
                let watermark = match last_sequence {
                    Some(sequence) => sequence,
                    None => store.last_sequence_number(args.feed, args.shard).await?,
                };
                let timeout = Duration::from_millis(args.longpoll_timeout_ms);
                longpoll(store.as_ref(), args.feed, args.shard, timeout, watermark).await?;
            } else {
                sleep(Duration::from_millis(args.poll_interval_ms)).await;
            }
            continue;
        }

        for event in &page.events {
            if args.check_order {
                if let (Some(prev), Some(next)) = (last_sequence, event.sequence_number) {
                    if next != prev + 1 {
                        warn!(
                            prev,
                            next,
                            change_id = event.change_id,
                            "sequence gap or reorder observed"
                        );
                    }
                }
            }
            last_sequence = event.sequence_number.or(last_sequence);
            seen += 1;
        }
        cursor = page.next_cursor;

        if last_report.elapsed() >= Duration::from_secs(5) {
            let rate = seen as f64 / started.elapsed().as_secs_f64();
            info!(seen, rate = format!("{rate:.0}/s"), "reader progress");
            last_report = Instant::now();
        }
    }

    info!(
        seen,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "reader finished"
    );
    Ok(())
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
