//! Sweeper daemon entry point.
//!
//! # Purpose
//! Wires configuration, the store backend, and metrics, then runs one
//! sweep worker per configured group until shutdown. Each worker
//! alternates full sweep passes with a backoff on failure; losing the
//! group lock to another daemon is an idle pass, not an error.
//!
//! # Notes
//! The `build_store` helper keeps wiring testable and minimizes main
//! setup logic.
mod config;
mod observability;

use anyhow::Context;
use pgfeed::store::memory::MemoryStore;
use pgfeed::store::postgres::PostgresStore;
use pgfeed::{sweep_loop, ChangefeedStore, PgfeedConfig, StorageBackend, SweepGroup};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::SweeperdConfig::from_env().expect("sweeperd config");
    let feed_config = PgfeedConfig::from_env_or_yaml().expect("pgfeed config");
    run_with_shutdown(config, feed_config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(
    config: config::SweeperdConfig,
    feed_config: PgfeedConfig,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability();
    let store = build_store(&feed_config).await?;
    tracing::info!(
        backend = store.backend_name(),
        groups = ?config.groups,
        "sweeperd starting"
    );
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let mut workers = Vec::new();
    for group in config.groups.clone() {
        let store = Arc::clone(&store);
        let options = config.loop_options();
        workers.push(tokio::spawn(async move {
            run_group(store, group, options).await;
        }));
    }

    shutdown.await;
    tracing::info!("sweeperd shutting down");

    for task in &workers {
        task.abort();
    }
    metrics_task.abort();
    for task in workers {
        let _ = task.await;
    }
    let _ = metrics_task.await;
    Ok(())
}

async fn run_group(
    store: Arc<dyn ChangefeedStore>,
    group: SweepGroup,
    options: pgfeed::SweepLoopOptions,
) {
    loop {
        match sweep_loop(store.as_ref(), group, options).await {
            Ok(totals) => {
                if totals.changes_assigned > 0 {
                    tracing::debug!(
                        group,
                        assigned = totals.changes_assigned,
                        races = totals.races_detected,
                        lag_ms = totals.max_lag_milliseconds,
                        "sweep pass finished"
                    );
                }
            }
            Err(err) => {
                tracing::error!(group, error = %err, "sweep pass failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn build_store(config: &PgfeedConfig) -> anyhow::Result<Arc<dyn ChangefeedStore>> {
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
