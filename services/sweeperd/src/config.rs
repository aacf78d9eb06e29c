use anyhow::{Context, Result};
use pgfeed::{SweepGroup, SweepLoopOptions};
use std::net::SocketAddr;
use std::time::Duration;

// Daemon configuration sourced from environment variables. Store-level
// settings (backend, batch size, lock timeouts) come from
// `pgfeed::PgfeedConfig` and are loaded separately.
#[derive(Debug, Clone)]
pub struct SweeperdConfig {
    pub metrics_bind: SocketAddr,
    /// Sweep groups this daemon is responsible for. Running the same
    /// group on several daemons is safe; the group lock arbitrates.
    pub groups: Vec<SweepGroup>,
    pub loop_wait_ms: u64,
    pub loop_duration_ms: u64,
    pub loop_sleep_ms: u64,
}

impl SweeperdConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("PGFEED_SWEEPERD_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9601".to_string())
            .parse()
            .with_context(|| "parse PGFEED_SWEEPERD_METRICS_BIND")?;
        let groups = parse_groups(
            &std::env::var("PGFEED_SWEEP_GROUPS").unwrap_or_else(|_| "0".to_string()),
        )?;
        let loop_wait_ms = parse_env_u64("PGFEED_SWEEP_LOOP_WAIT_MS", 1_000)?;
        let loop_duration_ms = parse_env_u64("PGFEED_SWEEP_LOOP_DURATION_MS", 1_000)?;
        let loop_sleep_ms = parse_env_u64("PGFEED_SWEEP_LOOP_SLEEP_MS", 5)?;
        Ok(Self {
            metrics_bind,
            groups,
            loop_wait_ms,
            loop_duration_ms,
            loop_sleep_ms,
        })
    }

    pub fn loop_options(&self) -> SweepLoopOptions {
        SweepLoopOptions {
            wait: Duration::from_millis(self.loop_wait_ms),
            duration: Duration::from_millis(self.loop_duration_ms),
            sleep: Duration::from_millis(self.loop_sleep_ms),
        }
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("parse {name}")),
        Err(_) => Ok(default),
    }
}

/// Comma-separated group list, e.g. `"0,1,7"`. Duplicates are
/// harmless but rejected to catch copy-paste mistakes.
fn parse_groups(raw: &str) -> Result<Vec<SweepGroup>> {
    let mut groups = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let group: SweepGroup = part
            .parse()
            .with_context(|| format!("parse sweep group {part:?}"))?;
        if groups.contains(&group) {
            anyhow::bail!("sweep group {group} listed twice");
        }
        groups.push(group);
    }
    if groups.is_empty() {
        anyhow::bail!("no sweep groups configured");
    }
    Ok(groups)
}
