//! Scheduled pipeline ticks.
//!
//! When a cron schedule is configured, the orchestrator self-advances on
//! that cadence instead of waiting for operator triggers.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::pipeline::Orchestrator;

/// Parse a cron expression and compute the next fire time from now.
pub fn next_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, ConfigError> {
    let parsed = cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidSchedule {
        schedule: schedule.to_string(),
        message: e.to_string(),
    })?;
    Ok(parsed.upcoming(Utc).next())
}

/// Spawn the auto-process ticker. Each fire runs one `auto_process` pass;
/// a pass that fails is logged and the ticker keeps going.
pub fn spawn_auto_process_ticker(
    orchestrator: Arc<Orchestrator>,
    schedule: String,
) -> Result<JoinHandle<()>, ConfigError> {
    let parsed = cron::Schedule::from_str(&schedule).map_err(|e| ConfigError::InvalidSchedule {
        schedule: schedule.clone(),
        message: e.to_string(),
    })?;

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = parsed.upcoming(Utc).next() else {
                info!(schedule = %schedule, "Schedule exhausted, ticker stopping");
                break;
            };
            let delay = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;

            match orchestrator.auto_process().await {
                Ok(count) => info!(jobs = count, "Scheduled auto-process pass complete"),
                Err(e) => warn!(error = %e, "Scheduled auto-process pass failed"),
            }
        }
    }))
}
