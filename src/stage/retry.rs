//! Bounded exponential backoff for transient stage failures.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetrySchedule;
use crate::error::StageError;
use crate::model::JobRecord;
use crate::stage::{StageExecutor, StageUpdate};

/// Run an executor, retrying transient failures per the schedule.
///
/// Unrecoverable errors return immediately. A transient error on the last
/// attempt is escalated to unrecoverable so the caller sees a hard error,
/// never a retriable one.
pub async fn run_with_backoff(
    executor: &dyn StageExecutor,
    job: &JobRecord,
    schedule: &RetrySchedule,
) -> Result<StageUpdate, StageError> {
    let attempts = schedule.attempts.max(1);

    for attempt in 1..=attempts {
        match executor.run(job).await {
            Ok(update) => return Ok(update),
            Err(err @ StageError::Unrecoverable { .. }) => return Err(err),
            Err(StageError::Transient { stage, reason }) => {
                if attempt == attempts {
                    return Err(StageError::Unrecoverable {
                        stage,
                        reason: format!("gave up after {attempts} attempts: {reason}"),
                    });
                }
                let delay = delay_for_attempt(schedule, attempt);
                warn!(
                    job_id = %job.job_id,
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient stage failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("retry loop always returns");
}

/// Exponential delay with jitter: base * 2^(attempt-1), capped, plus up to
/// half of itself again so concurrent retries spread out.
fn delay_for_attempt(schedule: &RetrySchedule, attempt: u32) -> Duration {
    let exp = schedule
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(schedule.max_delay);
    let jitter_ms = if capped.as_millis() > 0 {
        rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 2))
    } else {
        0
    };
    capped + Duration::from_millis(jitter_ms)
}
