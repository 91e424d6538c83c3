//! Configuration types.

use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How much of the approval/submission path proceeds without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Every approval and every submit needs an explicit call.
    Manual,
    /// Auto-approve once assets are ready; submit stays explicit.
    SemiAuto,
    /// Approve and submit without intervention.
    Automatic,
}

impl SubmissionMode {
    /// Whether `pending_approval` advances without an external call.
    pub fn auto_approves(&self) -> bool {
        matches!(self, Self::SemiAuto | Self::Automatic)
    }

    /// Whether `approved` advances to `submitting` without an external call.
    pub fn auto_submits(&self) -> bool {
        matches!(self, Self::Automatic)
    }
}

impl std::fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::SemiAuto => "semi_auto",
            Self::Automatic => "automatic",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SubmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "semi_auto" => Ok(Self::SemiAuto),
            "automatic" => Ok(Self::Automatic),
            other => Err(format!("unknown submission mode '{other}'")),
        }
    }
}

/// Process-wide automation mode, versioned.
///
/// The orchestrator reads this at every decision point rather than caching
/// it per job, so a mode change applies to the next decision on any job
/// without touching in-flight tasks.
pub struct ModeController {
    inner: RwLock<(SubmissionMode, u64)>,
}

impl ModeController {
    pub fn new(mode: SubmissionMode) -> Self {
        Self {
            inner: RwLock::new((mode, 0)),
        }
    }

    /// Current mode.
    pub fn current(&self) -> SubmissionMode {
        self.inner.read().map(|g| g.0).unwrap_or(SubmissionMode::Manual)
    }

    /// Current (mode, version) pair.
    pub fn current_versioned(&self) -> (SubmissionMode, u64) {
        self.inner
            .read()
            .map(|g| *g)
            .unwrap_or((SubmissionMode::Manual, 0))
    }

    /// Set the mode; returns the new version. A no-op set still bumps the
    /// version so callers can observe the write.
    pub fn set(&self, mode: SubmissionMode) -> u64 {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.0 = mode;
        guard.1 += 1;
        tracing::info!(mode = %mode, version = guard.1, "Submission mode updated");
        guard.1
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new(SubmissionMode::Manual)
    }
}

/// Bounded exponential backoff schedule for transient stage errors.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Pipeline configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum fit score (0-100) a job must reach to pass scoring.
    pub min_score: i64,
    /// Max jobs orchestrated concurrently per batch.
    pub worker_pool: usize,
    /// Hard wall-clock timeout for one submission attempt.
    pub submit_timeout: Duration,
    /// Hard wall-clock timeout for asset generation.
    pub generation_timeout: Duration,
    /// How long terminal registry entries stay visible to pollers.
    pub task_retention: Duration,
    /// Backoff schedule for transient stage errors.
    pub retry: RetrySchedule,
    /// Cron expression for the periodic auto-process tick, if any.
    pub auto_run_schedule: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_score: 70,
            worker_pool: 3,
            submit_timeout: Duration::from_secs(300),
            generation_timeout: Duration::from_secs(900),
            task_retention: Duration::from_secs(3600),
            retry: RetrySchedule::default(),
            auto_run_schedule: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

impl PipelineConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let auto_run_schedule = std::env::var("GIGFLOW_AUTO_RUN_CRON").ok();
        if let Some(ref schedule) = auto_run_schedule {
            cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidSchedule {
                schedule: schedule.clone(),
                message: e.to_string(),
            })?;
        }

        Ok(Self {
            min_score: env_parse("GIGFLOW_MIN_SCORE", defaults.min_score)?,
            worker_pool: env_parse("GIGFLOW_WORKER_POOL", defaults.worker_pool)?,
            submit_timeout: Duration::from_secs(env_parse(
                "GIGFLOW_SUBMIT_TIMEOUT_SECS",
                defaults.submit_timeout.as_secs(),
            )?),
            generation_timeout: Duration::from_secs(env_parse(
                "GIGFLOW_GENERATION_TIMEOUT_SECS",
                defaults.generation_timeout.as_secs(),
            )?),
            task_retention: Duration::from_secs(env_parse(
                "GIGFLOW_TASK_RETENTION_SECS",
                defaults.task_retention.as_secs(),
            )?),
            retry: RetrySchedule {
                attempts: env_parse("GIGFLOW_RETRY_ATTEMPTS", defaults.retry.attempts)?,
                base_delay: Duration::from_secs(env_parse(
                    "GIGFLOW_RETRY_BASE_SECS",
                    defaults.retry.base_delay.as_secs(),
                )?),
                max_delay: defaults.retry.max_delay,
            },
            auto_run_schedule,
        })
    }
}
