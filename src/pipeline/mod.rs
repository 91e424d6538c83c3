//! Pipeline orchestration.
//!
//! Jobs flow through:
//! 1. `Ingestor` — source connectors → dedup → admission as `new`
//! 2. `Orchestrator::advance()` — score → extract → generate (+ boost)
//! 3. Approval gateway — human or automation-mode approval
//! 4. `SubmissionAgent` — browser-driven submission, tracked in the registry
//!
//! Stage order is fixed; what varies is how eagerly the orchestrator
//! self-advances, governed by the process-wide submission mode.

pub mod ingest;
pub mod orchestrator;
pub mod types;

pub use ingest::{Ingestor, ManualUrlConnector, SourceConnector};
pub use orchestrator::Orchestrator;
pub use types::{IngestReport, IngestRequest};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Per-job commit locks.
///
/// The record store is the single shared mutable resource; holding a job's
/// lock across a read-modify-commit keeps two writers from committing
/// conflicting updates for the same job. Different jobs never contend.
#[derive(Default)]
pub struct JobLocks {
    inner: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock for one job, creating it on first use.
    pub async fn acquire(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let locks = self.inner.read().await;
            locks.get(job_id).cloned()
        };
        let lock = match lock {
            Some(lock) => lock,
            None => {
                let mut locks = self.inner.write().await;
                Arc::clone(
                    locks
                        .entry(job_id.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(()))),
                )
            }
        };
        lock.lock_owned().await
    }
}
