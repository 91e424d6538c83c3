//! Submission agent — drives the externally-visible application submission.
//!
//! The actual browser automation lives behind the `Submitter` trait. The
//! agent owns everything around it: the registry entry (at most one
//! in-flight submission per job), the hard wall-clock timeout, and the
//! terminal commit to the record store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use crate::error::{Error, JobError, RegistryError, SubmitError};
use crate::model::{JobRecord, JobStatus};
use crate::pipeline::JobLocks;
use crate::registry::{ActiveTaskRegistry, TaskHandle};
use crate::store::Database;

/// External browser-automation driver. Appends progress through the task
/// handle and returns a structured receipt on success.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(
        &self,
        job: &JobRecord,
        progress: &TaskHandle,
    ) -> Result<serde_json::Value, SubmitError>;
}

/// Drives submissions as detached background tasks.
pub struct SubmissionAgent {
    store: Arc<dyn Database>,
    registry: Arc<ActiveTaskRegistry>,
    submitter: Arc<dyn Submitter>,
    locks: Arc<JobLocks>,
    timeout: Duration,
}

impl SubmissionAgent {
    pub fn new(
        store: Arc<dyn Database>,
        registry: Arc<ActiveTaskRegistry>,
        submitter: Arc<dyn Submitter>,
        locks: Arc<JobLocks>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            submitter,
            locks,
            timeout,
        })
    }

    /// Registry for this agent's submission tasks (for polling consumers).
    pub fn registry(&self) -> &Arc<ActiveTaskRegistry> {
        &self.registry
    }

    /// Begin submitting a job. Returns once the background task is
    /// dispatched and `submitting` is committed; callers poll the registry
    /// for progress.
    ///
    /// Rejected synchronously if the job is not in a submittable status or
    /// a submission is already in flight.
    pub async fn submit(self: &Arc<Self>, job_id: &str) -> Result<(), Error> {
        let (job, handle) = {
            let _guard = self.locks.acquire(job_id).await;

            let mut job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| JobError::NotFound {
                    id: job_id.to_string(),
                })?;

            if !matches!(
                job.status,
                JobStatus::Approved | JobStatus::SubmissionFailed
            ) {
                return Err(SubmitError::NotSubmittable {
                    job_id: job_id.to_string(),
                    status: job.status.to_string(),
                }
                .into());
            }

            // Registry begin before the status commit: a conflict must
            // reject without touching the record.
            let handle = match self.registry.begin(job_id).await {
                Ok(handle) => handle,
                Err(RegistryError::AlreadyActive { .. }) => {
                    return Err(SubmitError::AlreadyInFlight {
                        job_id: job_id.to_string(),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            };

            job.status = JobStatus::Submitting;
            if let Err(e) = self.store.update_job(&job).await {
                handle.fail(format!("failed to commit submitting: {e}")).await;
                return Err(e.into());
            }
            (job, handle)
        };

        info!(job_id = job_id, "Submission dispatched");
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.drive(job, handle).await;
        });

        Ok(())
    }

    /// Run the driver under the timeout and commit the terminal outcome.
    async fn drive(self: Arc<Self>, job: JobRecord, handle: TaskHandle) {
        let job_id = job.job_id.clone();
        handle.set_stage("submitting").await;

        let outcome = tokio::time::timeout(self.timeout, async {
            self.submitter.submit(&job, &handle).await
        })
        .await;

        let _guard = self.locks.acquire(&job_id).await;
        let mut job = match self.store.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                handle.fail("job record disappeared during submission").await;
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to reload job after submission");
                handle.fail(e.to_string()).await;
                return;
            }
        };

        match outcome {
            Ok(Ok(receipt)) => {
                handle.complete(receipt).await;
                job.status = JobStatus::Submitted;
                job.submitted_at = Some(Utc::now());
                info!(job_id = %job_id, "Submission succeeded");
            }
            Ok(Err(e)) => {
                handle.fail(e.to_string()).await;
                job.status = JobStatus::SubmissionFailed;
                job.log_error(format!("Submission failed: {e}"));
            }
            Err(_elapsed) => {
                let e = SubmitError::Timeout {
                    timeout: self.timeout,
                };
                handle.fail(e.to_string()).await;
                job.status = JobStatus::SubmissionFailed;
                job.log_error(format!("Submission failed: {e}"));
            }
        }

        if let Err(e) = self.store.update_job(&job).await {
            error!(job_id = %job_id, error = %e, "Failed to commit submission outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobSource;
    use crate::registry::{TaskCategory, TaskState};
    use crate::store::LibSqlBackend;

    /// Scripted driver: optional delay, then a fixed outcome.
    struct ScriptedSubmitter {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(
            &self,
            job: &JobRecord,
            progress: &TaskHandle,
        ) -> Result<serde_json::Value, SubmitError> {
            progress.append_log("navigated to apply page").await;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(SubmitError::Driver("apply button missing".into()))
            } else {
                progress.append_log("proposal submitted").await;
                Ok(serde_json::json!({"job_id": job.job_id, "confirmation": "ok"}))
            }
        }
    }

    async fn setup(
        delay: Duration,
        fail: bool,
        timeout: Duration,
    ) -> (Arc<dyn Database>, Arc<SubmissionAgent>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_secs(60));
        let agent = SubmissionAgent::new(
            Arc::clone(&store),
            registry,
            Arc::new(ScriptedSubmitter { delay, fail }),
            JobLocks::new(),
            timeout,
        );
        (store, agent)
    }

    async fn seed_job(store: &Arc<dyn Database>, id: &str, status: JobStatus) {
        let mut job = JobRecord::new(id, format!("https://example.com/jobs/~0{id}"), JobSource::Scraper);
        store.insert_job(&job).await.unwrap();
        job.status = status;
        store.update_job(&job).await.unwrap();
    }

    async fn wait_for_terminal(store: &Arc<dyn Database>, id: &str) -> JobStatus {
        for _ in 0..100 {
            let job = store.get_job(id).await.unwrap().unwrap();
            if job.status != JobStatus::Submitting {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never left submitting");
    }

    #[tokio::test]
    async fn successful_submission_commits_submitted() {
        let (store, agent) =
            setup(Duration::from_millis(5), false, Duration::from_secs(5)).await;
        seed_job(&store, "1", JobStatus::Approved).await;

        agent.submit("1").await.unwrap();
        assert_eq!(
            store.get_job("1").await.unwrap().unwrap().status,
            JobStatus::Submitting
        );

        assert_eq!(wait_for_terminal(&store, "1").await, JobStatus::Submitted);
        let job = store.get_job("1").await.unwrap().unwrap();
        assert!(job.submitted_at.is_some());

        let task = agent.registry().get("1").await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.log.iter().any(|l| l.contains("proposal submitted")));
    }

    #[tokio::test]
    async fn driver_failure_commits_submission_failed() {
        let (store, agent) =
            setup(Duration::from_millis(5), true, Duration::from_secs(5)).await;
        seed_job(&store, "1", JobStatus::Approved).await;

        agent.submit("1").await.unwrap();
        assert_eq!(
            wait_for_terminal(&store, "1").await,
            JobStatus::SubmissionFailed
        );

        let job = store.get_job("1").await.unwrap().unwrap();
        assert!(job.error_log.iter().any(|l| l.contains("apply button")));
        let task = agent.registry().get("1").await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn timeout_is_failure_not_pending_forever() {
        let (store, agent) =
            setup(Duration::from_secs(60), false, Duration::from_millis(20)).await;
        seed_job(&store, "1", JobStatus::Approved).await;

        agent.submit("1").await.unwrap();
        assert_eq!(
            wait_for_terminal(&store, "1").await,
            JobStatus::SubmissionFailed
        );
        let task = agent.registry().get("1").await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn concurrent_submission_rejected() {
        let (store, agent) =
            setup(Duration::from_millis(200), false, Duration::from_secs(5)).await;
        seed_job(&store, "1", JobStatus::Approved).await;

        agent.submit("1").await.unwrap();
        // The job is now `submitting`, which the status gate rejects before
        // the registry is even consulted.
        let err = agent.submit("1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Submit(SubmitError::NotSubmittable { .. })
        ));
    }

    #[tokio::test]
    async fn retry_after_failure_makes_one_new_entry() {
        let (store, agent) =
            setup(Duration::from_millis(5), true, Duration::from_secs(5)).await;
        seed_job(&store, "1", JobStatus::Approved).await;

        agent.submit("1").await.unwrap();
        assert_eq!(
            wait_for_terminal(&store, "1").await,
            JobStatus::SubmissionFailed
        );

        agent.submit("1").await.unwrap();
        assert_eq!(agent.registry().snapshot().await.len(), 1);
        assert_eq!(
            wait_for_terminal(&store, "1").await,
            JobStatus::SubmissionFailed
        );
    }

    #[tokio::test]
    async fn unapproved_job_not_submittable() {
        let (store, agent) =
            setup(Duration::from_millis(5), false, Duration::from_secs(5)).await;
        seed_job(&store, "1", JobStatus::PendingApproval).await;

        let err = agent.submit("1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Submit(SubmitError::NotSubmittable { .. })
        ));
    }
}
