//! Approval gateway — posts generated assets for human review and routes
//! the decision back into the state machine.
//!
//! The transport (chat message, web card, email) is external; only the
//! request/decision contract lives here. Decisions are correlated by an
//! opaque reference the gateway returns, stored on the job record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::ModeController;
use crate::error::{ApprovalError, Error, JobError};
use crate::model::{JobRecord, JobStatus};
use crate::pipeline::JobLocks;
use crate::store::Database;
use crate::submit::SubmissionAgent;

/// Opaque reference correlating a posted approval request with a later
/// decision.
pub type ApprovalRef = String;

/// External approval channel.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    /// Post a job summary (title, score, asset links, proposal text) to
    /// the channel. Returns the correlation reference.
    async fn request_approval(&self, job: &JobRecord) -> Result<ApprovalRef, ApprovalError>;
}

/// What the human (or the automation mode) decided.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Approve,
    /// Replace the proposal text without changing status.
    Edit { proposal_text: String },
    Reject,
}

/// How a decision identifies its job.
#[derive(Debug, Clone)]
pub enum DecisionTarget {
    JobId(String),
    Ref(ApprovalRef),
}

/// Routes approval decisions into the state machine.
pub struct ApprovalRouter {
    store: Arc<dyn Database>,
    locks: Arc<JobLocks>,
    mode: Arc<ModeController>,
    agent: Arc<SubmissionAgent>,
}

impl ApprovalRouter {
    pub fn new(
        store: Arc<dyn Database>,
        locks: Arc<JobLocks>,
        mode: Arc<ModeController>,
        agent: Arc<SubmissionAgent>,
    ) -> Self {
        Self {
            store,
            locks,
            mode,
            agent,
        }
    }

    /// Handle a decision. Returns the job's status after routing.
    ///
    /// Decisions arriving for an already-terminal job are accepted but
    /// change nothing — they are logged as stale and swallowed.
    pub async fn on_decision(
        &self,
        target: DecisionTarget,
        decision: ApprovalDecision,
    ) -> Result<JobStatus, Error> {
        let job_id = self.resolve(&target).await?;

        let status_after = {
            let _guard = self.locks.acquire(&job_id).await;
            let mut job = self
                .store
                .get_job(&job_id)
                .await?
                .ok_or_else(|| JobError::NotFound { id: job_id.clone() })?;

            if job.status.is_terminal() {
                info!(
                    job_id = %job_id,
                    status = %job.status,
                    "Stale decision for terminal job, ignoring"
                );
                return Ok(job.status);
            }

            match decision {
                ApprovalDecision::Approve => {
                    if !job.status.can_transition_to(JobStatus::Approved) {
                        return Err(JobError::InvalidTransition {
                            id: job_id.clone(),
                            state: job.status.to_string(),
                            target: JobStatus::Approved.to_string(),
                        }
                        .into());
                    }
                    job.status = JobStatus::Approved;
                    job.approved_at = Some(Utc::now());
                    self.store.update_job(&job).await?;
                    info!(job_id = %job_id, "Job approved");
                }
                ApprovalDecision::Edit { proposal_text } => {
                    job.proposal_text = Some(proposal_text);
                    self.store.update_job(&job).await?;
                    info!(job_id = %job_id, "Proposal text edited");
                }
                ApprovalDecision::Reject => {
                    if !job.status.can_transition_to(JobStatus::Rejected) {
                        return Err(JobError::InvalidTransition {
                            id: job_id.clone(),
                            state: job.status.to_string(),
                            target: JobStatus::Rejected.to_string(),
                        }
                        .into());
                    }
                    job.status = JobStatus::Rejected;
                    self.store.update_job(&job).await?;
                    info!(job_id = %job_id, "Job rejected");
                }
            }
            job.status
        };

        // Mode is read fresh here, after the commit: an approval under
        // `automatic` flows straight into submission.
        if status_after == JobStatus::Approved && self.mode.current().auto_submits() {
            if let Err(e) = self.agent.submit(&job_id).await {
                warn!(job_id = %job_id, error = %e, "Auto-submit after approval failed");
            }
        }

        self.store
            .get_job(&job_id)
            .await?
            .map(|j| j.status)
            .ok_or_else(|| JobError::NotFound { id: job_id }.into())
    }

    async fn resolve(&self, target: &DecisionTarget) -> Result<String, Error> {
        match target {
            DecisionTarget::JobId(id) => Ok(id.clone()),
            DecisionTarget::Ref(approval_ref) => {
                let job = self
                    .store
                    .get_job_by_approval_ref(approval_ref)
                    .await?
                    .ok_or_else(|| ApprovalError::UnknownRef(approval_ref.clone()))?;
                Ok(job.job_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmissionMode;
    use crate::error::SubmitError;
    use crate::model::JobSource;
    use crate::registry::{ActiveTaskRegistry, TaskCategory, TaskHandle};
    use crate::store::LibSqlBackend;
    use crate::submit::Submitter;
    use std::time::Duration;

    struct NoopSubmitter;

    #[async_trait]
    impl Submitter for NoopSubmitter {
        async fn submit(
            &self,
            _job: &JobRecord,
            _progress: &TaskHandle,
        ) -> Result<serde_json::Value, SubmitError> {
            Ok(serde_json::json!({}))
        }
    }

    async fn setup(mode: SubmissionMode) -> (Arc<dyn Database>, ApprovalRouter) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let locks = JobLocks::new();
        let registry = ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_secs(60));
        let agent = SubmissionAgent::new(
            Arc::clone(&store),
            registry,
            Arc::new(NoopSubmitter),
            Arc::clone(&locks),
            Duration::from_secs(5),
        );
        let router = ApprovalRouter::new(
            Arc::clone(&store),
            locks,
            Arc::new(ModeController::new(mode)),
            agent,
        );
        (store, router)
    }

    async fn seed(store: &Arc<dyn Database>, id: &str, status: JobStatus) {
        let mut job = JobRecord::new(id, format!("https://example.com/jobs/~0{id}"), JobSource::Scraper);
        job.approval_ref = Some(format!("ref-{id}"));
        store.insert_job(&job).await.unwrap();
        job.status = status;
        store.update_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn approve_moves_to_approved() {
        let (store, router) = setup(SubmissionMode::Manual).await;
        seed(&store, "1", JobStatus::PendingApproval).await;

        let status = router
            .on_decision(DecisionTarget::JobId("1".into()), ApprovalDecision::Approve)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Approved);

        let job = store.get_job("1").await.unwrap().unwrap();
        assert!(job.approved_at.is_some());
    }

    #[tokio::test]
    async fn decision_resolves_by_ref() {
        let (store, router) = setup(SubmissionMode::Manual).await;
        seed(&store, "1", JobStatus::PendingApproval).await;

        let status = router
            .on_decision(
                DecisionTarget::Ref("ref-1".into()),
                ApprovalDecision::Reject,
            )
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Rejected);
    }

    #[tokio::test]
    async fn edit_keeps_status() {
        let (store, router) = setup(SubmissionMode::Manual).await;
        seed(&store, "1", JobStatus::PendingApproval).await;

        let status = router
            .on_decision(
                DecisionTarget::JobId("1".into()),
                ApprovalDecision::Edit {
                    proposal_text: "tightened pitch".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, JobStatus::PendingApproval);

        let job = store.get_job("1").await.unwrap().unwrap();
        assert_eq!(job.proposal_text.as_deref(), Some("tightened pitch"));
    }

    #[tokio::test]
    async fn stale_decision_is_noop() {
        let (store, router) = setup(SubmissionMode::Manual).await;
        seed(&store, "1", JobStatus::Rejected).await;

        let status = router
            .on_decision(DecisionTarget::JobId("1".into()), ApprovalDecision::Approve)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Rejected);
    }

    #[tokio::test]
    async fn automatic_mode_submits_after_approval() {
        let (store, router) = setup(SubmissionMode::Automatic).await;
        seed(&store, "1", JobStatus::PendingApproval).await;

        router
            .on_decision(DecisionTarget::JobId("1".into()), ApprovalDecision::Approve)
            .await
            .unwrap();

        // The noop submitter resolves quickly; the job must leave approved.
        for _ in 0..100 {
            let status = store.get_job("1").await.unwrap().unwrap().status;
            if status == JobStatus::Submitted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached submitted under automatic mode");
    }

    #[tokio::test]
    async fn unknown_ref_is_error() {
        let (_store, router) = setup(SubmissionMode::Manual).await;
        let err = router
            .on_decision(
                DecisionTarget::Ref("missing".into()),
                ApprovalDecision::Approve,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Approval(ApprovalError::UnknownRef(_))));
    }

    #[tokio::test]
    async fn approve_from_wrong_state_is_invalid_transition() {
        let (store, router) = setup(SubmissionMode::Manual).await;
        seed(&store, "1", JobStatus::Scoring).await;

        let err = router
            .on_decision(DecisionTarget::JobId("1".into()), ApprovalDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidTransition { .. })));
    }
}
