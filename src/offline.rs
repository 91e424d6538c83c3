//! Offline provider stand-ins.
//!
//! Real scoring, extraction, asset generation, approval transport, and
//! browser submission are external integrations. Until they are wired in,
//! the binary runs with these: deterministic executors, a logging
//! approval gateway, and a dry-run submitter. Nothing here leaves the
//! process.

use async_trait::async_trait;
use uuid::Uuid;

use crate::approval::{ApprovalGateway, ApprovalRef};
use crate::error::{ApprovalError, StageError, SubmitError};
use crate::model::JobRecord;
use crate::registry::TaskHandle;
use crate::stage::{Stage, StageExecutor, StageUpdate};
use crate::submit::Submitter;

/// Passes every job through with a full score, the same behavior the
/// pipeline falls back to when no scoring provider is configured.
pub struct PassThroughScorer;

#[async_trait]
impl StageExecutor for PassThroughScorer {
    fn stage(&self) -> Stage {
        Stage::Score
    }

    async fn run(&self, _job: &JobRecord) -> Result<StageUpdate, StageError> {
        Ok(StageUpdate {
            fit_score: Some(100),
            fit_reasoning: Some("scoring provider not configured; passed through".into()),
            ..Default::default()
        })
    }
}

/// Keeps whatever the connector scraped; deep extraction needs a browser
/// integration.
pub struct NoopExtractor;

#[async_trait]
impl StageExecutor for NoopExtractor {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn run(&self, _job: &JobRecord) -> Result<StageUpdate, StageError> {
        Ok(StageUpdate {
            notes: vec!["deep extraction skipped: no extractor configured".into()],
            ..Default::default()
        })
    }
}

/// Fills a plain-text proposal from the posting fields. Document, PDF,
/// and video rendering need their providers.
pub struct TemplateGenerator;

#[async_trait]
impl StageExecutor for TemplateGenerator {
    fn stage(&self) -> Stage {
        Stage::Generate
    }

    async fn run(&self, job: &JobRecord) -> Result<StageUpdate, StageError> {
        let title = job.title.as_deref().unwrap_or("your posting");
        let proposal = format!(
            "Hi — I read \"{title}\" and I'd like to help.\n\n\
             Here's how I'd approach it: start with a short discovery call, \
             agree on a first milestone, and ship something reviewable within \
             the first week.\n\nHappy to share relevant work samples."
        );
        Ok(StageUpdate {
            proposal_text: Some(proposal.clone()),
            cover_letter: Some(proposal),
            ..Default::default()
        })
    }
}

/// Minimum client spend before boosting is worth paying for.
const BOOST_SPEND_FLOOR: f64 = 10_000.0;

/// Boosts only for clients with meaningful spend history.
pub struct SpendFloorBooster;

#[async_trait]
impl StageExecutor for SpendFloorBooster {
    fn stage(&self) -> Stage {
        Stage::DecideBoost
    }

    async fn run(&self, job: &JobRecord) -> Result<StageUpdate, StageError> {
        let spent = job.client_spent.unwrap_or(0.0);
        let boost = spent > BOOST_SPEND_FLOOR;
        Ok(StageUpdate {
            boost_decision: Some(boost),
            boost_reasoning: Some(if boost {
                format!("client spend ${spent:.0} clears the floor")
            } else {
                format!("client spend ${spent:.0} below boost floor")
            }),
            ..Default::default()
        })
    }
}

/// Logs the approval request instead of posting to a channel. Decisions
/// still arrive through the control-plane API.
pub struct LogGateway;

#[async_trait]
impl ApprovalGateway for LogGateway {
    async fn request_approval(&self, job: &JobRecord) -> Result<ApprovalRef, ApprovalError> {
        let approval_ref = Uuid::new_v4().to_string();
        tracing::info!(
            job_id = %job.job_id,
            title = job.title.as_deref().unwrap_or("untitled"),
            fit_score = job.fit_score,
            approval_ref = %approval_ref,
            "Approval requested (no gateway configured — use the API to decide)"
        );
        Ok(approval_ref)
    }
}

/// Walks the submission steps without driving a browser.
pub struct DryRunSubmitter;

#[async_trait]
impl Submitter for DryRunSubmitter {
    async fn submit(
        &self,
        job: &JobRecord,
        progress: &TaskHandle,
    ) -> Result<serde_json::Value, SubmitError> {
        progress.append_log(format!("dry run: would open {}", job.url)).await;
        if let Some(price) = job.pricing_proposed {
            progress
                .append_log(format!("dry run: would propose ${price:.0}"))
                .await;
        }
        if job.boost_decision == Some(true) {
            progress.append_log("dry run: would apply boost").await;
        }
        progress.append_log("dry run: would submit proposal").await;
        Ok(serde_json::json!({ "dry_run": true, "job_id": job.job_id }))
    }
}
