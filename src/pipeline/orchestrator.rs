//! Pipeline orchestrator — the state machine driver.
//!
//! Given a job and the current automation mode, decides the next stage,
//! invokes it, and commits the outcome. Each transition lands in the
//! record store atomically with the stage's output payload; a stage is
//! never considered complete until that commit succeeds, so a crash
//! between execution and commit is safe to retry.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{error, info, warn};

use crate::approval::ApprovalGateway;
use crate::config::{ModeController, PipelineConfig};
use crate::error::{Error, JobError, StageError};
use crate::model::{JobRecord, JobStatus};
use crate::pipeline::ingest::Ingestor;
use crate::pipeline::types::{IngestReport, IngestRequest};
use crate::pipeline::JobLocks;
use crate::registry::{ActiveTaskRegistry, TaskHandle};
use crate::stage::retry::run_with_backoff;
use crate::stage::{StageSet, StageUpdate};
use crate::store::Database;
use crate::submit::SubmissionAgent;

pub struct Orchestrator {
    store: Arc<dyn Database>,
    stages: StageSet,
    gateway: Arc<dyn ApprovalGateway>,
    agent: Arc<SubmissionAgent>,
    gen_registry: Arc<ActiveTaskRegistry>,
    mode: Arc<ModeController>,
    locks: Arc<JobLocks>,
    ingestor: Ingestor,
    config: PipelineConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Database>,
        stages: StageSet,
        gateway: Arc<dyn ApprovalGateway>,
        agent: Arc<SubmissionAgent>,
        gen_registry: Arc<ActiveTaskRegistry>,
        mode: Arc<ModeController>,
        locks: Arc<JobLocks>,
        ingestor: Ingestor,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            stages,
            gateway,
            agent,
            gen_registry,
            mode,
            locks,
            ingestor,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn mode(&self) -> &Arc<ModeController> {
        &self.mode
    }

    pub fn agent(&self) -> &Arc<SubmissionAgent> {
        &self.agent
    }

    pub fn gen_registry(&self) -> &Arc<ActiveTaskRegistry> {
        &self.gen_registry
    }

    // ── Entry points ────────────────────────────────────────────────

    /// Trigger one ingestion run; optionally drive the admitted jobs
    /// through the pipeline in the background.
    pub async fn trigger_ingestion(
        self: &Arc<Self>,
        request: IngestRequest,
    ) -> Result<IngestReport, Error> {
        let report = self.ingestor.ingest(&request).await?;

        if request.run_full_pipeline && !report.admitted_ids.is_empty() {
            let orchestrator = Arc::clone(self);
            let ids = report.admitted_ids.clone();
            let min_score = request.min_score;
            tokio::spawn(async move {
                orchestrator.process_jobs(ids, min_score).await;
            });
        }
        Ok(report)
    }

    /// Orchestrate a specific set of jobs, bounded by the worker pool.
    ///
    /// Jobs are independent; a failure in one is committed to that job's
    /// record and never aborts the batch.
    pub async fn process_jobs(self: &Arc<Self>, job_ids: Vec<String>, min_score: Option<i64>) {
        let pool = self.config.worker_pool.max(1);
        info!(jobs = job_ids.len(), pool, "Processing batch");

        futures::stream::iter(job_ids)
            .for_each_concurrent(pool, |job_id| {
                let orchestrator = Arc::clone(self);
                async move {
                    if let Err(e) = orchestrator.advance(&job_id, min_score).await {
                        error!(job_id = %job_id, error = %e, "Job advance failed");
                    }
                }
            })
            .await;
    }

    /// Advance every job currently eligible under the active mode, now.
    pub async fn auto_process(self: &Arc<Self>) -> Result<usize, Error> {
        let mode = self.mode.current();
        let mut eligible = vec![
            JobStatus::New,
            JobStatus::Scoring,
            JobStatus::Extracting,
            JobStatus::Generating,
        ];
        if mode.auto_approves() {
            eligible.push(JobStatus::PendingApproval);
        }
        if mode.auto_submits() {
            eligible.push(JobStatus::Approved);
        }

        let jobs = self.store.list_jobs_in_statuses(&eligible).await?;
        let count = jobs.len();
        let ids = jobs.into_iter().map(|j| j.job_id).collect();
        self.process_jobs(ids, None).await;
        Ok(count)
    }

    /// Drive one job as far as the state machine and mode allow.
    ///
    /// Returns the last status this call observed. Long-running stages
    /// (generation, submission) detach; their continuation re-enters the
    /// state machine from the background task.
    pub async fn advance(
        self: &Arc<Self>,
        job_id: &str,
        min_score: Option<i64>,
    ) -> Result<JobStatus, Error> {
        let threshold = min_score.unwrap_or(self.config.min_score);

        loop {
            let job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| JobError::NotFound {
                    id: job_id.to_string(),
                })?;

            // Mode is re-read on every decision, never cached per job.
            let mode = self.mode.current();

            match job.status {
                JobStatus::New => {
                    // A lost race just means another worker admitted it to
                    // scoring first; the re-read below picks that up.
                    self.try_transition(job_id, JobStatus::Scoring, StageUpdate::default())
                        .await?;
                }
                JobStatus::Scoring => {
                    let status = self.run_scoring(&job, threshold).await?;
                    if status != JobStatus::Extracting {
                        return Ok(status);
                    }
                }
                JobStatus::Extracting => {
                    let status = self.run_extraction(&job).await?;
                    if status != JobStatus::Generating {
                        return Ok(status);
                    }
                }
                JobStatus::Generating => {
                    self.dispatch_generation(job).await;
                    return Ok(JobStatus::Generating);
                }
                JobStatus::PendingApproval => {
                    if !mode.auto_approves() {
                        return Ok(job.status);
                    }
                    // An operator decision may have landed first.
                    if let Err(e) = self.approve(job_id).await {
                        if !matches!(e, Error::Job(JobError::InvalidTransition { .. })) {
                            return Err(e);
                        }
                    }
                }
                JobStatus::Approved => {
                    if mode.auto_submits() {
                        match self.agent.submit(job_id).await {
                            Ok(()) => return Ok(JobStatus::Submitting),
                            // A concurrent submit beat us to it.
                            Err(Error::Submit(_)) => return self.current_status(job_id).await,
                            Err(e) => return Err(e),
                        }
                    }
                    return Ok(job.status);
                }
                // Submission outcomes are owned by the agent; retries are
                // explicit operator actions. Everything else is terminal.
                status => return Ok(status),
            }
        }
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn run_scoring(&self, job: &JobRecord, threshold: i64) -> Result<JobStatus, Error> {
        match run_with_backoff(self.stages.scorer.as_ref(), job, &self.config.retry).await {
            Ok(update) => {
                let score = update.fit_score.unwrap_or(0);
                let to = if score >= threshold {
                    JobStatus::Extracting
                } else {
                    info!(job_id = %job.job_id, score, threshold, "Job filtered out");
                    JobStatus::FilteredOut
                };
                match self.try_transition(&job.job_id, to, update).await? {
                    Some(_) => Ok(to),
                    None => self.current_status(&job.job_id).await,
                }
            }
            Err(e) => {
                self.commit_stage_error(&job.job_id, &e).await?;
                Ok(JobStatus::Error)
            }
        }
    }

    async fn run_extraction(&self, job: &JobRecord) -> Result<JobStatus, Error> {
        match run_with_backoff(self.stages.extractor.as_ref(), job, &self.config.retry).await {
            Ok(update) => {
                match self
                    .try_transition(&job.job_id, JobStatus::Generating, update)
                    .await?
                {
                    Some(_) => Ok(JobStatus::Generating),
                    None => self.current_status(&job.job_id).await,
                }
            }
            Err(e) => {
                self.commit_stage_error(&job.job_id, &e).await?;
                Ok(JobStatus::Error)
            }
        }
    }

    async fn current_status(&self, job_id: &str) -> Result<JobStatus, Error> {
        self.store
            .get_job(job_id)
            .await?
            .map(|j| j.status)
            .ok_or_else(|| {
                JobError::NotFound {
                    id: job_id.to_string(),
                }
                .into()
            })
    }

    /// Spawn asset generation as a detached background task tracked in
    /// the registry. A live entry for this job means another worker is
    /// already on it, in which case this is a no-op.
    async fn dispatch_generation(self: &Arc<Self>, job: JobRecord) {
        let handle = match self.gen_registry.begin(&job.job_id).await {
            Ok(handle) => handle,
            Err(_) => return,
        };

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.job_id.clone();
            handle.set_stage("generate").await;

            let outcome = tokio::time::timeout(
                orchestrator.config.generation_timeout,
                orchestrator.run_generation(&job, &handle),
            )
            .await;

            match outcome {
                Ok(Ok(committed)) => {
                    handle
                        .complete(serde_json::json!({
                            "proposal_doc_url": committed.proposal_doc_url,
                            "video_url": committed.video_url,
                            "pdf_url": committed.pdf_url,
                            "boost_decision": committed.boost_decision,
                        }))
                        .await;
                    orchestrator.after_generation(&job_id).await;
                }
                Ok(Err(e)) => {
                    handle.fail(e.to_string()).await;
                    if let Err(commit_err) =
                        orchestrator.commit_stage_error(&job_id, &e).await
                    {
                        error!(job_id = %job_id, error = %commit_err, "Failed to commit generation error");
                    }
                }
                Err(_elapsed) => {
                    let e = StageError::Unrecoverable {
                        stage: "generate".into(),
                        reason: format!(
                            "timed out after {:?}",
                            orchestrator.config.generation_timeout
                        ),
                    };
                    handle.fail(e.to_string()).await;
                    if let Err(commit_err) =
                        orchestrator.commit_stage_error(&job_id, &e).await
                    {
                        error!(job_id = %job_id, error = %commit_err, "Failed to commit generation timeout");
                    }
                }
            }
        });
    }

    /// Generate deliverables, decide boost, and commit both together with
    /// the move to `pending_approval`.
    async fn run_generation(
        &self,
        job: &JobRecord,
        handle: &TaskHandle,
    ) -> Result<JobRecord, StageError> {
        let generated =
            run_with_backoff(self.stages.generator.as_ref(), job, &self.config.retry).await?;
        handle.append_log("deliverables generated").await;

        // The booster sees the record as it will look after the generator's
        // update, without committing the intermediate state.
        let mut working = job.clone();
        generated.clone().apply(&mut working);

        handle.set_stage("decide_boost").await;
        let boost =
            run_with_backoff(self.stages.booster.as_ref(), &working, &self.config.retry).await?;
        handle.append_log("boost decided").await;

        self.commit_generation(&job.job_id, generated, boost)
            .await
            .map_err(|e| StageError::Unrecoverable {
                stage: "generate".into(),
                reason: e.to_string(),
            })
    }

    async fn commit_generation(
        &self,
        job_id: &str,
        generated: StageUpdate,
        boost: StageUpdate,
    ) -> Result<JobRecord, Error> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        if !job.status.can_transition_to(JobStatus::PendingApproval) {
            return Err(JobError::InvalidTransition {
                id: job_id.to_string(),
                state: job.status.to_string(),
                target: JobStatus::PendingApproval.to_string(),
            }
            .into());
        }

        generated.apply(&mut job);
        boost.apply(&mut job);
        if job.pricing_proposed.is_none() {
            job.pricing_proposed = job.default_pricing();
        }
        job.status = JobStatus::PendingApproval;
        self.store.update_job(&job).await?;
        info!(job_id = %job_id, "Assets ready, pending approval");
        Ok(job)
    }

    /// Post the approval request, then let the mode decide how far to
    /// self-advance.
    async fn after_generation(self: &Arc<Self>, job_id: &str) {
        match self.store.get_job(job_id).await {
            Ok(Some(job)) => match self.gateway.request_approval(&job).await {
                Ok(approval_ref) => {
                    if let Err(e) = self.set_approval_ref(job_id, &approval_ref).await {
                        warn!(job_id = %job_id, error = %e, "Failed to store approval ref");
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Approval request failed");
                    let _ = self
                        .append_error_note(job_id, format!("Approval request failed: {e}"))
                        .await;
                }
            },
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to reload job after generation");
                return;
            }
        }

        let mode = self.mode.current();
        if !mode.auto_approves() {
            return;
        }
        if let Err(e) = self.approve(job_id).await {
            warn!(job_id = %job_id, error = %e, "Auto-approval failed");
            return;
        }
        if mode.auto_submits() {
            if let Err(e) = self.agent.submit(job_id).await {
                warn!(job_id = %job_id, error = %e, "Auto-submit failed");
            }
        }
    }

    // ── Commits ─────────────────────────────────────────────────────

    /// Commit a transition, treating a lost race — another worker already
    /// moved this job — as a no-op rather than an error.
    async fn try_transition(
        &self,
        job_id: &str,
        to: JobStatus,
        update: StageUpdate,
    ) -> Result<Option<JobRecord>, Error> {
        match self.transition(job_id, to, update).await {
            Ok(job) => Ok(Some(job)),
            Err(Error::Job(JobError::InvalidTransition { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Commit a graph-validated transition together with a stage payload.
    async fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        update: StageUpdate,
    ) -> Result<JobRecord, Error> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        if !job.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: job_id.to_string(),
                state: job.status.to_string(),
                target: to.to_string(),
            }
            .into());
        }

        update.apply(&mut job);
        job.status = to;
        self.store.update_job(&job).await?;
        Ok(job)
    }

    async fn approve(&self, job_id: &str) -> Result<JobRecord, Error> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        if !job.status.can_transition_to(JobStatus::Approved) {
            return Err(JobError::InvalidTransition {
                id: job_id.to_string(),
                state: job.status.to_string(),
                target: JobStatus::Approved.to_string(),
            }
            .into());
        }
        job.status = JobStatus::Approved;
        job.approved_at = Some(Utc::now());
        self.store.update_job(&job).await?;
        info!(job_id = %job_id, "Job auto-approved");
        Ok(job)
    }

    /// Record an unrecoverable stage failure and move to `error`.
    async fn commit_stage_error(&self, job_id: &str, err: &StageError) -> Result<(), Error> {
        warn!(job_id = %job_id, stage = err.stage(), error = %err, "Stage failed");

        let _guard = self.locks.acquire(job_id).await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        job.log_error(err.to_string());
        if job.status.can_transition_to(JobStatus::Error) {
            job.status = JobStatus::Error;
        }
        self.store.update_job(&job).await?;
        Ok(())
    }

    async fn set_approval_ref(&self, job_id: &str, approval_ref: &str) -> Result<(), Error> {
        let _guard = self.locks.acquire(job_id).await;
        if let Some(mut job) = self.store.get_job(job_id).await? {
            job.approval_ref = Some(approval_ref.to_string());
            self.store.update_job(&job).await?;
        }
        Ok(())
    }

    async fn append_error_note(&self, job_id: &str, note: String) -> Result<(), Error> {
        let _guard = self.locks.acquire(job_id).await;
        if let Some(mut job) = self.store.get_job(job_id).await? {
            job.log_error(note);
            self.store.update_job(&job).await?;
        }
        Ok(())
    }

    // ── Operator overrides ──────────────────────────────────────────

    /// Set a job to any legal status, bypassing the transition graph.
    ///
    /// This is the audited administrative escape hatch — the override is
    /// logged and recorded in the job's error log. It does not touch the
    /// dedup ledger.
    pub async fn force_status(
        &self,
        job_id: &str,
        target: JobStatus,
    ) -> Result<JobRecord, Error> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;

        warn!(
            job_id = %job_id,
            from = %job.status,
            to = %target,
            "Operator status override"
        );
        job.log_error(format!("operator override: {} -> {}", job.status, target));
        job.status = target;
        self.store.update_job(&job).await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGateway;
    use crate::config::{RetrySchedule, SubmissionMode};
    use crate::error::{ApprovalError, SubmitError};
    use crate::model::{BudgetType, JobSource};
    use crate::registry::TaskCategory;
    use crate::stage::{Stage, StageExecutor};
    use crate::store::LibSqlBackend;
    use crate::submit::Submitter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedScorer {
        score: i64,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageExecutor for FixedScorer {
        fn stage(&self) -> Stage {
            Stage::Score
        }

        async fn run(&self, _job: &JobRecord) -> Result<StageUpdate, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageUpdate {
                fit_score: Some(self.score),
                fit_reasoning: Some("scripted".into()),
                ..Default::default()
            })
        }
    }

    struct FailingScorer;

    #[async_trait]
    impl StageExecutor for FailingScorer {
        fn stage(&self) -> Stage {
            Stage::Score
        }

        async fn run(&self, _job: &JobRecord) -> Result<StageUpdate, StageError> {
            Err(StageError::Unrecoverable {
                stage: "score".into(),
                reason: "malformed response".into(),
            })
        }
    }

    struct ScriptedExtractor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageExecutor for ScriptedExtractor {
        fn stage(&self) -> Stage {
            Stage::Extract
        }

        async fn run(&self, _job: &JobRecord) -> Result<StageUpdate, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageUpdate {
                budget_type: Some(BudgetType::Fixed),
                budget_min: Some(500.0),
                budget_max: Some(1000.0),
                payment_verified: Some(true),
                notes: vec!["attachment skipped: scan.tiff".into()],
                ..Default::default()
            })
        }
    }

    struct ScriptedGenerator;

    #[async_trait]
    impl StageExecutor for ScriptedGenerator {
        fn stage(&self) -> Stage {
            Stage::Generate
        }

        async fn run(&self, job: &JobRecord) -> Result<StageUpdate, StageError> {
            Ok(StageUpdate {
                proposal_doc_url: Some(format!("https://docs.example.com/{}", job.job_id)),
                proposal_text: Some("here is how I'd build it".into()),
                video_url: Some(format!("https://videos.example.com/{}", job.job_id)),
                pdf_url: Some(format!("https://files.example.com/{}.pdf", job.job_id)),
                cover_letter: Some("hello".into()),
                ..Default::default()
            })
        }
    }

    struct ScriptedBooster;

    #[async_trait]
    impl StageExecutor for ScriptedBooster {
        fn stage(&self) -> Stage {
            Stage::DecideBoost
        }

        async fn run(&self, job: &JobRecord) -> Result<StageUpdate, StageError> {
            // Boost when the deliverables are in place, mirroring that the
            // booster runs on the post-generation view of the record.
            Ok(StageUpdate {
                boost_decision: Some(job.proposal_doc_url.is_some()),
                boost_reasoning: Some("spend history looks strong".into()),
                ..Default::default()
            })
        }
    }

    struct CountingGateway {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ApprovalGateway for CountingGateway {
        async fn request_approval(&self, job: &JobRecord) -> Result<String, ApprovalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("ref-{}", job.job_id))
        }
    }

    struct InstantSubmitter;

    #[async_trait]
    impl Submitter for InstantSubmitter {
        async fn submit(
            &self,
            _job: &JobRecord,
            progress: &TaskHandle,
        ) -> Result<serde_json::Value, SubmitError> {
            progress.append_log("submitted").await;
            Ok(serde_json::json!({"confirmation": "ok"}))
        }
    }

    struct Harness {
        store: Arc<dyn Database>,
        orchestrator: Arc<Orchestrator>,
        scorer_calls: Arc<AtomicUsize>,
        extractor_calls: Arc<AtomicUsize>,
        gateway_calls: Arc<AtomicUsize>,
    }

    async fn harness(score: i64, mode: SubmissionMode) -> Harness {
        harness_with(score, mode, false).await
    }

    async fn harness_with(score: i64, mode: SubmissionMode, broken_scorer: bool) -> Harness {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let locks = JobLocks::new();
        let mode = Arc::new(ModeController::new(mode));
        let scorer_calls = Arc::new(AtomicUsize::new(0));
        let extractor_calls = Arc::new(AtomicUsize::new(0));
        let gateway_calls = Arc::new(AtomicUsize::new(0));

        let scorer: Arc<dyn StageExecutor> = if broken_scorer {
            Arc::new(FailingScorer)
        } else {
            Arc::new(FixedScorer {
                score,
                calls: Arc::clone(&scorer_calls),
            })
        };
        let stages = StageSet {
            scorer,
            extractor: Arc::new(ScriptedExtractor {
                calls: Arc::clone(&extractor_calls),
            }),
            generator: Arc::new(ScriptedGenerator),
            booster: Arc::new(ScriptedBooster),
        };

        let submit_registry =
            ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_secs(60));
        let agent = SubmissionAgent::new(
            Arc::clone(&store),
            submit_registry,
            Arc::new(InstantSubmitter),
            Arc::clone(&locks),
            Duration::from_secs(5),
        );
        let gen_registry =
            ActiveTaskRegistry::new(TaskCategory::AssetGeneration, Duration::from_secs(60));

        let config = PipelineConfig {
            retry: RetrySchedule {
                attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..PipelineConfig::default()
        };

        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            stages,
            Arc::new(CountingGateway {
                calls: Arc::clone(&gateway_calls),
            }),
            agent,
            gen_registry,
            mode,
            locks,
            Ingestor::new(Arc::clone(&store)),
            config,
        );

        Harness {
            store,
            orchestrator,
            scorer_calls,
            extractor_calls,
            gateway_calls,
        }
    }

    async fn seed(store: &Arc<dyn Database>, id: &str) {
        let job = JobRecord::new(id, format!("https://example.com/jobs/~0{id}"), JobSource::Scraper);
        store.insert_job(&job).await.unwrap();
    }

    async fn wait_for_status(
        store: &Arc<dyn Database>,
        id: &str,
        expected: JobStatus,
    ) -> JobRecord {
        for _ in 0..200 {
            let job = store.get_job(id).await.unwrap().unwrap();
            if job.status == expected {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = store.get_job(id).await.unwrap().unwrap();
        panic!("job {id} stuck at {}, wanted {expected}", job.status);
    }

    #[tokio::test]
    async fn low_score_filters_out_before_later_stages() {
        let h = harness(40, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;

        let status = h.orchestrator.advance("1", None).await.unwrap();
        assert_eq!(status, JobStatus::FilteredOut);

        let job = h.store.get_job("1").await.unwrap().unwrap();
        assert_eq!(job.fit_score, Some(40));
        assert_eq!(h.extractor_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.gateway_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn min_score_override_bypasses_threshold() {
        let h = harness(40, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;

        h.orchestrator.advance("1", Some(0)).await.unwrap();
        wait_for_status(&h.store, "1", JobStatus::PendingApproval).await;
    }

    #[tokio::test]
    async fn manual_mode_stops_at_pending_approval() {
        let h = harness(90, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;

        h.orchestrator.advance("1", None).await.unwrap();
        let job = wait_for_status(&h.store, "1", JobStatus::PendingApproval).await;

        assert!(job.proposal_doc_url.is_some());
        assert_eq!(job.boost_decision, Some(true));
        assert_eq!(job.pricing_proposed, Some(750.0));
        assert_eq!(job.approval_ref.as_deref(), Some("ref-1"));
        assert!(job.error_log.iter().any(|l| l.contains("scan.tiff")));
        assert_eq!(h.gateway_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn semi_auto_approves_but_does_not_submit() {
        let h = harness(90, SubmissionMode::SemiAuto).await;
        seed(&h.store, "1").await;

        h.orchestrator.advance("1", None).await.unwrap();
        let job = wait_for_status(&h.store, "1", JobStatus::Approved).await;
        assert!(job.approved_at.is_some());

        // No submission should start on its own.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = h.store.get_job("1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Approved);
    }

    #[tokio::test]
    async fn automatic_mode_reaches_submitted_without_external_calls() {
        let h = harness(90, SubmissionMode::Automatic).await;
        seed(&h.store, "1").await;

        h.orchestrator.advance("1", None).await.unwrap();
        let job = wait_for_status(&h.store, "1", JobStatus::Submitted).await;
        assert!(job.submitted_at.is_some());
    }

    #[tokio::test]
    async fn scorer_failure_moves_to_error() {
        let h = harness_with(0, SubmissionMode::Manual, true).await;
        seed(&h.store, "1").await;

        let status = h.orchestrator.advance("1", None).await.unwrap();
        assert_eq!(status, JobStatus::Error);

        let job = h.store.get_job("1").await.unwrap().unwrap();
        assert!(job.error_log.iter().any(|l| l.contains("malformed response")));
    }

    #[tokio::test]
    async fn resumes_from_scoring_after_crash() {
        let h = harness(90, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;

        // Simulate a crash after the scoring commit but before the scorer
        // outcome landed: status is `scoring`, no score recorded.
        let mut job = h.store.get_job("1").await.unwrap().unwrap();
        job.status = JobStatus::Scoring;
        h.store.update_job(&job).await.unwrap();

        h.orchestrator.advance("1", None).await.unwrap();
        wait_for_status(&h.store, "1", JobStatus::PendingApproval).await;
        assert_eq!(h.scorer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_jobs_are_left_alone() {
        let h = harness(90, SubmissionMode::Automatic).await;
        seed(&h.store, "1").await;
        h.orchestrator
            .force_status("1", JobStatus::Rejected)
            .await
            .unwrap();

        let status = h.orchestrator.advance("1", None).await.unwrap();
        assert_eq!(status, JobStatus::Rejected);
        assert_eq!(h.scorer_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_status_is_audited() {
        let h = harness(90, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;
        h.orchestrator
            .force_status("1", JobStatus::FilteredOut)
            .await
            .unwrap();

        let job = h
            .orchestrator
            .force_status("1", JobStatus::New)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::New);
        assert!(job
            .error_log
            .iter()
            .any(|l| l.contains("operator override: filtered_out -> new")));
    }

    #[tokio::test]
    async fn auto_process_picks_up_eligible_jobs() {
        let h = harness(90, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;
        seed(&h.store, "2").await;

        let count = h.orchestrator.auto_process().await.unwrap();
        assert_eq!(count, 2);

        wait_for_status(&h.store, "1", JobStatus::PendingApproval).await;
        wait_for_status(&h.store, "2", JobStatus::PendingApproval).await;
    }

    #[tokio::test]
    async fn mode_flip_applies_at_next_decision_point() {
        let h = harness(90, SubmissionMode::Manual).await;
        seed(&h.store, "1").await;

        h.orchestrator.advance("1", None).await.unwrap();
        wait_for_status(&h.store, "1", JobStatus::PendingApproval).await;

        // Flip to automatic mid-pipeline; the next decision points see it.
        h.orchestrator.mode().set(SubmissionMode::Automatic);
        h.orchestrator.advance("1", None).await.unwrap();
        wait_for_status(&h.store, "1", JobStatus::Submitted).await;
    }
}
