//! `Database` trait — single async interface for all persistence.
//!
//! Covers the job record table (one row per job, the source of truth for
//! pipeline state) and the append-only processed-id ledger used for
//! ingestion deduplication.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{JobRecord, JobSource, JobStatus};

/// Backend-agnostic database trait.
///
/// Only the orchestrator and explicit operator actions write job rows;
/// stage executors return proposed updates which the orchestrator commits
/// through `update_job`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job record. Idempotent on `job_id`: returns `true` if
    /// the row was inserted, `false` if one already existed. A dedup race
    /// between two ingestion runs therefore cannot produce two rows.
    async fn insert_job(&self, job: &JobRecord) -> Result<bool, StoreError>;

    /// Get a job by ID.
    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Look up a job by the opaque approval reference returned from the
    /// approval gateway.
    async fn get_job_by_approval_ref(
        &self,
        approval_ref: &str,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Commit the full mutable state of a job in one statement.
    ///
    /// Status and stage payload land together; a crash before this call
    /// leaves the previous committed state intact.
    async fn update_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// List jobs, optionally filtered by status, newest first.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// List all jobs currently in any of the given statuses.
    async fn list_jobs_in_statuses(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Delete a job record. Returns `true` if a row was removed.
    ///
    /// The job's processed-id record is intentionally left behind so the
    /// posting is never re-ingested.
    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Count of jobs per status string.
    async fn status_counts(&self) -> Result<Vec<(String, i64)>, StoreError>;

    // ── Processed IDs ───────────────────────────────────────────────

    /// Has this identifier been seen from this source before?
    async fn is_processed(&self, source: JobSource, job_id: &str) -> Result<bool, StoreError>;

    /// Record an identifier as seen. Idempotent — safe to call twice for
    /// the same `(job_id, source)` pair.
    async fn mark_processed(
        &self,
        source: JobSource,
        job_id: &str,
        first_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Total processed-id records (all sources).
    async fn processed_count(&self) -> Result<i64, StoreError>;
}
