//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use; single-row writes are
//! atomic, which is what the orchestrator's commit contract relies on.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{Attachment, BudgetType, JobRecord, JobSource, JobStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: &Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.clone()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_bool(v: Option<bool>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v as i64),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(v: Option<DateTime<Utc>>) -> libsql::Value {
    match v {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Column order shared by every jobs SELECT.
const JOB_COLUMNS: &str = "job_id, source, status, url, title, description, attachments, \
     budget_type, budget_min, budget_max, client_country, client_spent, client_hires, \
     payment_verified, fit_score, fit_reasoning, proposal_doc_url, proposal_text, \
     video_url, pdf_url, cover_letter, boost_decision, boost_reasoning, pricing_proposed, \
     approval_ref, approved_at, submitted_at, error_log, created_at, updated_at";

/// Map a libsql Row to a JobRecord. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, StoreError> {
    let source_str: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("job row source: {e}")))?;
    let status_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("job row status: {e}")))?;
    let attachments_str: String = row.get(6).unwrap_or_else(|_| "[]".to_string());
    let error_log_str: String = row.get(27).unwrap_or_else(|_| "[]".to_string());
    let created_str: String = row.get(28).unwrap_or_default();
    let updated_str: String = row.get(29).unwrap_or_default();

    let source = JobSource::from_str(&source_str)
        .map_err(|e| StoreError::Serialization(format!("job row source: {e}")))?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|e| StoreError::Serialization(format!("job row status: {e}")))?;

    let attachments: Vec<Attachment> = serde_json::from_str(&attachments_str)
        .map_err(|e| StoreError::Serialization(format!("attachments: {e}")))?;
    let error_log: Vec<String> = serde_json::from_str(&error_log_str)
        .map_err(|e| StoreError::Serialization(format!("error_log: {e}")))?;

    Ok(JobRecord {
        job_id: row
            .get(0)
            .map_err(|e| StoreError::Query(format!("job row id: {e}")))?,
        source,
        status,
        url: row.get(3).unwrap_or_default(),
        title: row.get(4).ok(),
        description: row.get(5).ok(),
        attachments,
        budget_type: row
            .get::<String>(7)
            .ok()
            .and_then(|s| BudgetType::from_str(&s).ok()),
        budget_min: row.get(8).ok(),
        budget_max: row.get(9).ok(),
        client_country: row.get(10).ok(),
        client_spent: row.get(11).ok(),
        client_hires: row.get(12).ok(),
        payment_verified: row.get::<i64>(13).unwrap_or(0) != 0,
        fit_score: row.get(14).ok(),
        fit_reasoning: row.get(15).ok(),
        proposal_doc_url: row.get(16).ok(),
        proposal_text: row.get(17).ok(),
        video_url: row.get(18).ok(),
        pdf_url: row.get(19).ok(),
        cover_letter: row.get(20).ok(),
        boost_decision: row.get::<i64>(21).ok().map(|v| v != 0),
        boost_reasoning: row.get(22).ok(),
        pricing_proposed: row.get(23).ok(),
        approval_ref: row.get(24).ok(),
        approved_at: row.get::<String>(25).ok().map(|s| parse_datetime(&s)),
        submitted_at: row.get::<String>(26).ok().map(|s| parse_datetime(&s)),
        error_log,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn attachments_json(job: &JobRecord) -> Result<String, StoreError> {
    serde_json::to_string(&job.attachments).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn error_log_json(job: &JobRecord) -> Result<String, StoreError> {
    serde_json::to_string(&job.error_log).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &JobRecord) -> Result<bool, StoreError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "INSERT OR IGNORE INTO jobs (job_id, source, status, url, title, description, \
                 attachments, budget_type, budget_min, budget_max, client_country, client_spent, \
                 client_hires, payment_verified, fit_score, fit_reasoning, proposal_doc_url, \
                 proposal_text, video_url, pdf_url, cover_letter, boost_decision, boost_reasoning, \
                 pricing_proposed, approval_ref, approved_at, submitted_at, error_log, created_at, \
                 updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
                params![
                    job.job_id.clone(),
                    job.source.to_string(),
                    job.status.to_string(),
                    job.url.clone(),
                    opt_text(&job.title),
                    opt_text(&job.description),
                    attachments_json(job)?,
                    opt_text(&job.budget_type.map(|b| b.to_string())),
                    opt_real(job.budget_min),
                    opt_real(job.budget_max),
                    opt_text(&job.client_country),
                    opt_real(job.client_spent),
                    opt_int(job.client_hires),
                    job.payment_verified as i64,
                    opt_int(job.fit_score),
                    opt_text(&job.fit_reasoning),
                    opt_text(&job.proposal_doc_url),
                    opt_text(&job.proposal_text),
                    opt_text(&job.video_url),
                    opt_text(&job.pdf_url),
                    opt_text(&job.cover_letter),
                    opt_bool(job.boost_decision),
                    opt_text(&job.boost_reasoning),
                    opt_real(job.pricing_proposed),
                    opt_text(&job.approval_ref),
                    opt_datetime(job.approved_at),
                    opt_datetime(job.submitted_at),
                    error_log_json(job)?,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_job: {e}")))?;

        let inserted = count > 0;
        if inserted {
            debug!(job_id = %job.job_id, source = %job.source, "Job inserted");
        } else {
            debug!(job_id = %job.job_id, "Job already present, insert ignored");
        }
        Ok(inserted)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_job: {e}"))),
        }
    }

    async fn get_job_by_approval_ref(
        &self,
        approval_ref: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE approval_ref = ?1"),
                params![approval_ref],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_job_by_approval_ref: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_job_by_approval_ref: {e}"))),
        }
    }

    async fn update_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let count = conn
            .execute(
                "UPDATE jobs SET source=?2, status=?3, url=?4, title=?5, description=?6, \
                 attachments=?7, budget_type=?8, budget_min=?9, budget_max=?10, \
                 client_country=?11, client_spent=?12, client_hires=?13, payment_verified=?14, \
                 fit_score=?15, fit_reasoning=?16, proposal_doc_url=?17, proposal_text=?18, \
                 video_url=?19, pdf_url=?20, cover_letter=?21, boost_decision=?22, \
                 boost_reasoning=?23, pricing_proposed=?24, approval_ref=?25, approved_at=?26, \
                 submitted_at=?27, error_log=?28, updated_at=?29 \
                 WHERE job_id = ?1",
                params![
                    job.job_id.clone(),
                    job.source.to_string(),
                    job.status.to_string(),
                    job.url.clone(),
                    opt_text(&job.title),
                    opt_text(&job.description),
                    attachments_json(job)?,
                    opt_text(&job.budget_type.map(|b| b.to_string())),
                    opt_real(job.budget_min),
                    opt_real(job.budget_max),
                    opt_text(&job.client_country),
                    opt_real(job.client_spent),
                    opt_int(job.client_hires),
                    job.payment_verified as i64,
                    opt_int(job.fit_score),
                    opt_text(&job.fit_reasoning),
                    opt_text(&job.proposal_doc_url),
                    opt_text(&job.proposal_text),
                    opt_text(&job.video_url),
                    opt_text(&job.pdf_url),
                    opt_text(&job.cover_letter),
                    opt_bool(job.boost_decision),
                    opt_text(&job.boost_reasoning),
                    opt_real(job.pricing_proposed),
                    opt_text(&job.approval_ref),
                    opt_datetime(job.approved_at),
                    opt_datetime(job.submitted_at),
                    error_log_json(job)?,
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_job: {e}")))?;

        if count == 0 {
            return Err(StoreError::NotFound {
                entity: "job".to_string(),
                id: job.job_id.clone(),
            });
        }
        debug!(job_id = %job.job_id, status = %job.status, "Job committed");
        Ok(())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = if let Some(status) = status {
            conn.query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![status.to_string(), limit as i64],
            )
            .await
        } else {
            conn.query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
        }
        .map_err(|e| StoreError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn list_jobs_in_statuses(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> =
            (1..=statuses.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({}) ORDER BY created_at ASC",
            placeholders.join(", ")
        );
        let values: Vec<libsql::Value> = statuses
            .iter()
            .map(|s| libsql::Value::Text(s.to_string()))
            .collect();

        let conn = self.conn();
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| StoreError::Query(format!("list_jobs_in_statuses: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_job: {e}")))?;

        if count > 0 {
            debug!(job_id = job_id, "Job deleted (processed-id record kept)");
        }
        Ok(count > 0)
    }

    async fn status_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(|e| StoreError::Query(format!("status_counts: {e}")))?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            counts.push((status, count));
        }
        Ok(counts)
    }

    // ── Processed IDs ───────────────────────────────────────────────

    async fn is_processed(&self, source: JobSource, job_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM processed_ids WHERE job_id = ?1 AND source = ?2",
                params![job_id, source.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processed(
        &self,
        source: JobSource,
        job_id: &str,
        first_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO processed_ids (job_id, source, first_seen_at) \
             VALUES (?1, ?2, ?3)",
            params![job_id, source.to_string(), first_seen.to_rfc3339()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("mark_processed: {e}")))?;
        Ok(())
    }

    async fn processed_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM processed_ids", ())
            .await
            .map_err(|e| StoreError::Query(format!("processed_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }
}
