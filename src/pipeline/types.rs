//! Shared types for pipeline runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::JobSource;

/// Filters passed through to source connectors. All optional; connectors
/// honor what their upstream supports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestFilters {
    #[serde(default)]
    pub keywords: Vec<String>,
    pub location: Option<String>,
    pub posted_within_days: Option<u32>,
    pub min_budget: Option<f64>,
}

/// One ingestion trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source: JobSource,
    /// Max candidates to pull from the source.
    pub limit: usize,
    #[serde(default)]
    pub filters: IngestFilters,
    /// Explicit posting URLs, for the manual source.
    #[serde(default)]
    pub urls: Vec<String>,
    /// Drive each admitted job through the pipeline immediately.
    #[serde(default)]
    pub run_full_pipeline: bool,
    /// Per-run minimum score override (0 bypasses scoring entirely).
    #[serde(default)]
    pub min_score: Option<i64>,
}

impl IngestRequest {
    pub fn new(source: JobSource, limit: usize) -> Self {
        Self {
            source,
            limit,
            filters: IngestFilters::default(),
            urls: Vec::new(),
            run_full_pipeline: false,
            min_score: None,
        }
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub source: JobSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Candidates the connector returned.
    pub fetched: usize,
    /// Dropped as already seen (ledger or in-batch).
    pub duplicates: usize,
    /// Dropped for carrying no usable identifier.
    pub skipped: usize,
    /// New `JobRecord`s created in status `new`.
    pub admitted: usize,
    pub admitted_ids: Vec<String>,
}
