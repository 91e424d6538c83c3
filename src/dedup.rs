//! Ingestion deduplication over the processed-id ledger.
//!
//! The ledger is append-only: records are written once on first ingestion
//! and never deleted, so a posting deleted from the job table is still
//! never re-ingested.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::JobSource;
use crate::store::Database;

/// A candidate posting as produced by a source connector, before admission.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub job_id: String,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Outcome of partitioning one ingestion batch.
#[derive(Debug, Default)]
pub struct Partition {
    pub fresh: Vec<Candidate>,
    pub duplicates: Vec<Candidate>,
    /// Candidates dropped because they carried no usable identifier.
    pub skipped: usize,
}

/// Deduplicator backed by the shared database.
pub struct Deduplicator {
    store: Arc<dyn Database>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Has this identifier been seen from this source before?
    pub async fn is_processed(
        &self,
        source: JobSource,
        job_id: &str,
    ) -> Result<bool, StoreError> {
        self.store.is_processed(source, job_id).await
    }

    /// Record an identifier as seen. Idempotent.
    pub async fn mark_processed(&self, source: JobSource, job_id: &str) -> Result<(), StoreError> {
        self.store.mark_processed(source, job_id, Utc::now()).await
    }

    /// Split a batch into fresh and already-seen candidates.
    ///
    /// Checks both the persistent ledger and the identifiers already seen
    /// earlier in this same batch, so a source returning the same posting
    /// twice in one run yields one fresh candidate. Does not write the
    /// ledger — callers mark ids only after admission succeeds.
    pub async fn partition(
        &self,
        source: JobSource,
        candidates: Vec<Candidate>,
    ) -> Result<Partition, StoreError> {
        let mut seen_in_batch: HashSet<String> = HashSet::new();
        let mut partition = Partition::default();

        for candidate in candidates {
            if candidate.job_id.is_empty() {
                warn!(
                    title = candidate.title.as_deref().unwrap_or("unknown"),
                    "Candidate has no job id, skipping"
                );
                partition.skipped += 1;
                continue;
            }

            if seen_in_batch.contains(&candidate.job_id)
                || self.store.is_processed(source, &candidate.job_id).await?
            {
                partition.duplicates.push(candidate);
            } else {
                seen_in_batch.insert(candidate.job_id.clone());
                partition.fresh.push(candidate);
            }
        }

        debug!(
            source = %source,
            fresh = partition.fresh.len(),
            duplicates = partition.duplicates.len(),
            skipped = partition.skipped,
            "Batch partitioned"
        );
        Ok(partition)
    }
}
