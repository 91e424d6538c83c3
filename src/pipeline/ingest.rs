//! Ingestion — source connectors, dedup, and admission into the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dedup::{Candidate, Deduplicator};
use crate::error::{Error, IngestError};
use crate::model::{JobRecord, JobSource};
use crate::pipeline::types::{IngestReport, IngestRequest};
use crate::store::Database;

/// A content source: board scraper, inbox-alert poller, manual URL list.
///
/// Connectors only fetch; admission, dedup, and record creation belong to
/// the `Ingestor`.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source(&self) -> JobSource;

    /// Fetch candidate postings for a request.
    async fn fetch(&self, request: &IngestRequest) -> Result<Vec<Candidate>, IngestError>;
}

/// Connector for operator-supplied posting URLs.
///
/// Turns the request's explicit URL list into candidates, recovering each
/// job id from its URL. URLs with no recognizable id are reported as a
/// malformed query rather than silently dropped.
pub struct ManualUrlConnector;

#[async_trait]
impl SourceConnector for ManualUrlConnector {
    fn source(&self) -> JobSource {
        JobSource::Manual
    }

    async fn fetch(&self, request: &IngestRequest) -> Result<Vec<Candidate>, IngestError> {
        let mut candidates = Vec::new();
        for url in request.urls.iter().take(request.limit) {
            let job_id = crate::model::job_id_from_url(url).ok_or_else(|| {
                IngestError::MalformedQuery {
                    source_name: JobSource::Manual.to_string(),
                    reason: format!("no job id recognizable in '{url}'"),
                }
            })?;
            candidates.push(Candidate {
                job_id,
                url: url.clone(),
                title: None,
                description: None,
            });
        }
        Ok(candidates)
    }
}

/// Clears the run flag when an ingestion run finishes, however it exits.
struct RunFlagGuard<'a>(&'a AtomicBool);

impl Drop for RunFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Admits candidate postings into the record store.
pub struct Ingestor {
    store: Arc<dyn Database>,
    dedup: Deduplicator,
    connectors: HashMap<JobSource, Arc<dyn SourceConnector>>,
    running: AtomicBool,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Database>) -> Self {
        let dedup = Deduplicator::new(Arc::clone(&store));
        Self {
            store,
            dedup,
            connectors: HashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Register a connector for its source. Last registration wins.
    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors.insert(connector.source(), connector);
    }

    /// Run one ingestion: fetch → dedup → admit.
    ///
    /// Only one run at a time; a second trigger while one is in flight is
    /// rejected. Fresh candidates are inserted as `new` and their ids
    /// marked processed immediately after the insert succeeds, before any
    /// stage runs.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport, Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(IngestError::RunInProgress.into());
        }
        let _flag = RunFlagGuard(&self.running);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let source = request.source;

        let connector = self
            .connectors
            .get(&source)
            .ok_or_else(|| IngestError::UnknownSource(source.to_string()))?;

        info!(run_id = %run_id, source = %source, limit = request.limit, "Ingestion started");

        let candidates = connector.fetch(request).await?;
        if candidates.is_empty() {
            return Err(IngestError::NoResults {
                source_name: source.to_string(),
            }
            .into());
        }
        let fetched = candidates.len();

        let partition = self.dedup.partition(source, candidates).await?;

        let mut admitted_ids = Vec::new();
        for candidate in partition.fresh {
            let mut record = JobRecord::new(&candidate.job_id, &candidate.url, source);
            record.title = candidate.title;
            record.description = candidate.description;

            let inserted = self.store.insert_job(&record).await?;
            // Mark processed either way: a racing run admitted it first,
            // and the ledger write is idempotent.
            self.dedup.mark_processed(source, &candidate.job_id).await?;

            if inserted {
                admitted_ids.push(candidate.job_id);
            } else {
                warn!(job_id = %candidate.job_id, "Record already existed, admission skipped");
            }
        }

        let report = IngestReport {
            run_id,
            source,
            started_at,
            finished_at: Utc::now(),
            fetched,
            duplicates: partition.duplicates.len(),
            skipped: partition.skipped,
            admitted: admitted_ids.len(),
            admitted_ids,
        };

        info!(
            run_id = %run_id,
            fetched = report.fetched,
            duplicates = report.duplicates,
            admitted = report.admitted,
            "Ingestion finished"
        );
        Ok(report)
    }
}
