//! Stage executor contracts.
//!
//! Executors are external collaborators — scoring heuristics, browser
//! extraction, asset generation providers. The pipeline sees them as a
//! closed set of variants behind one trait: take the current record,
//! return a proposed update or a typed error. Executors never touch the
//! record store; the orchestrator commits what they return.

pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StageError;
use crate::model::{Attachment, BudgetType, JobRecord};

/// The processing step an executor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Score,
    Extract,
    Generate,
    DecideBoost,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Score => "score",
            Self::Extract => "extract",
            Self::Generate => "generate",
            Self::DecideBoost => "decide_boost",
        };
        write!(f, "{s}")
    }
}

/// Partial record update proposed by a stage executor.
///
/// Only `Some` fields are written. `notes` carries partial-data problems
/// (an unparseable attachment, a missing client field) that should land in
/// the job's error log without failing the stage.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub attachments: Option<Vec<Attachment>>,

    pub budget_type: Option<BudgetType>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub client_country: Option<String>,
    pub client_spent: Option<f64>,
    pub client_hires: Option<i64>,
    pub payment_verified: Option<bool>,

    pub fit_score: Option<i64>,
    pub fit_reasoning: Option<String>,

    pub proposal_doc_url: Option<String>,
    pub proposal_text: Option<String>,
    pub video_url: Option<String>,
    pub pdf_url: Option<String>,
    pub cover_letter: Option<String>,

    pub boost_decision: Option<bool>,
    pub boost_reasoning: Option<String>,
    pub pricing_proposed: Option<f64>,

    /// Partial-failure notes, appended to the job's error log.
    pub notes: Vec<String>,
}

impl StageUpdate {
    /// Merge this update into a record. `None` fields leave the record
    /// untouched; notes are appended to the error log.
    pub fn apply(self, job: &mut JobRecord) {
        if let Some(v) = self.title {
            job.title = Some(v);
        }
        if let Some(v) = self.description {
            job.description = Some(v);
        }
        if let Some(v) = self.attachments {
            job.attachments = v;
        }
        if let Some(v) = self.budget_type {
            job.budget_type = Some(v);
        }
        if let Some(v) = self.budget_min {
            job.budget_min = Some(v);
        }
        if let Some(v) = self.budget_max {
            job.budget_max = Some(v);
        }
        if let Some(v) = self.client_country {
            job.client_country = Some(v);
        }
        if let Some(v) = self.client_spent {
            job.client_spent = Some(v);
        }
        if let Some(v) = self.client_hires {
            job.client_hires = Some(v);
        }
        if let Some(v) = self.payment_verified {
            job.payment_verified = v;
        }
        if let Some(v) = self.fit_score {
            job.fit_score = Some(v);
        }
        if let Some(v) = self.fit_reasoning {
            job.fit_reasoning = Some(v);
        }
        if let Some(v) = self.proposal_doc_url {
            job.proposal_doc_url = Some(v);
        }
        if let Some(v) = self.proposal_text {
            job.proposal_text = Some(v);
        }
        if let Some(v) = self.video_url {
            job.video_url = Some(v);
        }
        if let Some(v) = self.pdf_url {
            job.pdf_url = Some(v);
        }
        if let Some(v) = self.cover_letter {
            job.cover_letter = Some(v);
        }
        if let Some(v) = self.boost_decision {
            job.boost_decision = Some(v);
        }
        if let Some(v) = self.boost_reasoning {
            job.boost_reasoning = Some(v);
        }
        if let Some(v) = self.pricing_proposed {
            job.pricing_proposed = Some(v);
        }
        for note in self.notes {
            job.log_error(note);
        }
    }
}

/// One invocable processing step.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Which stage this executor implements.
    fn stage(&self) -> Stage;

    /// Run against the current record, returning a proposed update.
    async fn run(&self, job: &JobRecord) -> Result<StageUpdate, StageError>;
}

/// The closed set of executors the orchestrator selects from.
#[derive(Clone)]
pub struct StageSet {
    pub scorer: Arc<dyn StageExecutor>,
    pub extractor: Arc<dyn StageExecutor>,
    pub generator: Arc<dyn StageExecutor>,
    pub booster: Arc<dyn StageExecutor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobRecord, JobSource};

    #[test]
    fn apply_merges_only_some_fields() {
        let mut job = JobRecord::new("1", "https://example.com/jobs/~01", JobSource::Scraper);
        job.title = Some("original title".into());

        let update = StageUpdate {
            fit_score: Some(88),
            fit_reasoning: Some("good match".into()),
            notes: vec!["attachment skipped: brief.xlsx".into()],
            ..Default::default()
        };
        update.apply(&mut job);

        assert_eq!(job.title.as_deref(), Some("original title"));
        assert_eq!(job.fit_score, Some(88));
        assert_eq!(job.error_log, vec!["attachment skipped: brief.xlsx"]);
    }

    #[test]
    fn apply_overwrites_present_fields() {
        let mut job = JobRecord::new("1", "https://example.com/jobs/~01", JobSource::Scraper);
        job.description = Some("short blurb".into());

        let update = StageUpdate {
            description: Some("full extracted description".into()),
            payment_verified: Some(true),
            ..Default::default()
        };
        update.apply(&mut job);

        assert_eq!(
            job.description.as_deref(),
            Some("full extracted description")
        );
        assert!(job.payment_verified);
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Score.to_string(), "score");
        assert_eq!(Stage::DecideBoost.to_string(), "decide_boost");
    }
}
