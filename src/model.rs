//! Job record and pipeline state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a posting was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Scraped from the job board.
    Scraper,
    /// Parsed out of an inbox alert.
    InboxAlert,
    /// Submitted by the operator as an explicit URL.
    Manual,
}

impl std::fmt::Display for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scraper => "scraper",
            Self::InboxAlert => "inbox_alert",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scraper" => Ok(Self::Scraper),
            "inbox_alert" => Ok(Self::InboxAlert),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Pipeline status of a job.
///
/// The exact strings are a stable contract for any UI or automation
/// consuming this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, nothing has run yet.
    New,
    /// Relevance scoring in progress.
    Scoring,
    /// Score below threshold. Terminal.
    FilteredOut,
    /// Deep extraction in progress.
    Extracting,
    /// Asset generation (deliverables + boost decision) in progress.
    Generating,
    /// Waiting on a human (or the automation mode) to approve.
    PendingApproval,
    /// Approved, waiting for a submit trigger.
    Approved,
    /// Operator rejected. Terminal.
    Rejected,
    /// Submission agent is driving the application.
    Submitting,
    /// Application went out. Terminal.
    Submitted,
    /// Submission failed; operator may retry.
    SubmissionFailed,
    /// A stage failed unrecoverably. Terminal unless explicitly reset.
    Error,
}

impl JobStatus {
    /// Check whether the state machine allows moving to `target`.
    ///
    /// The operator override path bypasses this check deliberately.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (New, Scoring)
                | (Scoring, FilteredOut)
                | (Scoring, Extracting)
                | (Scoring, Error)
                | (Extracting, Generating)
                | (Extracting, Error)
                | (Generating, PendingApproval)
                | (Generating, Error)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Submitting)
                | (Submitting, Submitted)
                | (Submitting, SubmissionFailed)
                | (SubmissionFailed, Submitting)
        )
    }

    /// Terminal states produce no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FilteredOut | Self::Rejected | Self::Submitted | Self::Error
        )
    }

    /// All known statuses, for validating operator overrides.
    pub fn all() -> &'static [JobStatus] {
        use JobStatus::*;
        &[
            New,
            Scoring,
            FilteredOut,
            Extracting,
            Generating,
            PendingApproval,
            Approved,
            Rejected,
            Submitting,
            Submitted,
            SubmissionFailed,
            Error,
        ]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Scoring => "scoring",
            Self::FilteredOut => "filtered_out",
            Self::Extracting => "extracting",
            Self::Generating => "generating",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::SubmissionFailed => "submission_failed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "scoring" => Ok(Self::Scoring),
            "filtered_out" => Ok(Self::FilteredOut),
            "extracting" => Ok(Self::Extracting),
            "generating" => Ok(Self::Generating),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "submitting" => Ok(Self::Submitting),
            "submitted" => Ok(Self::Submitted),
            "submission_failed" => Ok(Self::SubmissionFailed),
            "error" => Ok(Self::Error),
            other => Err(crate::error::JobError::UnknownStatus(other.to_string())),
        }
    }
}

/// Fixed-price vs hourly posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetType {
    Fixed,
    Hourly,
}

impl std::fmt::Display for BudgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Hourly => write!(f, "hourly"),
        }
    }
}

impl std::str::FromStr for BudgetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "hourly" => Ok(Self::Hourly),
            other => Err(format!("unknown budget type '{other}'")),
        }
    }
}

/// A file attached to the posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    /// Text pulled out of the attachment, if it was parseable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

/// One job as it flows through the pipeline.
///
/// Owned exclusively by the record store. Stage executors propose updates;
/// only the orchestrator (or explicit operator action) commits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable external identifier. Primary key, globally unique.
    pub job_id: String,
    pub source: JobSource,
    pub status: JobStatus,

    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,

    // Budget + client-quality signals from deep extraction.
    pub budget_type: Option<BudgetType>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub client_country: Option<String>,
    pub client_spent: Option<f64>,
    pub client_hires: Option<i64>,
    #[serde(default)]
    pub payment_verified: bool,

    // Scoring.
    pub fit_score: Option<i64>,
    pub fit_reasoning: Option<String>,

    // Generated assets.
    pub proposal_doc_url: Option<String>,
    pub proposal_text: Option<String>,
    pub video_url: Option<String>,
    pub pdf_url: Option<String>,
    pub cover_letter: Option<String>,

    // Boost decision.
    pub boost_decision: Option<bool>,
    pub boost_reasoning: Option<String>,
    pub pricing_proposed: Option<f64>,

    // Approval / submission tracking.
    pub approval_ref: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,

    /// Append-style log of partial failures and overrides.
    #[serde(default)]
    pub error_log: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a freshly-admitted record in status `new`.
    pub fn new(job_id: impl Into<String>, url: impl Into<String>, source: JobSource) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            source,
            status: JobStatus::New,
            url: url.into(),
            title: None,
            description: None,
            attachments: Vec::new(),
            budget_type: None,
            budget_min: None,
            budget_max: None,
            client_country: None,
            client_spent: None,
            client_hires: None,
            payment_verified: false,
            fit_score: None,
            fit_reasoning: None,
            proposal_doc_url: None,
            proposal_text: None,
            video_url: None,
            pdf_url: None,
            cover_letter: None,
            boost_decision: None,
            boost_reasoning: None,
            pricing_proposed: None,
            approval_ref: None,
            approved_at: None,
            submitted_at: None,
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Midpoint of the budget range, or whichever bound is known.
    pub fn default_pricing(&self) -> Option<f64> {
        match (self.budget_min, self.budget_max) {
            (Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
            (Some(lo), None) => Some(lo),
            (None, Some(hi)) => Some(hi),
            (None, None) => None,
        }
    }

    /// Append a line to the error log.
    pub fn log_error(&mut self, line: impl Into<String>) {
        self.error_log.push(line.into());
    }
}

/// Extract a job id from a posting URL.
///
/// Postings use URLs ending in `~0<digits>`; the leading zero is not part
/// of the id.
pub fn job_id_from_url(url: &str) -> Option<String> {
    let re = regex::Regex::new(r"~0?(\d+)").ok()?;
    re.captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
