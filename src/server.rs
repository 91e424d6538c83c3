//! Control-plane HTTP + WebSocket server.
//!
//! Thin transport over the orchestrator: every route maps to one of the
//! control operations (trigger ingestion, process jobs, decisions, status
//! override, task snapshots, mode get/set). `/ws/tasks` streams live
//! registry events so dashboards don't need to poll.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalRouter, DecisionTarget};
use crate::config::SubmissionMode;
use crate::error::{ApprovalError, Error, IngestError, JobError, SubmitError};
use crate::model::JobStatus;
use crate::pipeline::{IngestRequest, Orchestrator};
use crate::registry::TaskCategory;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub decisions: Arc<ApprovalRouter>,
}

/// Build the Axum router for the control plane.
pub fn control_routes(orchestrator: Arc<Orchestrator>, decisions: Arc<ApprovalRouter>) -> Router {
    let state = AppState {
        orchestrator,
        decisions,
    };

    Router::new()
        .route("/health", get(health))
        .route("/ws/tasks", get(ws_tasks))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/stats", get(job_stats))
        .route("/api/jobs/delete", post(bulk_delete))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/approve", post(approve_job))
        .route("/api/jobs/{id}/reject", post(reject_job))
        .route("/api/jobs/{id}/edit", post(edit_job))
        .route("/api/jobs/{id}/submit", post(submit_job))
        .route("/api/jobs/{id}/status", post(override_status))
        .route("/api/pipeline/trigger", post(trigger_pipeline))
        .route("/api/pipeline/process", post(process_jobs))
        .route("/api/pipeline/auto-process", post(auto_process))
        .route("/api/tasks", get(active_tasks))
        .route("/api/config/mode", get(get_mode).put(set_mode))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// HTTP projection of pipeline errors.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Job(JobError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Error::Job(JobError::UnknownStatus(_)) => StatusCode::BAD_REQUEST,
            Error::Submit(SubmitError::AlreadyInFlight { .. })
            | Error::Submit(SubmitError::NotSubmittable { .. }) => StatusCode::CONFLICT,
            Error::Ingest(IngestError::RunInProgress) => StatusCode::CONFLICT,
            Error::Ingest(IngestError::UnknownSource(_)) => StatusCode::BAD_REQUEST,
            Error::Ingest(IngestError::NoResults { .. })
            | Error::Ingest(IngestError::MalformedQuery { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::Approval(ApprovalError::UnknownRef(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "gigflow"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JobsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(s.parse::<JobStatus>().map_err(Error::from)?),
        None => None,
    };
    let jobs = state
        .orchestrator
        .store()
        .list_jobs(status, query.limit.unwrap_or(100))
        .await
        .map_err(Error::from)?;
    Ok(Json(jobs))
}

async fn job_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let counts = state
        .orchestrator
        .store()
        .status_counts()
        .await
        .map_err(Error::from)?;
    let by_status: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, count)| (status, serde_json::json!(count)))
        .collect();
    Ok(Json(serde_json::json!({ "by_status": by_status })))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .store()
        .get_job(&id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .orchestrator
        .store()
        .delete_job(&id)
        .await
        .map_err(Error::from)?;
    if !deleted {
        return Err(ApiError::not_found(format!("job {id} not found")));
    }
    info!(job_id = %id, "Job deleted by operator");
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct BulkDeleteBody {
    job_ids: Vec<String>,
}

async fn bulk_delete(
    State(state): State<AppState>,
    Json(body): Json<BulkDeleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut deleted = 0usize;
    for id in &body.job_ids {
        if state
            .orchestrator
            .store()
            .delete_job(id)
            .await
            .map_err(Error::from)?
        {
            deleted += 1;
        }
    }
    info!(deleted, requested = body.job_ids.len(), "Bulk delete");
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// ── Decisions ───────────────────────────────────────────────────────────

async fn approve_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .decisions
        .on_decision(DecisionTarget::JobId(id.clone()), ApprovalDecision::Approve)
        .await?;
    Ok(Json(serde_json::json!({ "job_id": id, "status": status })))
}

async fn reject_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .decisions
        .on_decision(DecisionTarget::JobId(id.clone()), ApprovalDecision::Reject)
        .await?;
    Ok(Json(serde_json::json!({ "job_id": id, "status": status })))
}

#[derive(Deserialize)]
struct EditBody {
    proposal_text: String,
}

async fn edit_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EditBody>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .decisions
        .on_decision(
            DecisionTarget::JobId(id.clone()),
            ApprovalDecision::Edit {
                proposal_text: body.proposal_text,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({ "job_id": id, "status": status })))
}

async fn submit_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.agent().submit(&id).await?;
    Ok(Json(
        serde_json::json!({ "job_id": id, "status": JobStatus::Submitting }),
    ))
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

async fn override_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let target = body.status.parse::<JobStatus>().map_err(Error::from)?;
    let job = state.orchestrator.force_status(&id, target).await?;
    Ok(Json(
        serde_json::json!({ "job_id": id, "status": job.status }),
    ))
}

// ── Pipeline control ────────────────────────────────────────────────────

async fn trigger_pipeline(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.orchestrator.trigger_ingestion(request).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ProcessBody {
    job_ids: Vec<String>,
    min_score: Option<i64>,
}

async fn process_jobs(
    State(state): State<AppState>,
    Json(body): Json<ProcessBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.job_ids.is_empty() {
        return Err(ApiError::bad_request("no job ids provided"));
    }
    let accepted = body.job_ids.len();
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator.process_jobs(body.job_ids, body.min_score).await;
    });
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

async fn auto_process(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let count = state.orchestrator.auto_process().await?;
    Ok(Json(serde_json::json!({ "processed": count })))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TasksQuery {
    category: Option<String>,
}

async fn active_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let category = match query.category.as_deref() {
        Some(raw) => Some(
            raw.parse::<TaskCategory>()
                .map_err(|e| ApiError::bad_request(e))?,
        ),
        None => None,
    };

    let mut body = serde_json::Map::new();
    if category.is_none() || category == Some(TaskCategory::AssetGeneration) {
        let tasks = state.orchestrator.gen_registry().snapshot().await;
        body.insert("asset_generation".into(), serde_json::json!(tasks));
    }
    if category.is_none() || category == Some(TaskCategory::Submission) {
        let tasks = state.orchestrator.agent().registry().snapshot().await;
        body.insert("submission".into(), serde_json::json!(tasks));
    }
    Ok(Json(serde_json::Value::Object(body)))
}

// ── Mode ────────────────────────────────────────────────────────────────

async fn get_mode(State(state): State<AppState>) -> impl IntoResponse {
    let (mode, version) = state.orchestrator.mode().current_versioned();
    Json(serde_json::json!({ "mode": mode, "version": version }))
}

#[derive(Deserialize)]
struct ModeBody {
    mode: String,
}

async fn set_mode(
    State(state): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = body
        .mode
        .parse::<SubmissionMode>()
        .map_err(ApiError::bad_request)?;
    let version = state.orchestrator.mode().set(mode);
    Ok(Json(serde_json::json!({ "mode": mode, "version": version })))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_tasks(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Task WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let gen_registry = Arc::clone(state.orchestrator.gen_registry());
    let sub_registry = Arc::clone(state.orchestrator.agent().registry());

    // Send the current snapshots on connect so late joiners see in-flight
    // work immediately.
    let sync = serde_json::json!({
        "type": "sync",
        "asset_generation": gen_registry.snapshot().await,
        "submission": sub_registry.snapshot().await,
    });
    if let Ok(json) = serde_json::to_string(&sync) {
        if socket.send(Message::Text(json.into())).await.is_err() {
            warn!("Failed to send initial sync, client disconnected");
            return;
        }
    }

    let mut gen_rx = gen_registry.subscribe();
    let mut sub_rx = sub_registry.subscribe();

    loop {
        tokio::select! {
            event = gen_rx.recv() => {
                if !forward_event(&mut socket, event).await {
                    break;
                }
            }
            event = sub_rx.recv() => {
                if !forward_event(&mut socket, event).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Task WS client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {} // Inbound frames are ignored.
                    Some(Err(e)) => {
                        debug!("Task WS receive error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Forward one broadcast event; returns false when the socket is gone.
async fn forward_event(
    socket: &mut WebSocket,
    event: Result<crate::registry::TaskEvent, tokio::sync::broadcast::error::RecvError>,
) -> bool {
    use tokio::sync::broadcast::error::RecvError;

    match event {
        Ok(event) => {
            if let Ok(json) = serde_json::to_string(&event) {
                if socket.send(Message::Text(json.into())).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(RecvError::Lagged(missed)) => {
            warn!(missed, "Task WS client lagged behind broadcast");
            true
        }
        Err(RecvError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGateway;
    use crate::config::{ModeController, PipelineConfig};
    use crate::error::StageError;
    use crate::model::{JobRecord, JobSource};
    use crate::pipeline::{Ingestor, JobLocks};
    use crate::registry::{ActiveTaskRegistry, TaskHandle};
    use crate::stage::{Stage, StageExecutor, StageSet, StageUpdate};
    use crate::store::{Database, LibSqlBackend};
    use crate::submit::{SubmissionAgent, Submitter};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubStage(Stage);

    #[async_trait]
    impl StageExecutor for StubStage {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn run(&self, _job: &JobRecord) -> Result<StageUpdate, StageError> {
            Ok(StageUpdate::default())
        }
    }

    struct StubGateway;

    #[async_trait]
    impl ApprovalGateway for StubGateway {
        async fn request_approval(
            &self,
            job: &JobRecord,
        ) -> Result<String, crate::error::ApprovalError> {
            Ok(format!("ref-{}", job.job_id))
        }
    }

    struct StubSubmitter;

    #[async_trait]
    impl Submitter for StubSubmitter {
        async fn submit(
            &self,
            _job: &JobRecord,
            _progress: &TaskHandle,
        ) -> Result<serde_json::Value, crate::error::SubmitError> {
            Ok(serde_json::json!({}))
        }
    }

    async fn state() -> AppState {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let locks = JobLocks::new();
        let mode = Arc::new(ModeController::default());
        let agent = SubmissionAgent::new(
            Arc::clone(&store),
            ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_secs(60)),
            Arc::new(StubSubmitter),
            Arc::clone(&locks),
            Duration::from_secs(5),
        );
        let decisions = Arc::new(ApprovalRouter::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&mode),
            Arc::clone(&agent),
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            StageSet {
                scorer: Arc::new(StubStage(Stage::Score)),
                extractor: Arc::new(StubStage(Stage::Extract)),
                generator: Arc::new(StubStage(Stage::Generate)),
                booster: Arc::new(StubStage(Stage::DecideBoost)),
            },
            Arc::new(StubGateway),
            agent,
            ActiveTaskRegistry::new(TaskCategory::AssetGeneration, Duration::from_secs(60)),
            mode,
            locks,
            Ingestor::new(Arc::clone(&store)),
            PipelineConfig::default(),
        );
        AppState {
            orchestrator,
            decisions,
        }
    }

    #[tokio::test]
    async fn router_builds() {
        let state = state().await;
        let _router = control_routes(state.orchestrator, state.decisions);
    }

    #[tokio::test]
    async fn mode_roundtrip_through_handlers() {
        let state = state().await;

        set_mode(
            State(state.clone()),
            Json(ModeBody {
                mode: "automatic".into(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            state.orchestrator.mode().current(),
            SubmissionMode::Automatic
        );
    }

    #[tokio::test]
    async fn set_mode_rejects_unknown_value() {
        let state = state().await;
        let err = set_mode(
            State(state),
            Json(ModeBody {
                mode: "warp".into(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn override_status_validates_target() {
        let state = state().await;
        let job = JobRecord::new("1", "https://example.com/jobs/~01", JobSource::Manual);
        state.orchestrator.store().insert_job(&job).await.unwrap();

        override_status(
            State(state.clone()),
            Path("1".into()),
            Json(StatusBody {
                status: "approved".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            state
                .orchestrator
                .store()
                .get_job("1")
                .await
                .unwrap()
                .unwrap()
                .status,
            JobStatus::Approved
        );

        let err = override_status(
            State(state),
            Path("1".into()),
            Json(StatusBody {
                status: "launched".into(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_jobs_rejects_unknown_status_filter() {
        let state = state().await;
        let err = list_jobs(
            State(state),
            Query(JobsQuery {
                status: Some("bogus".into()),
                limit: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approve_missing_job_is_not_found() {
        let state = state().await;
        let err = approve_job(State(state), Path("ghost".into()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
