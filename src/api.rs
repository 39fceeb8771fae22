use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::pipeline::hosting::parse_owner_repo;
use crate::pipeline::models::{DashboardStats, Issue, IssueStatus, IssueSubmission, Severity, compute_stats, timestamp};
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::store::IssueStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn IssueStore>,
    pub orchestrator: Orchestrator,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct ReportIssueRequest {
    pub title: String,
    pub description: String,
    pub steps_to_reproduce: String,
    pub severity: String,
    pub repo_url: String,
}

#[derive(Serialize)]
pub struct ReportIssueResponse {
    pub issue_id: Uuid,
    pub status: IssueStatus,
}

#[derive(Serialize)]
pub struct IssueListResponse {
    pub total: usize,
    pub issues: Vec<Issue>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::IssueNotFound { id } => ApiError::NotFound(format!("Issue {} not found", id)),
            PipelineError::AlreadyRunning { id } => {
                ApiError::BadRequest(format!("Pipeline already running for issue {}", id))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/issues/report", post(report_issue))
        .route("/api/issues/{id}", get(get_issue))
        .route("/api/dashboard/issues", get(list_issues))
        .route("/api/dashboard/stats", get(get_stats))
        .route("/health", get(health_check))
}

// ── Validation ────────────────────────────────────────────────────────

/// Reject malformed submissions before any record exists.
fn validate(request: ReportIssueRequest) -> Result<IssueSubmission, ApiError> {
    let title = request.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    let description = request.description.trim().to_string();
    if description.is_empty() {
        return Err(ApiError::BadRequest(
            "description must not be empty".to_string(),
        ));
    }
    let steps_to_reproduce = request.steps_to_reproduce.trim().to_string();
    if steps_to_reproduce.is_empty() {
        return Err(ApiError::BadRequest(
            "steps_to_reproduce must not be empty".to_string(),
        ));
    }
    let severity = Severity::from_str(request.severity.trim())
        .map_err(|e| ApiError::BadRequest(e))?;
    let repo_url = request.repo_url.trim().to_string();
    if parse_owner_repo(&repo_url).is_none() {
        return Err(ApiError::BadRequest(format!(
            "repo_url is not a GitHub repository reference: {}",
            repo_url
        )));
    }

    Ok(IssueSubmission {
        title,
        description,
        steps_to_reproduce,
        severity,
        repo_url,
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

/// POST /api/issues/report — create the record and start the pipeline.
/// Returns as soon as the record exists; progress is observable via the
/// query endpoints.
async fn report_issue(
    State(state): State<SharedState>,
    Json(request): Json<ReportIssueRequest>,
) -> Result<(StatusCode, Json<ReportIssueResponse>), ApiError> {
    let submission = validate(request)?;
    let issue = state.orchestrator.submit(submission).await?;
    Ok((
        StatusCode::CREATED,
        Json(ReportIssueResponse {
            issue_id: issue.id,
            status: issue.status,
        }),
    ))
}

/// GET /api/issues/{id}
async fn get_issue(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Issue>, ApiError> {
    let issue = state
        .store
        .find_by_id(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Issue {} not found", id)))?;
    Ok(Json(issue))
}

/// GET /api/dashboard/issues — all records, newest first.
async fn list_issues(
    State(state): State<SharedState>,
) -> Result<Json<IssueListResponse>, ApiError> {
    let issues = state
        .store
        .list_all()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(IssueListResponse {
        total: issues.len(),
        issues,
    }))
}

/// GET /api/dashboard/stats — counts by status and by decision.
async fn get_stats(State(state): State<SharedState>) -> Result<Json<DashboardStats>, ApiError> {
    let issues = state
        .store
        .list_all()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(compute_stats(&issues)))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "timestamp": timestamp() }))
}
