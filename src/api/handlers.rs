use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::lifecycle::{DecisionOutcome, Inconsistency};
use crate::models::database::DatabaseCatalog;
use crate::models::request::{
    Decision, DecisionAction, DbType, Environment, NewRequest, Request, RequestStatus, Size,
};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Serialize)]
pub struct SubmitResponse {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub message: String,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct RequestSummary {
    pub request_id: Uuid,
    pub team_name: String,
    pub db_type: DbType,
    pub environment: Environment,
    pub size: Size,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub purpose: String,
}

impl From<Request> for RequestSummary {
    fn from(r: Request) -> Self {
        Self {
            request_id: r.id,
            team_name: r.team_name,
            db_type: r.db_type,
            environment: r.environment,
            size: r.size,
            status: r.status,
            created_at: r.created_at,
            purpose: r.purpose,
        }
    }
}

#[derive(Serialize)]
pub struct RequestList {
    pub requests: Vec<RequestSummary>,
}

#[derive(Deserialize)]
pub struct ApprovalAction {
    pub request_id: String,
    pub action: String, // "approve" | "reject"
    pub approver: String,
    pub notes: Option<String>,
}

#[derive(Serialize)]
pub struct ReconciliationReport {
    pub inconsistencies: Vec<Inconsistency>,
    pub total_count: usize,
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /: service descriptor
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "Self-Service Database Provisioning",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /requests": "Submit new database request",
            "GET /requests": "List requests (optional ?status=)",
            "GET /requests/:id": "Show one request",
            "POST /approve": "Approve/reject request",
            "GET /databases": "List provisioned databases",
            "GET /reconciliation": "List requests needing manual reconciliation",
        }
    }))
}

/// GET /readyz: store reachability
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.engine.store().ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// POST /requests: submit a new provisioning request
pub async fn submit_request(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let request = state.engine.submit(payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            request_id: request.id,
            status: request.status,
            message: "Request submitted for approval".to_string(),
        }),
    ))
}

/// GET /requests: list requests, optionally filtered by status
pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<RequestList>, AppError> {
    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<RequestStatus>().map_err(AppError::InvalidInput)?),
    };

    let requests = state.engine.list_requests(status).await?;
    Ok(Json(RequestList {
        requests: requests.into_iter().map(RequestSummary::from).collect(),
    }))
}

/// GET /requests/:id: full request record
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id_str): Path<String>,
) -> Result<Json<Request>, AppError> {
    let id = parse_request_id(&id_str)?;
    Ok(Json(state.engine.get_request(id).await?))
}

/// POST /approve: approve or reject a pending request
pub async fn decide(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ApprovalAction>,
) -> Result<Json<DecisionOutcome>, AppError> {
    let id = parse_request_id(&payload.request_id)?;
    let action = payload
        .action
        .parse::<DecisionAction>()
        .map_err(AppError::InvalidInput)?;

    let outcome = state
        .engine
        .decide(
            id,
            Decision {
                action,
                approver: payload.approver,
                notes: payload.notes,
            },
        )
        .await?;
    Ok(Json(outcome))
}

/// GET /databases: active provisioned databases with totals
pub async fn list_databases(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DatabaseCatalog>, AppError> {
    Ok(Json(state.engine.list_databases().await?))
}

/// GET /reconciliation: requests left partially provisioned
pub async fn reconciliation(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReconciliationReport>, AppError> {
    let inconsistencies = state.engine.find_inconsistencies().await?;
    Ok(Json(ReconciliationReport {
        total_count: inconsistencies.len(),
        inconsistencies,
    }))
}

/// A malformed id can never name a stored request.
fn parse_request_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        tracing::warn!("invalid request id: {}", raw);
        AppError::NotFound(raw.to_string())
    })
}
