use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::request::RequestStatus;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("request not found: {0}")]
    NotFound(String),

    #[error("request already {current}")]
    InvalidTransition { id: String, current: RequestStatus },

    #[error("request {id} requires manual reconciliation: {reason}")]
    ProvisioningInconsistency { id: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::ProvisioningInconsistency { .. }
            | AppError::Storage(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, code, msg) = match &self {
            AppError::NotFound(_) => (
                "invalid_request_error",
                "request_not_found",
                "Request not found".to_string(),
            ),
            AppError::InvalidTransition { .. } => (
                "invalid_request_error",
                "invalid_transition",
                self.to_string(),
            ),
            AppError::InvalidInput(reason) => {
                ("invalid_request_error", "invalid_input", reason.clone())
            }
            AppError::ProvisioningInconsistency { .. } => {
                tracing::error!("{}", self);
                (
                    "internal_error",
                    "provisioning_inconsistency",
                    self.to_string(),
                )
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
