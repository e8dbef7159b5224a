use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

pub mod ledger;

pub use ledger::{Disposition, LedgerError};

const RETRY_AFTER_SECONDS: &str = "5";

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    TenantScopeRequired,
    ServiceUnavailable { code: &'static str, message: String },
    IntegrityViolation(String),
    InternalServerError(anyhow::Error),
    Validation(Vec<String>),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = false;
        let (status, error_message, code, details) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND".to_string(), None),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                msg,
                "BAD_REQUEST".to_string(),
                None,
            ),
            AppError::TenantScopeRequired => (
                StatusCode::BAD_REQUEST,
                "Tenant scope is required".to_string(),
                "TENANT_SCOPE_REQUIRED".to_string(),
                None,
            ),
            AppError::ServiceUnavailable { code, message } => {
                tracing::warn!(code, error = %message, "Backend temporarily unavailable");
                retry_after = true;
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                    code.to_string(),
                    None,
                )
            }
            AppError::IntegrityViolation(msg) => {
                tracing::error!(alert = true, error = %msg, "Integrity violation");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Stored data failed its integrity check".to_string(),
                    "INTEGRITY_ERROR".to_string(),
                    None,
                )
            }
            AppError::InternalServerError(err) => {
                tracing::error!("Internal server error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_SERVER_ERROR".to_string(),
                    None,
                )
            }
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                "Validation failed".to_string(),
                "VALIDATION_ERROR".to_string(),
                Some(serde_json::json!({ "errors": errors })),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code,
            details,
        });

        let mut response = (status, body).into_response();
        if retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECONDS));
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalServerError(err)
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(msg) => AppError::Validation(vec![msg]),
            LedgerError::NotFound(msg) => AppError::NotFound(msg),
            LedgerError::Integrity(msg) => AppError::IntegrityViolation(msg),
            LedgerError::Transient(msg) => AppError::ServiceUnavailable {
                code: "SERVICE_UNAVAILABLE",
                message: msg,
            },
            err @ LedgerError::PartitionMissing { .. } => AppError::ServiceUnavailable {
                code: "PARTITION_UNAVAILABLE",
                message: err.to_string(),
            },
            LedgerError::Storage(err) => AppError::InternalServerError(err.into()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let code = e.code.as_ref();
                    format!("{}: {}", field, code)
                })
            })
            .collect();
        AppError::Validation(messages)
    }
}
