//! Application error types and the JSON error envelope.
//!
//! Every failure leaves the API as `{error, code, message?, details?}` with a
//! stable `code`.

use axum::extract::FromRequest;
use axum::extract::FromRequestParts;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use marquee_core::agent::AgentError;
use marquee_core::auth::AuthError;
use marquee_core::store::StoreError;
use marquee_core::tenancy::TenancyError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level errors with HTTP status and code mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Token missing")]
    TokenMissing,

    #[error("Token malformed")]
    TokenMalformed,

    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    #[error("Session invalidated")]
    SessionInvalidated,

    #[error("Authentication required")]
    AuthRequired,

    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),

    #[error("Theater not found: {0}")]
    TheaterNotFound(String),

    #[error("Theater inactive: {0}")]
    TheaterInactive(String),

    #[error("Theater access denied: {0}")]
    TheaterAccessDenied(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Database not ready: {0}")]
    DatabaseNotReady(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::TokenMissing => "TOKEN_MISSING",
            AppError::TokenMalformed => "TOKEN_MALFORMED",
            AppError::TokenInvalid(_) => "TOKEN_INVALID",
            AppError::SessionInvalidated => "SESSION_INVALIDATED",
            AppError::AuthRequired => "AUTH_REQUIRED",
            AppError::InsufficientPermissions(_) => "INSUFFICIENT_PERMISSIONS",
            AppError::TheaterNotFound(_) => "THEATER_NOT_FOUND",
            AppError::TheaterInactive(_) => "THEATER_INACTIVE",
            AppError::TheaterAccessDenied(_) => "THEATER_ACCESS_DENIED",
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::InvalidPin => "INVALID_PIN",
            AppError::DatabaseNotReady(_) => "DATABASE_NOT_READY",
            AppError::Duplicate(_) => "DUPLICATE",
            AppError::Validation { .. } => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::TokenMissing
            | AppError::TokenMalformed
            | AppError::TokenInvalid(_)
            | AppError::SessionInvalidated
            | AppError::AuthRequired
            | AppError::InvalidCredentials
            | AppError::InvalidPin => StatusCode::UNAUTHORIZED,
            AppError::InsufficientPermissions(_)
            | AppError::TheaterInactive(_)
            | AppError::TheaterAccessDenied(_) => StatusCode::FORBIDDEN,
            AppError::TheaterNotFound(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::DatabaseNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Duplicate(_) => StatusCode::CONFLICT,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire shape of an error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (error, message, details) = match self {
            AppError::Internal(detail) => {
                error!(code, "internal error: {detail}");
                ("Internal server error".to_string(), None, None)
            }
            AppError::Validation { message, details } => (
                "Validation error".to_string(),
                Some(message),
                (!details.is_empty()).then_some(details),
            ),
            AppError::DatabaseNotReady(detail) => {
                warn!(code, "database not ready: {detail}");
                (
                    "Database not ready".to_string(),
                    Some("The database is not reachable yet, retry shortly".to_string()),
                    None,
                )
            }
            other => (other.to_string(), None, None),
        };
        let body = Json(ErrorBody {
            error,
            code,
            message,
            details,
        });
        (status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => AppError::DatabaseNotReady(msg),
            StoreError::Conflict(msg) => AppError::Duplicate(msg),
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::TokenMissing => AppError::TokenMissing,
            AuthError::TokenMalformed => AppError::TokenMalformed,
            AuthError::TokenInvalid(msg) => AppError::TokenInvalid(msg),
            AuthError::SessionInvalidated => AppError::SessionInvalidated,
            AuthError::InvalidCredentials => AppError::InvalidCredentials,
            AuthError::InvalidPin => AppError::InvalidPin,
            AuthError::TheaterInactive => AppError::TheaterInactive("theater is inactive".into()),
            AuthError::Store(e) => AppError::from(e),
            AuthError::Config(msg) | AuthError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<TenancyError> for AppError {
    fn from(e: TenancyError) -> Self {
        match e {
            TenancyError::AuthRequired => AppError::AuthRequired,
            TenancyError::TheaterNotFound(id) => AppError::TheaterNotFound(id.to_string()),
            TenancyError::TheaterInactive(id) => AppError::TheaterInactive(id.to_string()),
            TenancyError::AccessDenied(id) => AppError::TheaterAccessDenied(id.to_string()),
            TenancyError::InsufficientPermissions(page) => AppError::InsufficientPermissions(page),
            TenancyError::Store(e) => AppError::from(e),
        }
    }
}

impl From<AgentError> for AppError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Unauthorized(_) => AppError::InvalidCredentials,
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation {
            message: "Malformed request body".into(),
            details: vec![rejection.body_text()],
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation {
            message: "Malformed query string".into(),
            details: vec![rejection.body_text()],
        }
    }
}

/// `Json` extractor whose rejection is an [`AppError`] envelope.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// `Query` extractor whose rejection is an [`AppError`] envelope.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn envelope_carries_code_and_details() {
        let (status, json) = body_json(AppError::Validation {
            message: "bad order".into(),
            details: vec!["items must not be empty".into()],
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert_eq!(json["message"], "bad order");
        assert_eq!(json["details"][0], "items must not be empty");
    }

    #[tokio::test]
    async fn internal_details_are_not_rendered() {
        let (status, json) = body_json(AppError::Internal("pool exploded at 0xdead".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "INTERNAL_ERROR");
        assert!(!json.to_string().contains("0xdead"));
    }

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let unavailable = AppError::from(StoreError::Unavailable("down".into()));
        assert_eq!(unavailable.code(), "DATABASE_NOT_READY");
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AppError::from(StoreError::Conflict("k".into())).code(), "DUPLICATE");
    }

    #[test]
    fn tenancy_errors_map_onto_taxonomy() {
        let denied = AppError::from(TenancyError::AccessDenied("T2".into()));
        assert_eq!(denied.code(), "THEATER_ACCESS_DENIED");
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::from(TenancyError::TheaterNotFound("T9".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
