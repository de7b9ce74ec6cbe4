//! Error types for the Merathon server.
//!
//! [`ApiError`] is the single error type returned by route handlers. Each
//! variant maps to one HTTP status and a stable machine-readable code:
//!
//! | Variant | Status | Code |
//! |---------|--------|------|
//! | `Validation` | 400 | `validation_error` |
//! | `InvalidId` | 400 | `invalid_id` |
//! | `NotFound` | 404 | `not_found` |
//! | `Unauthorized` | 401 | `unauthorized` |
//! | `Forbidden` | 403 | `forbidden` |
//! | `Store` | 500 | `store_error` |
//! | `Upstream` | 500 | `upstream_error` |
//! | `Internal` | 500 | `internal_error` |
//!
//! The response body is always `{"error": "...", "code": "..."}`.
//!
//! # Example
//!
//! ```rust
//! use merathon_server::error::ApiError;
//!
//! let err = ApiError::validation("missing required fields: title");
//! assert!(err.is_client_error());
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::auth::AuthError;
use crate::chat::ChatError;
use crate::store::StoreError;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Required input is missing or unparseable.
    #[error("{0}")]
    Validation(String),

    /// A path id is not a well-formed record identifier.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// The addressed record does not exist.
    #[error("{0}")]
    NotFound(String),

    /// No session credential, or it failed verification.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The session is valid but does not own the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The completion service failed.
    #[error("upstream error: {0}")]
    Upstream(#[from] ChatError),

    /// Anything else that is the server's fault.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_id(id: impl Into<String>) -> Self {
        Self::InvalidId(id.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Builds a validation error listing missing fields.
    ///
    /// ```rust
    /// use merathon_server::error::ApiError;
    ///
    /// let err = ApiError::missing_fields(&["title", "image"]);
    /// assert_eq!(err.to_string(), "missing required fields: title, image");
    /// ```
    pub fn missing_fields(fields: &[&str]) -> Self {
        Self::Validation(format!("missing required fields: {}", fields.join(", ")))
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Store(_) | Self::Upstream(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable code clients can match on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidId(_) => "invalid_id",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Store(_) => "store_error",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::Expired => {
                Self::Unauthorized(err.to_string())
            }
            AuthError::NotOwner => Self::Forbidden(err.to_string()),
            AuthError::MissingEmail => Self::Validation(err.to_string()),
            AuthError::Signing(_) => Self::Internal(err.to_string()),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server faults keep their detail in the log, not the response.
        let message = if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
            match &self {
                Self::Upstream(_) => "chat service request failed".to_string(),
                Self::Store(_) => "database operation failed".to_string(),
                _ => "internal server error".to_string(),
            }
        } else {
            debug!(error = %self, code = self.code(), "Request rejected");
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}

/// A specialized Result type for route handlers.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ApiError::validation("email is required");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "validation_error");
        assert_eq!(err.to_string(), "email is required");
    }

    #[test]
    fn invalid_id_maps_to_bad_request() {
        let err = ApiError::invalid_id("not-an-id");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "invalid id: not-an-id");
    }

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::unauthorized("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(StoreError::decode("bad document")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(ChatError::EmptyReply).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn missing_fields_lists_names() {
        let err = ApiError::missing_fields(&["location", "distance"]);
        assert_eq!(
            err.to_string(),
            "missing required fields: location, distance"
        );
    }

    #[test]
    fn auth_errors_map_to_expected_variants() {
        assert!(matches!(
            ApiError::from(AuthError::MissingToken),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from(AuthError::Expired),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from(AuthError::NotOwner),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::from(AuthError::MissingEmail),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(AuthError::Signing("boom".to_string())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn client_and_server_errors_are_distinguished() {
        assert!(ApiError::validation("x").is_client_error());
        assert!(ApiError::forbidden("x").is_client_error());
        assert!(!ApiError::internal("x").is_client_error());
    }

    #[tokio::test]
    async fn server_error_body_hides_detail() {
        let response = ApiError::from(StoreError::decode("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.code, "store_error");
        assert!(!body.error.contains("secret detail"));
    }

    #[tokio::test]
    async fn client_error_body_carries_message() {
        let response = ApiError::missing_fields(&["image"]).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.code, "validation_error");
        assert_eq!(body.error, "missing required fields: image");
    }
}
