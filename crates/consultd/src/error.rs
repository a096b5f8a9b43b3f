//! Error types shared across the daemon.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Result type alias using DaemonError.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Transport-independent failure kinds. REST maps them to HTTP statuses,
/// the event transport replies `{success:false, error}` on the ack channel.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Missing/invalid daemon token, or missing provider credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unknown conversation, document, provider or chunk.
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema violation in a payload.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Conversation message cap reached; carries the archive reason.
    #[error("message limit reached: {0}")]
    LimitExceeded(String),

    /// Embedding or provider service failed while reachable was expected.
    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    /// Deadline exceeded after the retry budget.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Anything unclassified. The wire message is redacted; detail is logged.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl DaemonError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ExternalUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(message.into()))
    }

    /// Stable code string for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::LimitExceeded(_) => StatusCode::CONFLICT,
            Self::ExternalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Internal failures are redacted here and logged
    /// in full at the point the response is built.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for DaemonError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<rusqlite::Error> for DaemonError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref source) = self {
            tracing::error!("request failed: {:#}", source);
        }
        let body = serde_json::json!({
            "success": false,
            "error": self.code(),
            "message": self.public_message(),
        });
        (self.status(), Json(body)).into_response()
    }
}
