//! Service error taxonomy with canonical codes.
//!
//! Every error that crosses the service boundary maps to one of the
//! canonical `OPS_AGENT_*` codes. Internal messages are sanitized before
//! they reach a caller; stack traces and collaborator payloads never leak.

use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the investigation service facade.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request failed schema or business-rule validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The caller lacks the required scope.
    #[error("scope forbidden: {0}")]
    ScopeForbidden(String),
    /// The operation conflicts with existing state (duplicate run,
    /// guarded status update that did not apply).
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable conflict description.
        message: String,
        /// The investigation already holding the resource, if any.
        existing_investigation_id: Option<Uuid>,
    },
    /// An external collaborator failed after bounded retries.
    #[error("dependency failure: {0}")]
    Dependency(String),
    /// Anything else. The message is logged but never surfaced verbatim.
    #[error("internal error")]
    Internal(String),
}

impl ServiceError {
    /// Canonical error code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "OPS_AGENT_NOT_FOUND",
            Self::InvalidRequest(_) => "OPS_AGENT_INVALID_REQUEST",
            Self::ScopeForbidden(_) => "OPS_AGENT_SCOPE_FORBIDDEN",
            Self::Conflict { .. } => "OPS_AGENT_CONFLICT",
            Self::Dependency(_) => "OPS_AGENT_DEPENDENCY_FAILURE",
            Self::Internal(_) => "OPS_AGENT_INTERNAL_ERROR",
        }
    }

    /// HTTP status the outer layer should use for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidRequest(_) => 422,
            Self::ScopeForbidden(_) => 403,
            Self::Conflict { .. } => 409,
            Self::Dependency(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Serialize to the `{error, code, details}` envelope.
    ///
    /// Internal errors are replaced with a generic message; everything
    /// else carries its sanitized description.
    pub fn envelope(&self) -> serde_json::Value {
        let message = match self {
            Self::Internal(_) => "internal error".to_owned(),
            other => other.to_string(),
        };
        let details = match self {
            Self::Conflict {
                existing_investigation_id: Some(id),
                ..
            } => json!({ "existing_investigation_id": id }),
            _ => json!({}),
        };
        json!({
            "error": message,
            "code": self.code(),
            "details": details,
        })
    }
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver error.
    #[error("database error: {0}")]
    Database(String),
    /// Row payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Referenced row is absent.
    #[error("row not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}
