use crate::db::errors::DbError;
use crate::jobs::FailedStep;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed input; never retried
    #[error("{message}")]
    Validation { message: String },

    /// Current state already satisfies or contradicts the request
    #[error("{message}")]
    Conflict { message: String },

    /// Perk or ownership requirement unmet
    #[error("{message}")]
    Authorization { message: String },

    /// The job runner reported a failed job
    #[error("Job '{job}' failed{}", format_failed_steps(.failed_steps))]
    ExternalJob {
        job: String,
        exit_code: Option<i32>,
        failed_steps: Vec<FailedStep>,
    },

    /// Capability token was well formed but is past its expiry
    #[error("The {purpose} link has expired")]
    TokenExpired { purpose: String },

    /// Capability token was malformed, tampered with, or issued for another purpose
    #[error("Invalid {purpose} link")]
    TokenInvalid { purpose: String },

    /// Requested resource not found
    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    /// A custom domain is already the hostname of another active tenant
    #[error("Domain '{domain}' is already linked to site '{tag}'")]
    DomainAlreadyLinked { domain: String, tag: String },

    /// DNS for a custom domain does not point at the platform
    #[error("Domain '{domain}' does not point to '{target}' (add a CNAME record and retry)")]
    CnameNotFound { domain: String, target: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_failed_steps(steps: &[FailedStep]) -> String {
    if steps.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = steps.iter().map(|s| format!("{}@{}: {}", s.step, s.host, s.message)).collect();
    format!(": {}", rendered.join("; "))
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict { message: message.into() }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } | Error::DomainAlreadyLinked { .. } => StatusCode::CONFLICT,
            Error::Authorization { .. } => StatusCode::FORBIDDEN,
            Error::TokenExpired { .. } | Error::TokenInvalid { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::CnameNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ExternalJob { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { constraint, .. } => match constraint.as_deref() {
                    Some(c) if c.contains("hostname") => "This hostname is already in use".to_string(),
                    Some(c) if c.contains("pkey") => "This tag is already taken".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::ExternalJob { job, .. } => format!("Job '{job}' failed"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::ExternalJob { .. } => {
                tracing::warn!("External job error: {}", self);
            }
            Error::Authorization { .. } | Error::TokenExpired { .. } | Error::TokenInvalid { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::Validation { .. } | Error::NotFound { .. } | Error::CnameNotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } | Error::DomainAlreadyLinked { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();
        let body = json!({ "detail": self.user_message() });
        (status, axum::response::Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
