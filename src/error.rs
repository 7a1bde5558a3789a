//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Startup-time failures. None of these are recovered automatically.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration conflict: model '{model}' is attached to base '{existing}', cannot attach it to base '{requested}'")]
    Conflict {
        model: String,
        existing: String,
        requested: String,
    },
    #[error("model '{model}' is already attached to base '{base}'")]
    DuplicateAttachment { model: String, base: String },
    #[error("model '{model}' was declared twice against base '{base}' with different definitions")]
    DefinitionMismatch { model: String, base: String },
    #[error("invalid model '{model}': {reason}")]
    InvalidModel { model: String, reason: String },
    #[error("table '{table}' of model '{model}' already belongs to model '{owner}' in base '{base}'")]
    DuplicateTable {
        table: String,
        model: String,
        owner: String,
        base: String,
    },
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("missing setting: {0}")]
    MissingSetting(&'static str),
    #[error("invalid setting {key}: {value}")]
    InvalidSetting { key: &'static str, value: String },
    #[error("no engine configured; call create_engine or set_engine first")]
    EngineNotConfigured,
    #[error("engine already configured")]
    EngineAlreadyConfigured,
    #[error("configuration already committed")]
    AlreadyCommitted,
    #[error("model '{0}' is not attached to any base")]
    NotAttached(String),
    #[error("engine: {0}")]
    Engine(String),
    #[error("request lifecycle layer is not installed on this route")]
    MissingLayer,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("instance of {model} is detached from its session; column '{column}' cannot be loaded")]
    Detached { model: String, column: String },
    #[error("column '{column}' of {model} is expired; refresh it through its session")]
    Expired { model: String, column: String },
    #[error("session is closed")]
    SessionClosed,
    #[error("{model} has no column '{field}'")]
    UnknownField { model: String, field: String },
    #[error("invalid value for {model}.{field}: {reason}")]
    InvalidField {
        model: String,
        field: String,
        reason: String,
    },
    #[error("identity of persisted {0} cannot change")]
    ImmutableIdentity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl AppError {
    /// Failures the transaction manager may retry with a fresh session:
    /// serialization failures, deadlocks and dropped connections.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Db(sqlx::Error::Database(e)) => {
                matches!(e.code().as_deref(), Some("40001") | Some("40P01"))
            }
            AppError::Db(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

/// Marker placed in response extensions when the response was produced from a
/// retryable failure.
#[derive(Clone, Copy, Debug)]
pub struct RetryableFailure;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error(
        "ERROR: The latest migration applied to the DB is {}, but I found a more recent migration \
         on the filesystem: {}. Please upgrade your DB to 'head' or skip this check by setting \
         SKIP_CHECK_DB_MIGRATED=1.",
        display_revision(.current),
        display_revision(.head)
    )]
    Outdated {
        head: Option<String>,
        current: Option<String>,
    },
    #[error("multiple heads in script directory: {}", .0.join(", "))]
    MultipleHeads(Vec<String>),
    #[error("migration history has a cycle through: {}", .0.join(", "))]
    CyclicHistory(Vec<String>),
    #[error("invalid migration script {path}: {reason}")]
    InvalidScript { path: PathBuf, reason: String },
    #[error("revision '{down_revision}' referenced from '{revision}' is not present")]
    MissingDownRevision {
        revision: String,
        down_revision: String,
    },
    #[error("reading scripts: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] AppError),
}

fn display_revision(rev: &Option<String>) -> &str {
    rev.as_deref().unwrap_or("<none>")
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retryable = self.is_retryable();
        let (status, code) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else if retryable {
                    (StatusCode::SERVICE_UNAVAILABLE, "transient_database_error")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::Detached { .. } | AppError::Expired { .. } | AppError::SessionClosed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "session_error")
            }
            AppError::UnknownField { .. } | AppError::InvalidField { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error")
            }
            AppError::ImmutableIdentity(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if retryable {
            response.extensions_mut().insert(RetryableFailure);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outdated_message_names_both_revisions() {
        let err = MigrationError::Outdated {
            head: Some("foo".into()),
            current: Some("bar".into()),
        };
        assert_eq!(
            err.to_string(),
            "ERROR: The latest migration applied to the DB is bar, but I found a more recent \
             migration on the filesystem: foo. Please upgrade your DB to 'head' or skip this \
             check by setting SKIP_CHECK_DB_MIGRATED=1."
        );
    }

    #[test]
    fn dropped_connection_is_retryable() {
        let err = AppError::Db(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.is_retryable());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.extensions().get::<RetryableFailure>().is_some());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let response = AppError::NotFound("user".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<RetryableFailure>().is_none());
    }
}
