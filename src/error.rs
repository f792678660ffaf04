use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt::Display;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Error classes surfaced to clients. Every user-visible error carries one of
/// these tags; presentation layers key canned strings off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ValidationFailure,
    GenerationFailure,
    ExecutionError,
    Timeout,
    ConfigurationError,
    UnsupportedFile,
    TooLarge,
    MalformedFile,
    TransientStoreError,
    PermanentIngestError,
    Cancelled,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ValidationFailure => "validation_failure",
            ErrorType::GenerationFailure => "generation_failure",
            ErrorType::ExecutionError => "execution_error",
            ErrorType::Timeout => "timeout",
            ErrorType::ConfigurationError => "configuration_error",
            ErrorType::UnsupportedFile => "unsupported_file",
            ErrorType::TooLarge => "too_large",
            ErrorType::MalformedFile => "malformed_file",
            ErrorType::TransientStoreError => "transient_store_error",
            ErrorType::PermanentIngestError => "permanent_ingest_error",
            ErrorType::Cancelled => "cancelled",
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorType::ValidationFailure => {
                "Try rephrasing the question; only read-only queries over the float tables are allowed."
            }
            ErrorType::GenerationFailure => {
                "The model could not produce a usable query. Try a simpler or more specific question."
            }
            ErrorType::ExecutionError => {
                "The query failed while running. Narrow the time range or region and try again."
            }
            ErrorType::Timeout => {
                "The query took too long. Add a time range or spatial filter to reduce the data scanned."
            }
            ErrorType::ConfigurationError => {
                "The service is missing required configuration. Contact an administrator."
            }
            ErrorType::UnsupportedFile => "Only .nc, .nc4 and .zip uploads are accepted.",
            ErrorType::TooLarge => "The upload exceeds the configured size limit.",
            ErrorType::MalformedFile => "The file could not be parsed as an ARGO profile file.",
            ErrorType::TransientStoreError => "A backing store hiccuped; the job will be retried.",
            ErrorType::PermanentIngestError => {
                "Ingestion failed permanently; inspect the job error log."
            }
            ErrorType::Cancelled => "The query was cancelled before execution.",
        }
    }
}

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

pub fn map_db_error(err: sqlx::Error) -> (StatusCode, String) {
    let status = match &err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StatusCode::CONFLICT,    // unique_violation
            Some("23503") => StatusCode::BAD_REQUEST, // foreign_key_violation
            Some("23502") => StatusCode::BAD_REQUEST, // not_null_violation
            Some("22P02") => StatusCode::BAD_REQUEST, // invalid_text_representation
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::error!(error = %err, status = %status, "database error");

    let message = match status {
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::CONFLICT => "Resource already exists",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Database error",
    };

    (status, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_tags_are_stable() {
        assert_eq!(ErrorType::ValidationFailure.as_str(), "validation_failure");
        assert_eq!(ErrorType::TransientStoreError.as_str(), "transient_store_error");
        assert_eq!(
            serde_json::to_value(ErrorType::GenerationFailure).unwrap(),
            serde_json::json!("generation_failure")
        );
    }

    #[test]
    fn every_error_type_has_a_suggestion() {
        let all = [
            ErrorType::ValidationFailure,
            ErrorType::GenerationFailure,
            ErrorType::ExecutionError,
            ErrorType::Timeout,
            ErrorType::ConfigurationError,
            ErrorType::UnsupportedFile,
            ErrorType::TooLarge,
            ErrorType::MalformedFile,
            ErrorType::TransientStoreError,
            ErrorType::PermanentIngestError,
            ErrorType::Cancelled,
        ];
        for tag in all {
            assert!(!tag.suggestion().is_empty());
        }
    }
}
