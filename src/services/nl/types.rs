use serde::Serialize;

use crate::error::ErrorType;

/// Structured query-path failure. `error_type` is always one of the taxonomy
/// tags; `suggestion` is the canned hint presentation layers show.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QueryError {
    pub error_type: ErrorType,
    pub message: String,
    pub suggestion: String,
}

impl QueryError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            suggestion: error_type.suggestion().to_string(),
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type.as_str(), self.message)
    }
}

/// Output of the generation pipeline before any execution happens.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub interpretation: String,
    pub session_id: String,
    pub attempt_count: u32,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ProviderBenchmark {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub valid: bool,
    pub validation_errors: Vec<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
