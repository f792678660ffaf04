use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngestJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl IngestJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestJobStatus::Pending => "pending",
            IngestJobStatus::Running => "running",
            IngestJobStatus::Succeeded => "succeeded",
            IngestJobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestJobStatus::Succeeded | IngestJobStatus::Failed)
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct IngestJobRow {
    pub id: Uuid,
    pub dataset_id: Option<Uuid>,
    pub status: String,
    pub progress_percent: f32,
    pub profiles_total: i32,
    pub profiles_ingested: i32,
    pub error: Option<String>,
    pub retry_count: i32,
    pub retry_at: Option<DateTime<Utc>>,
    pub object_key: Option<String>,
    pub source_filename: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestJobRow {
    pub fn status_enum(&self) -> IngestJobStatus {
        match self.status.as_str() {
            "pending" => IngestJobStatus::Pending,
            "running" => IngestJobStatus::Running,
            "succeeded" => IngestJobStatus::Succeeded,
            "failed" => IngestJobStatus::Failed,
            other => {
                tracing::warn!(status = %other, job_id = %self.id, "unknown ingestion job status; treating as failed");
                IngestJobStatus::Failed
            }
        }
    }

    pub fn to_public(&self) -> IngestJobPublic {
        IngestJobPublic {
            id: self.id.to_string(),
            dataset_id: self.dataset_id.map(|id| id.to_string()),
            status: self.status_enum(),
            progress_percent: self.progress_percent,
            profiles_total: self.profiles_total,
            profiles_ingested: self.profiles_ingested,
            error: self.error.clone(),
            retry_count: self.retry_count,
            source_filename: self.source_filename.clone(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
            started_at: self.started_at.map(|ts| ts.to_rfc3339()),
            completed_at: self.completed_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct IngestJobPublic {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    pub status: IngestJobStatus,
    pub progress_percent: f32,
    pub profiles_total: i32,
    pub profiles_ingested: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: i32,
    pub source_filename: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Tagged outcome of a pipeline stage. Transient failures are retried with
/// backoff; permanent ones fail the job immediately with the message stored.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{0:#}")]
    Transient(anyhow::Error),
    #[error("{0:#}")]
    Permanent(anyhow::Error),
}

impl StageError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        StageError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        StageError::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

impl From<crate::services::argo::parser::ParseError> for StageError {
    fn from(err: crate::services::argo::parser::ParseError) -> Self {
        // Validation problems do not heal on retry.
        StageError::Permanent(err.into())
    }
}

impl From<sqlx::Error> for StageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StageError::Transient(err.into())
            }
            sqlx::Error::Database(db) if db.code().as_deref() == Some("57P01") => {
                // admin_shutdown: connection loss class
                StageError::Transient(err.into())
            }
            _ => StageError::Permanent(err.into()),
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Fixed retry schedule for transient failures.
const BACKOFF_SECONDS: [u64; 3] = [10, 30, 90];

/// Delay before attempt `retry_count + 1`, or `None` once retries are spent.
pub fn backoff_delay(retry_count: u32, max_retries: u32) -> Option<Duration> {
    if retry_count >= max_retries {
        return None;
    }
    let idx = (retry_count as usize).min(BACKOFF_SECONDS.len() - 1);
    Some(Duration::from_secs(BACKOFF_SECONDS[idx]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_10_30_90() {
        assert_eq!(backoff_delay(0, 3), Some(Duration::from_secs(10)));
        assert_eq!(backoff_delay(1, 3), Some(Duration::from_secs(30)));
        assert_eq!(backoff_delay(2, 3), Some(Duration::from_secs(90)));
        assert_eq!(backoff_delay(3, 3), None);
    }

    #[test]
    fn parse_errors_are_permanent() {
        let err: StageError =
            crate::services::argo::parser::ParseError::MissingVariable("PSAL").into();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Missing required variable: PSAL"));
    }

    #[test]
    fn pool_loss_is_transient() {
        let err: StageError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
    }

    #[test]
    fn terminal_statuses() {
        assert!(IngestJobStatus::Succeeded.is_terminal());
        assert!(IngestJobStatus::Failed.is_terminal());
        assert!(!IngestJobStatus::Pending.is_terminal());
        assert!(!IngestJobStatus::Running.is_terminal());
    }
}
