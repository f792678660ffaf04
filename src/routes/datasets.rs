//! Admin ingestion surface: multipart upload, job status, listing and retry.
//! Upload creates the dataset and job rows, stages the raw object, and
//! returns 202 without waiting for the job; the orchestrator picks it up
//! from the queue.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AdminAuth;
use crate::error::{map_db_error, ErrorType};
use crate::services::ingest::{archive, store, writer, IngestJobPublic, IngestJobStatus};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ApiErrorBody {
    pub error_type: ErrorType,
    pub message: String,
    pub suggestion: String,
}

impl ApiErrorBody {
    fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            suggestion: error_type.suggestion().to_string(),
        }
    }
}

type UploadReject = (StatusCode, Json<ApiErrorBody>);

fn reject(status: StatusCode, error_type: ErrorType, message: impl Into<String>) -> UploadReject {
    (status, Json(ApiErrorBody::new(error_type, message)))
}

/// Streams the file field into temporary storage, enforcing the size cap as
/// chunks arrive rather than after buffering the whole body.
async fn spool_field(
    mut field: axum::extract::multipart::Field<'_>,
    max_bytes: u64,
) -> Result<Bytes, UploadReject> {
    use std::io::Write;

    let mut spool = tempfile::NamedTempFile::new().map_err(|err| {
        reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::TransientStoreError,
            format!("failed to open temporary storage: {err}"),
        )
    })?;
    let mut written: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    return Err(reject(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        ErrorType::TooLarge,
                        format!("upload exceeds the {max_bytes} byte limit"),
                    ));
                }
                return Err(reject(
                    StatusCode::BAD_REQUEST,
                    ErrorType::MalformedFile,
                    format!("failed to read upload: {err}"),
                ));
            }
        };
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(reject(
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorType::TooLarge,
                format!("upload exceeds the {max_bytes} byte limit"),
            ));
        }
        spool.write_all(&chunk).map_err(|err| {
            reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorType::TransientStoreError,
                format!("failed to spool upload: {err}"),
            )
        })?;
    }

    let bytes = std::fs::read(spool.path()).map_err(|err| {
        reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::TransientStoreError,
            format!("failed to re-read spooled upload: {err}"),
        )
    })?;
    Ok(Bytes::from(bytes))
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct UploadAccepted {
    pub job_id: String,
    pub dataset_id: String,
    pub status: IngestJobStatus,
}

#[utoipa::path(
    post,
    path = "/api/v1/datasets/upload",
    tag = "datasets",
    responses(
        (status = 202, description = "Upload accepted; ingestion queued", body = UploadAccepted),
        (status = 400, description = "Unsupported file type"),
        (status = 413, description = "Upload too large"),
        (status = 503, description = "Object store unavailable")
    )
)]
pub async fn upload_dataset(
    State(state): State<AppState>,
    AdminAuth(_admin): AdminAuth,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), UploadReject> {
    let max_bytes = state.config.max_upload_bytes;
    let mut file_bytes: Option<Bytes> = None;
    let mut filename: Option<String> = None;
    let mut dataset_name: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                // Body-limit overruns surface as multipart read errors.
                if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    return Err(reject(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        ErrorType::TooLarge,
                        format!("upload exceeds the {max_bytes} byte limit"),
                    ));
                }
                return Err(reject(
                    StatusCode::BAD_REQUEST,
                    ErrorType::MalformedFile,
                    format!("malformed multipart body: {err}"),
                ));
            }
        };

        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                file_bytes = Some(spool_field(field, max_bytes).await?);
            }
            Some("dataset_name") => {
                dataset_name = field
                    .text()
                    .await
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty());
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| {
        reject(
            StatusCode::BAD_REQUEST,
            ErrorType::MalformedFile,
            "multipart field 'file' is required",
        )
    })?;
    let filename = filename
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            reject(
                StatusCode::BAD_REQUEST,
                ErrorType::MalformedFile,
                "uploaded file has no filename",
            )
        })?;

    if !(archive::is_profile_filename(&filename) || archive::is_zip_filename(&filename)) {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            ErrorType::UnsupportedFile,
            format!("unsupported file type for '{filename}'; expected .nc, .nc4 or .zip"),
        ));
    }
    let dataset_id = Uuid::new_v4();
    let job_id = Uuid::new_v4();
    let name = dataset_name.unwrap_or_else(|| {
        filename
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| filename.clone())
    });

    writer::create_dataset(&state.db, dataset_id, &name, &filename)
        .await
        .map_err(|err| {
            let (status, message) = map_db_error(err);
            reject(status, ErrorType::TransientStoreError, message)
        })?;
    let job = store::create_job(&state.db, job_id, dataset_id, &filename)
        .await
        .map_err(|err| {
            let (status, message) = map_db_error(err);
            reject(status, ErrorType::TransientStoreError, message)
        })?;

    // Staging must complete before the job becomes claimable; a staging
    // failure is terminal for this job and surfaces as 503.
    let object_key = crate::services::object_store::ObjectStorage::raw_upload_key(
        dataset_id, &filename,
    );
    if let Err(err) = state.storage.stage(&object_key, bytes).await {
        tracing::error!(job_id = %job_id, error = %err, "object staging failed");
        let _ = store::mark_failed(
            &state.db,
            job_id,
            &format!("object staging failed: {err:#}"),
        )
        .await;
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::TransientStoreError,
            "object store is unavailable; try again shortly",
        ));
    }
    if let Err(err) = store::set_object_key(&state.db, job_id, &object_key).await {
        let (status, message) = map_db_error(err);
        return Err(reject(status, ErrorType::TransientStoreError, message));
    }
    if let Err(err) = writer::set_dataset_object_key(&state.db, dataset_id, &object_key).await {
        tracing::warn!(dataset_id = %dataset_id, error = %err, "failed to record dataset object key");
    }

    tracing::info!(
        job_id = %job_id,
        dataset_id = %dataset_id,
        filename = %filename,
        "upload accepted and staged"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            job_id: job.id.to_string(),
            dataset_id: dataset_id.to_string(),
            status: job.status_enum(),
        }),
    ))
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub job: IngestJobPublic,
}

#[utoipa::path(
    get,
    path = "/api/v1/datasets/jobs/{id}",
    tag = "datasets",
    params(("id" = String, Path, description = "Job id (uuid)")),
    responses(
        (status = 200, description = "Job record", body = JobResponse),
        (status = 404, description = "Not found")
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    AdminAuth(_admin): AdminAuth,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, (StatusCode, String)> {
    let job_id = Uuid::parse_str(&id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid job id".to_string()))?;
    let job = store::get_job(&state.db, job_id)
        .await
        .map_err(map_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Job not found".to_string()))?;
    Ok(Json(JobResponse {
        job: job.to_public(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    #[serde(default)]
    status_filter: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<IngestJobPublic>,
    pub limit: i64,
    pub offset: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/datasets/jobs",
    tag = "datasets",
    params(
        ("status_filter" = Option<String>, Query, description = "pending|running|succeeded|failed"),
        ("limit" = Option<i64>, Query, description = "Page size, capped at 100"),
        ("offset" = Option<i64>, Query, description = "Page offset")
    ),
    responses((status = 200, description = "Job listing", body = JobListResponse))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    AdminAuth(_admin): AdminAuth,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobListResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);
    let status_filter = query
        .status_filter
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(status) = status_filter {
        let known = [
            store::JOB_STATUS_PENDING,
            store::JOB_STATUS_RUNNING,
            store::JOB_STATUS_SUCCEEDED,
            store::JOB_STATUS_FAILED,
        ];
        if !known.contains(&status) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown status filter '{status}'"),
            ));
        }
    }

    let jobs = store::list_jobs(&state.db, status_filter, limit, offset)
        .await
        .map_err(map_db_error)?;
    Ok(Json(JobListResponse {
        jobs: jobs.iter().map(|job| job.to_public()).collect(),
        limit,
        offset,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/datasets/jobs/{id}/retry",
    tag = "datasets",
    params(("id" = String, Path, description = "Job id (uuid)")),
    responses(
        (status = 202, description = "Retry accepted", body = JobResponse),
        (status = 400, description = "Job is not in the failed state"),
        (status = 404, description = "Not found")
    )
)]
pub async fn retry_job(
    State(state): State<AppState>,
    AdminAuth(_admin): AdminAuth,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobResponse>), (StatusCode, String)> {
    let job_id = Uuid::parse_str(&id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid job id".to_string()))?;

    let existing = store::get_job(&state.db, job_id)
        .await
        .map_err(map_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Job not found".to_string()))?;
    if existing.status_enum() != IngestJobStatus::Failed {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("only failed jobs can be retried; job is {}", existing.status),
        ));
    }

    let job = store::retry_failed(&state.db, job_id)
        .await
        .map_err(map_db_error)?
        .ok_or((
            StatusCode::BAD_REQUEST,
            "job left the failed state concurrently".to_string(),
        ))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(JobResponse {
            job: job.to_public(),
        }),
    ))
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DatasetSummary {
    pub id: String,
    pub name: String,
    pub dataset_version: i32,
    pub is_active: bool,
    pub float_count: i32,
    pub profile_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/datasets",
    tag = "datasets",
    responses((status = 200, description = "Dataset listing", body = [DatasetSummary]))
)]
pub async fn list_datasets(
    State(state): State<AppState>,
    AdminAuth(_admin): AdminAuth,
) -> Result<Json<Vec<DatasetSummary>>, (StatusCode, String)> {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: Uuid,
        name: String,
        dataset_version: i32,
        is_active: bool,
        float_count: i32,
        profile_count: i32,
        summary: Option<String>,
    }

    let rows: Vec<Row> = sqlx::query_as(
        r#"
        SELECT id, name, dataset_version, is_active, float_count, profile_count, summary
        FROM datasets
        ORDER BY created_at DESC
        LIMIT 200
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(
        rows.into_iter()
            .map(|row| DatasetSummary {
                id: row.id.to_string(),
                name: row.name,
                dataset_version: row.dataset_version,
                is_active: row.is_active,
                float_count: row.float_count,
                profile_count: row.profile_count,
                summary: row.summary,
            })
            .collect(),
    ))
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DatasetDownload {
    pub url: String,
    pub expires_in_seconds: u64,
}

const DOWNLOAD_TTL_SECONDS: u64 = 900;

/// Presigned link to the raw staged object. The core never deletes raw
/// uploads, so the link is valid for any dataset that finished staging.
#[utoipa::path(
    get,
    path = "/api/v1/datasets/{id}/download",
    tag = "datasets",
    params(("id" = String, Path, description = "Dataset id (uuid)")),
    responses(
        (status = 200, description = "Presigned object URL", body = DatasetDownload),
        (status = 404, description = "Not found or not staged")
    )
)]
pub async fn download_dataset(
    State(state): State<AppState>,
    AdminAuth(_admin): AdminAuth,
    Path(id): Path<String>,
) -> Result<Json<DatasetDownload>, (StatusCode, String)> {
    let dataset_id = Uuid::parse_str(&id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid dataset id".to_string()))?;
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT object_key FROM datasets WHERE id = $1")
            .bind(dataset_id)
            .fetch_optional(&state.db)
            .await
            .map_err(map_db_error)?;
    let object_key = row
        .and_then(|(key,)| key)
        .ok_or((StatusCode::NOT_FOUND, "Dataset has no staged object".to_string()))?;

    let url = state
        .storage
        .presign(
            &object_key,
            std::time::Duration::from_secs(DOWNLOAD_TTL_SECONDS),
        )
        .await
        .map_err(|err| {
            tracing::error!(dataset_id = %dataset_id, error = %err, "presign failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "object store is unavailable".to_string(),
            )
        })?;
    Ok(Json(DatasetDownload {
        url,
        expires_in_seconds: DOWNLOAD_TTL_SECONDS,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/datasets", get(list_datasets))
        .route("/datasets/upload", post(upload_dataset))
        .route("/datasets/jobs", get(list_jobs))
        .route("/datasets/jobs/{id}", get(get_job))
        .route("/datasets/jobs/{id}/retry", post(retry_job))
        .route("/datasets/{id}/download", get(download_dataset))
}
