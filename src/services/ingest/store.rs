use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::types::IngestJobRow;

pub const JOB_STATUS_PENDING: &str = "pending";
pub const JOB_STATUS_RUNNING: &str = "running";
pub const JOB_STATUS_SUCCEEDED: &str = "succeeded";
pub const JOB_STATUS_FAILED: &str = "failed";

const JOB_COLUMNS: &str = r#"
    id, dataset_id, status, progress_percent, profiles_total, profiles_ingested,
    error, retry_count, retry_at, object_key, source_filename,
    created_at, updated_at, started_at, completed_at
"#;

pub async fn create_job(
    db: &PgPool,
    job_id: Uuid,
    dataset_id: Uuid,
    source_filename: &str,
) -> Result<IngestJobRow, sqlx::Error> {
    let row: IngestJobRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO ingestion_jobs (id, dataset_id, status, source_filename, created_at, updated_at)
        VALUES ($1, $2, $3, $4, now(), now())
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(dataset_id)
    .bind(JOB_STATUS_PENDING)
    .bind(source_filename)
    .fetch_one(db)
    .await?;

    append_event(
        db,
        row.id,
        "created",
        serde_json::json!({ "source_filename": row.source_filename }),
    )
    .await?;
    Ok(row)
}

pub async fn set_object_key(db: &PgPool, job_id: Uuid, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE ingestion_jobs
        SET object_key = $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(key)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_job(db: &PgPool, job_id: Uuid) -> Result<Option<IngestJobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM ingestion_jobs
        WHERE id = $1
        LIMIT 1
        "#
    ))
    .bind(job_id)
    .fetch_optional(db)
    .await
}

pub async fn list_jobs(
    db: &PgPool,
    status_filter: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<IngestJobRow>, sqlx::Error> {
    let limit = limit.clamp(1, 100);
    let offset = offset.max(0);
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM ingestion_jobs
        WHERE ($1::TEXT IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(status_filter)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await
}

/// Claims the oldest dispatchable pending job, moving it to `running` in the
/// same transaction so concurrent workers never double-claim.
pub async fn claim_next_pending(db: &PgPool) -> Result<Option<IngestJobRow>, sqlx::Error> {
    let mut tx = db.begin().await?;
    let claimed: Option<IngestJobRow> = sqlx::query_as(&format!(
        r#"
        WITH next AS (
            SELECT id
            FROM ingestion_jobs
            WHERE status = $1
              AND (retry_at IS NULL OR retry_at <= now())
              AND object_key IS NOT NULL
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE ingestion_jobs
        SET status = $2,
            started_at = now(),
            updated_at = now()
        WHERE id IN (SELECT id FROM next)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(JOB_STATUS_PENDING)
    .bind(JOB_STATUS_RUNNING)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(job) = &claimed {
        sqlx::query(
            r#"
            INSERT INTO ingestion_job_events (job_id, kind, payload, created_at)
            VALUES ($1, 'started', $2, now())
            "#,
        )
        .bind(job.id)
        .bind(SqlJson(serde_json::json!({ "retry_count": job.retry_count })))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(claimed)
}

pub async fn update_progress(
    db: &PgPool,
    job_id: Uuid,
    percent: f32,
    profiles_total: i32,
    profiles_ingested: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE ingestion_jobs
        SET progress_percent = $2,
            profiles_total = $3,
            profiles_ingested = $4,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(percent.clamp(0.0, 100.0))
    .bind(profiles_total)
    .bind(profiles_ingested)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn mark_succeeded(db: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        UPDATE ingestion_jobs
        SET status = $2,
            progress_percent = 100,
            error = NULL,
            completed_at = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_SUCCEEDED)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO ingestion_job_events (job_id, kind, payload, created_at)
        VALUES ($1, 'succeeded', '{}', now())
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn mark_failed(db: &PgPool, job_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        UPDATE ingestion_jobs
        SET status = $2,
            error = $3,
            completed_at = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_FAILED)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO ingestion_job_events (job_id, kind, payload, created_at)
        VALUES ($1, 'failed', $2, now())
        "#,
    )
    .bind(job_id)
    .bind(SqlJson(serde_json::json!({ "error": error })))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Returns a transient failure to `pending` with a delay; the claim query
/// skips the job until `retry_at` passes.
pub async fn schedule_retry(
    db: &PgPool,
    job_id: Uuid,
    delay: Duration,
    error: &str,
) -> Result<(), sqlx::Error> {
    let retry_at: DateTime<Utc> = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        UPDATE ingestion_jobs
        SET status = $2,
            error = $3,
            retry_count = retry_count + 1,
            retry_at = $4,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_PENDING)
    .bind(error)
    .bind(retry_at)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO ingestion_job_events (job_id, kind, payload, created_at)
        VALUES ($1, 'retry_scheduled', $2, now())
        "#,
    )
    .bind(job_id)
    .bind(SqlJson(serde_json::json!({
        "error": error,
        "retry_at": retry_at.to_rfc3339(),
    })))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Admin retry. Only `failed` jobs move back to `pending`; anything else
/// returns `None` so the route can answer 400.
pub async fn retry_failed(db: &PgPool, job_id: Uuid) -> Result<Option<IngestJobRow>, sqlx::Error> {
    let mut tx = db.begin().await?;
    let updated: Option<IngestJobRow> = sqlx::query_as(&format!(
        r#"
        UPDATE ingestion_jobs
        SET status = $2,
            error = NULL,
            progress_percent = 0,
            profiles_ingested = 0,
            retry_count = 0,
            retry_at = NULL,
            started_at = NULL,
            completed_at = NULL,
            updated_at = now()
        WHERE id = $1 AND status = $3
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(JOB_STATUS_PENDING)
    .bind(JOB_STATUS_FAILED)
    .fetch_optional(&mut *tx)
    .await?;

    if updated.is_some() {
        sqlx::query(
            r#"
            INSERT INTO ingestion_job_events (job_id, kind, payload, created_at)
            VALUES ($1, 'admin_retry', '{}', now())
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(updated)
}

pub async fn append_event(
    db: &PgPool,
    job_id: Uuid,
    kind: &str,
    payload: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ingestion_job_events (job_id, kind, payload, created_at)
        VALUES ($1, $2, $3, now())
        "#,
    )
    .bind(job_id)
    .bind(kind)
    .bind(SqlJson(payload))
    .execute(db)
    .await?;
    Ok(())
}

/// Moves jobs stuck in `running` past the wall-clock threshold back to
/// `pending`. Crashed workers leave jobs behind; the sweeper reclaims them.
pub async fn sweep_stale_running(
    db: &PgPool,
    stale_after: Duration,
) -> Result<u64, sqlx::Error> {
    let threshold: DateTime<Utc> =
        Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or_default();
    let result = sqlx::query(
        r#"
        UPDATE ingestion_jobs
        SET status = $1,
            retry_at = NULL,
            updated_at = now()
        WHERE status = $2 AND started_at IS NOT NULL AND started_at < $3
        "#,
    )
    .bind(JOB_STATUS_PENDING)
    .bind(JOB_STATUS_RUNNING)
    .bind(threshold)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}
