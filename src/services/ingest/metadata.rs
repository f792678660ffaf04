//! Post-ingest dataset metadata: date range, counts, bounding polygon and an
//! optional model-written summary with a deterministic fallback.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::services::nl::llm::{ChatMessage, ChatProvider};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DatasetStats {
    pub name: String,
    pub date_range_start: Option<DateTime<Utc>>,
    pub date_range_end: Option<DateTime<Utc>>,
    pub float_count: i32,
    pub profile_count: i32,
    pub variables: Vec<String>,
}

/// Aggregates the dataset's rows and stores the results on the dataset row.
/// Runs inside the job transaction so a failed job never leaves half-updated
/// metadata behind.
pub async fn compute_and_store(
    tx: &mut Transaction<'_, Postgres>,
    dataset_id: Uuid,
    variables: &[String],
) -> Result<DatasetStats, sqlx::Error> {
    // The convex hull of a single position degenerates to a point; a small
    // buffer keeps the column a polygon for every non-empty dataset.
    let stats: DatasetStats = sqlx::query_as(
        r#"
        UPDATE datasets d
        SET date_range_start = agg.min_ts,
            date_range_end = agg.max_ts,
            float_count = agg.float_count,
            profile_count = agg.profile_count,
            variables = $2,
            bbox = agg.hull,
            ingested_at = now(),
            updated_at = now()
        FROM (
            SELECT
                min(p.timestamp) AS min_ts,
                max(p.timestamp) AS max_ts,
                count(DISTINCT p.float_id)::INT AS float_count,
                count(*)::INT AS profile_count,
                CASE WHEN count(p.geom) > 0 THEN
                    ST_Buffer(ST_ConvexHull(ST_Collect(p.geom::geometry)), 0.05)::geography
                END AS hull
            FROM profiles p
            WHERE p.dataset_id = $1
        ) agg
        WHERE d.id = $1
        RETURNING d.name, d.date_range_start, d.date_range_end,
                  d.float_count, d.profile_count, d.variables
        "#,
    )
    .bind(dataset_id)
    .bind(variables)
    .fetch_one(&mut **tx)
    .await?;
    Ok(stats)
}

const SUMMARY_PROMPT: &str = "You are a concise oceanographic data curator. \
Given JSON metadata for an ingested ARGO float dataset, write a 2-3 sentence \
plain-English summary of its coverage. Mention the time span, float count and \
notable variables. Respond with the summary only.";

/// Human summary of the metadata. Any provider failure falls back to the
/// deterministic template; this never fails the job.
pub async fn generate_summary(llm: &dyn ChatProvider, stats: &DatasetStats) -> String {
    let metadata_json =
        serde_json::to_string(stats).unwrap_or_else(|_| "{}".to_string());
    let messages = [
        ChatMessage::system(SUMMARY_PROMPT),
        ChatMessage::user(&metadata_json),
    ];
    match llm.chat(&messages, 0.2, 256).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => template_summary(stats),
        Err(err) => {
            tracing::warn!(error = %err, "summary generation failed; using template");
            template_summary(stats)
        }
    }
}

pub fn template_summary(stats: &DatasetStats) -> String {
    let span = match (stats.date_range_start, stats.date_range_end) {
        (Some(start), Some(end)) => format!(
            " covering {} to {}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ),
        _ => String::new(),
    };
    format!(
        "Dataset {} contains {} profile(s) from {} float(s){}. Variables: {}.",
        stats.name,
        stats.profile_count,
        stats.float_count,
        span,
        stats.variables.join(", ")
    )
}

pub async fn store_summary(
    db: &PgPool,
    dataset_id: Uuid,
    summary: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE datasets
        SET summary = $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(dataset_id)
    .bind(summary)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stats() -> DatasetStats {
        DatasetStats {
            name: "indian-ocean-2023".to_string(),
            date_range_start: Utc.with_ymd_and_hms(2023, 1, 4, 0, 0, 0).single(),
            date_range_end: Utc.with_ymd_and_hms(2023, 11, 30, 0, 0, 0).single(),
            float_count: 3,
            profile_count: 118,
            variables: vec!["PRES".to_string(), "TEMP".to_string(), "PSAL".to_string()],
        }
    }

    #[test]
    fn template_summary_is_deterministic() {
        let text = template_summary(&stats());
        assert_eq!(
            text,
            "Dataset indian-ocean-2023 contains 118 profile(s) from 3 float(s) \
             covering 2023-01-04 to 2023-11-30. Variables: PRES, TEMP, PSAL."
        );
    }

    #[test]
    fn template_summary_without_dates() {
        let mut stats = stats();
        stats.date_range_start = None;
        let text = template_summary(&stats);
        assert!(!text.contains("covering"));
        assert!(text.contains("118 profile(s)"));
    }
}
