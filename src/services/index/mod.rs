//! Post-ingest indexing: dataset and float descriptor embeddings plus
//! materialized-view refreshes. Dispatched fire-and-forget on job success;
//! nothing here can fail an ingestion.

pub mod embeddings;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use embeddings::EmbeddingClient;

pub const EMBED_BATCH_SIZE: usize = 100;

pub const STATUS_INDEXED: &str = "indexed";
pub const STATUS_EMBEDDING_FAILED: &str = "embedding_failed";

pub struct IndexerService {
    db: PgPool,
    embeddings: Arc<EmbeddingClient>,
}

#[derive(Debug, sqlx::FromRow)]
struct DatasetDescriptorRow {
    name: String,
    summary: Option<String>,
    variables: Vec<String>,
    date_range_start: Option<DateTime<Utc>>,
    date_range_end: Option<DateTime<Utc>>,
    float_count: i32,
    region: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct FloatDescriptorRow {
    id: i64,
    platform_number: String,
    float_type: String,
    first_profile: Option<DateTime<Utc>>,
    last_profile: Option<DateTime<Utc>>,
    region: Option<String>,
}

impl IndexerService {
    pub fn new(db: PgPool, embeddings: Arc<EmbeddingClient>) -> Self {
        Self { db, embeddings }
    }

    /// Fire-and-forget entry point used by the orchestrator on job success.
    pub fn dispatch(self: &Arc<Self>, dataset_id: Uuid) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service.index_dataset(dataset_id).await {
                tracing::warn!(dataset_id = %dataset_id, error = %err, "dataset indexing failed");
            }
        });
    }

    pub async fn index_dataset(&self, dataset_id: Uuid) -> anyhow::Result<()> {
        self.index_dataset_descriptor(dataset_id).await;
        self.index_float_descriptors(dataset_id).await;
        self.refresh_materialized_views().await;
        Ok(())
    }

    async fn index_dataset_descriptor(&self, dataset_id: Uuid) {
        let row: Result<Option<DatasetDescriptorRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT
                d.name, d.summary, d.variables, d.date_range_start, d.date_range_end,
                d.float_count,
                region.name AS region
            FROM datasets d
            LEFT JOIN LATERAL (
                SELECT r.name
                FROM ocean_regions r
                WHERE d.bbox IS NOT NULL
                  AND r.boundary IS NOT NULL
                  AND ST_Covers(r.boundary, ST_Centroid(d.bbox::geometry)::geography)
                ORDER BY (r.parent_id IS NOT NULL) DESC, r.name
                LIMIT 1
            ) region ON TRUE
            WHERE d.id = $1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.db)
        .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!(dataset_id = %dataset_id, "dataset vanished before indexing");
                return;
            }
            Err(err) => {
                tracing::warn!(dataset_id = %dataset_id, error = %err, "dataset descriptor query failed");
                return;
            }
        };

        let descriptor = dataset_descriptor(&row);
        match self.embeddings.embed_batch(&[descriptor.clone()]).await {
            Ok(mut vectors) => {
                let vector = vectors.pop();
                if let Err(err) = self
                    .upsert_dataset_embedding(dataset_id, &descriptor, vector, STATUS_INDEXED)
                    .await
                {
                    tracing::warn!(dataset_id = %dataset_id, error = %err, "dataset embedding upsert failed");
                }
            }
            Err(err) => {
                tracing::warn!(dataset_id = %dataset_id, error = %err, "dataset embedding failed");
                if let Err(err) = self
                    .upsert_dataset_embedding(dataset_id, &descriptor, None, STATUS_EMBEDDING_FAILED)
                    .await
                {
                    tracing::warn!(dataset_id = %dataset_id, error = %err, "dataset embedding status write failed");
                }
            }
        }
    }

    async fn upsert_dataset_embedding(
        &self,
        dataset_id: Uuid,
        text: &str,
        vector: Option<Vec<f32>>,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO dataset_embeddings (dataset_id, embedded_text, embedding, status, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (dataset_id) DO UPDATE SET
                embedded_text = EXCLUDED.embedded_text,
                embedding = EXCLUDED.embedding,
                status = EXCLUDED.status,
                updated_at = now()
            "#,
        )
        .bind(dataset_id)
        .bind(text)
        .bind(vector)
        .bind(status)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn index_float_descriptors(&self, dataset_id: Uuid) {
        let rows: Result<Vec<FloatDescriptorRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT
                f.id, f.platform_number, f.float_type,
                agg.first_profile, agg.last_profile,
                region.name AS region
            FROM floats f
            JOIN (
                SELECT p.float_id,
                       min(p.timestamp) AS first_profile,
                       max(p.timestamp) AS last_profile
                FROM profiles p
                WHERE p.float_id IN (
                    SELECT DISTINCT float_id FROM profiles WHERE dataset_id = $1
                )
                GROUP BY p.float_id
            ) agg ON agg.float_id = f.id
            LEFT JOIN LATERAL (
                SELECT r.name
                FROM ocean_regions r
                WHERE r.boundary IS NOT NULL
                  AND EXISTS (
                      SELECT 1 FROM profiles p2
                      WHERE p2.float_id = f.id
                        AND p2.geom IS NOT NULL
                        AND ST_Covers(r.boundary, p2.geom)
                  )
                ORDER BY (r.parent_id IS NOT NULL) DESC, r.name
                LIMIT 1
            ) region ON TRUE
            ORDER BY f.id
            "#,
        )
        .bind(dataset_id)
        .fetch_all(&self.db)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(dataset_id = %dataset_id, error = %err, "float descriptor query failed");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let variables: Vec<String> = match sqlx::query_as::<_, (Vec<String>,)>(
            "SELECT variables FROM datasets WHERE id = $1",
        )
        .bind(dataset_id)
        .fetch_one(&self.db)
        .await
        {
            Ok((variables,)) => variables,
            Err(_) => Vec::new(),
        };

        // Batched provider calls: up to 100 descriptors per request.
        for batch in rows.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch
                .iter()
                .map(|row| float_descriptor(row, &variables))
                .collect();
            match self.embeddings.embed_batch(&texts).await {
                Ok(vectors) => {
                    for ((row, text), vector) in batch.iter().zip(&texts).zip(vectors) {
                        if let Err(err) = self
                            .upsert_float_embedding(row.id, text, Some(vector), STATUS_INDEXED)
                            .await
                        {
                            tracing::warn!(float_id = row.id, error = %err, "float embedding upsert failed");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        dataset_id = %dataset_id,
                        batch_len = batch.len(),
                        error = %err,
                        "float embedding batch failed; marking rows"
                    );
                    for (row, text) in batch.iter().zip(&texts) {
                        if let Err(err) = self
                            .upsert_float_embedding(row.id, text, None, STATUS_EMBEDDING_FAILED)
                            .await
                        {
                            tracing::warn!(float_id = row.id, error = %err, "float embedding status write failed");
                        }
                    }
                }
            }
        }
    }

    async fn upsert_float_embedding(
        &self,
        float_id: i64,
        text: &str,
        vector: Option<Vec<f32>>,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO float_embeddings (float_id, embedded_text, embedding, status, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (float_id) DO UPDATE SET
                embedded_text = EXCLUDED.embedded_text,
                embedding = EXCLUDED.embedding,
                status = EXCLUDED.status,
                updated_at = now()
            "#,
        )
        .bind(float_id)
        .bind(text)
        .bind(vector)
        .bind(status)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn refresh_materialized_views(&self) {
        for view in ["mv_float_latest_position", "mv_dataset_stats"] {
            let statement = format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}");
            if let Err(err) = sqlx::query(&statement).execute(&self.db).await {
                tracing::warn!(view, error = %err, "materialized view refresh failed");
            }
        }
    }
}

fn dataset_descriptor(row: &DatasetDescriptorRow) -> String {
    let mut parts = Vec::new();
    if let Some(summary) = row.summary.as_deref().filter(|s| !s.is_empty()) {
        parts.push(summary.to_string());
    }
    parts.push(format!("Dataset: {}", row.name));
    parts.push(format!("Variables: {}", row.variables.join(", ")));
    if let (Some(start), Some(end)) = (row.date_range_start, row.date_range_end) {
        parts.push(format!(
            "Date range: {} to {}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ));
    }
    parts.push(format!("Floats: {}", row.float_count));
    if let Some(region) = row.region.as_deref() {
        parts.push(format!("Region: {region}"));
    }
    parts.join(". ")
}

fn float_descriptor(row: &FloatDescriptorRow, variables: &[String]) -> String {
    let mut parts = vec![format!(
        "{} float {}",
        row.float_type, row.platform_number
    )];
    if let Some(region) = row.region.as_deref() {
        parts.push(format!("operating in the {region}"));
    }
    if !variables.is_empty() {
        parts.push(format!("measuring {}", variables.join(", ")));
    }
    if let (Some(first), Some(last)) = (row.first_profile, row.last_profile) {
        parts.push(format!(
            "active {} to {}",
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        ));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dataset_descriptor_concatenates_summary_and_structure() {
        let row = DatasetDescriptorRow {
            name: "indian-ocean-2023".to_string(),
            summary: Some("Profiles from the Bay of Bengal.".to_string()),
            variables: vec!["PRES".to_string(), "TEMP".to_string()],
            date_range_start: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single(),
            date_range_end: Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).single(),
            float_count: 2,
            region: Some("Indian Ocean".to_string()),
        };
        let text = dataset_descriptor(&row);
        assert!(text.starts_with("Profiles from the Bay of Bengal."));
        assert!(text.contains("Dataset: indian-ocean-2023"));
        assert!(text.contains("Variables: PRES, TEMP"));
        assert!(text.contains("Region: Indian Ocean"));
    }

    #[test]
    fn float_descriptor_includes_type_region_and_range() {
        let row = FloatDescriptorRow {
            id: 9,
            platform_number: "2902746".to_string(),
            float_type: "BGC".to_string(),
            first_profile: Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).single(),
            last_profile: Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).single(),
            region: Some("Arabian Sea".to_string()),
        };
        let text = float_descriptor(&row, &["PRES".to_string(), "DOXY".to_string()]);
        assert!(text.starts_with("BGC float 2902746"));
        assert!(text.contains("operating in the Arabian Sea"));
        assert!(text.contains("measuring PRES, DOXY"));
        assert!(text.contains("active 2022-03-01 to 2023-03-01"));
    }
}
