//! Ingestion job engine: claims pending jobs from the durable queue (the job
//! table), drives each through fetch → parse → clean → write → metadata, and
//! classifies failures as transient (retry with backoff) or permanent.

use anyhow::anyhow;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{CoreConfig, OutlierBounds};
use crate::services::argo::{cleaner, parser};
use crate::services::index::IndexerService;
use crate::services::nl::llm::LlmRegistry;
use crate::services::object_store::ObjectStorage;

use super::{archive, metadata, store, writer};
use super::types::{backoff_delay, IngestJobRow, StageError, StageResult};

pub struct IngestOrchestrator {
    db: PgPool,
    storage: Arc<ObjectStorage>,
    llm: Arc<LlmRegistry>,
    indexer: Arc<IndexerService>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    sweep_interval: Duration,
    stale_after: Duration,
    max_retries: u32,
    batch_size: usize,
    bounds: OutlierBounds,
}

struct FileOutcome {
    name: String,
    result: Result<writer::WriteSummary, String>,
}

impl IngestOrchestrator {
    pub fn new(
        db: PgPool,
        config: &CoreConfig,
        storage: Arc<ObjectStorage>,
        llm: Arc<LlmRegistry>,
        indexer: Arc<IndexerService>,
    ) -> Self {
        Self {
            db,
            storage,
            llm,
            indexer,
            semaphore: Arc::new(Semaphore::new(config.ingest_max_concurrent_jobs.max(1))),
            poll_interval: Duration::from_millis(config.ingest_poll_interval_ms),
            sweep_interval: Duration::from_secs(config.ingest_sweep_interval_seconds),
            stale_after: Duration::from_secs(config.ingest_stale_after_seconds),
            max_retries: config.ingest_max_retries,
            batch_size: config.measurement_batch_size,
            bounds: config.outlier_bounds,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let poller = self.clone();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = tokio::time::sleep(poller.poll_interval) => {}
                }

                while let Ok(permit) = poller.semaphore.clone().try_acquire_owned() {
                    let job = match store::claim_next_pending(&poller.db).await {
                        Ok(job) => job,
                        Err(err) => {
                            tracing::warn!(error = %err, "ingest poller failed to claim job");
                            drop(permit);
                            break;
                        }
                    };

                    let Some(job) = job else {
                        drop(permit);
                        break;
                    };

                    let service = poller.clone();
                    let span = tracing::info_span!(
                        "ingest_job",
                        job_id = %job.id,
                        dataset_id = ?job.dataset_id,
                        source_filename = %job.source_filename,
                        retry_count = job.retry_count,
                    );
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = service.run_one(job).instrument(span).await {
                            tracing::warn!(error = %err, "ingest job runner error");
                        }
                    });
                }
            }
        });

        // Stale-job sweeper: reclaims jobs abandoned by crashed workers.
        let sweeper = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match store::sweep_stale_running(&sweeper.db, sweeper.stale_after).await {
                            Ok(0) => {}
                            Ok(count) => {
                                tracing::warn!(count, "returned stale running jobs to pending");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "stale job sweep failed");
                            }
                        }
                    }
                }
            }
        });
    }

    async fn run_one(self: Arc<Self>, job: IngestJobRow) -> anyhow::Result<()> {
        let job_id = job.id;
        tracing::info!(phase = "runner_start", "ingest job execution started");

        match self.execute_job(&job).await {
            Ok(dataset_id) => {
                store::mark_succeeded(&self.db, job_id).await?;
                tracing::info!(phase = "runner_complete", status = "succeeded", "ingest job finished");
                // Fire-and-forget: indexing failures never touch job status.
                self.indexer.dispatch(dataset_id);
            }
            Err(StageError::Transient(err)) => {
                let message = format!("{err:#}");
                match backoff_delay(job.retry_count as u32, self.max_retries) {
                    Some(delay) => {
                        tracing::warn!(
                            phase = "runner_complete",
                            status = "retry_scheduled",
                            delay_seconds = delay.as_secs(),
                            error = %message,
                            "ingest job hit transient failure"
                        );
                        store::schedule_retry(&self.db, job_id, delay, &message).await?;
                    }
                    None => {
                        let message = format!("retries exhausted: {message}");
                        tracing::warn!(
                            phase = "runner_complete",
                            status = "failed",
                            error = %message,
                            "ingest job exhausted retries"
                        );
                        store::mark_failed(&self.db, job_id, &message).await?;
                    }
                }
            }
            Err(StageError::Permanent(err)) => {
                let message = format!("{err:#}");
                tracing::warn!(
                    phase = "runner_complete",
                    status = "failed",
                    error = %message,
                    "ingest job failed permanently"
                );
                store::mark_failed(&self.db, job_id, &message).await?;
            }
        }
        Ok(())
    }

    async fn execute_job(&self, job: &IngestJobRow) -> StageResult<Uuid> {
        let dataset_id = job
            .dataset_id
            .ok_or_else(|| StageError::permanent(anyhow!("job has no dataset reference")))?;
        let object_key = job
            .object_key
            .as_deref()
            .ok_or_else(|| StageError::permanent(anyhow!("job has no staged object")))?;

        // The raw object was staged before dispatch; fetch failures are the
        // object-store-timeout class and heal on retry.
        let bytes = self
            .storage
            .fetch(object_key)
            .await
            .map_err(StageError::transient)?;

        let entries: Vec<archive::ArchiveEntry> = if archive::is_zip_filename(&job.source_filename)
        {
            archive::extract_profile_entries(&bytes).map_err(StageError::permanent)?
        } else {
            vec![archive::ArchiveEntry {
                name: job.source_filename.clone(),
                bytes: bytes.to_vec(),
            }]
        };
        if entries.is_empty() {
            return Err(StageError::permanent(anyhow!(
                "archive contains no .nc or .nc4 files"
            )));
        }

        let total_entries = entries.len();
        let mut profiles_total = 0i32;
        let mut profiles_ingested = 0i32;
        let mut variables: Vec<String> = Vec::new();
        let mut outcomes: Vec<FileOutcome> = Vec::with_capacity(total_entries);

        for (index, entry) in entries.into_iter().enumerate() {
            match self
                .ingest_entry(&entry, dataset_id, &mut variables)
                .await
            {
                Ok((summary, entry_profiles)) => {
                    profiles_total += entry_profiles;
                    profiles_ingested += summary.profiles_written as i32;
                    outcomes.push(FileOutcome {
                        name: entry.name,
                        result: Ok(summary),
                    });
                }
                Err(StageError::Transient(err)) => {
                    // Whole-job retry; committed entries re-run idempotently.
                    return Err(StageError::Transient(err));
                }
                Err(StageError::Permanent(err)) => {
                    outcomes.push(FileOutcome {
                        name: entry.name,
                        result: Err(format!("{err:#}")),
                    });
                }
            }

            let percent = ((index + 1) as f32 / total_entries as f32) * 90.0;
            if let Err(err) = store::update_progress(
                &self.db,
                job.id,
                percent,
                profiles_total,
                profiles_ingested,
            )
            .await
            {
                tracing::warn!(error = %err, "failed to write job progress");
            }
        }

        for outcome in &outcomes {
            let payload = match &outcome.result {
                Ok(summary) => serde_json::json!({
                    "file": outcome.name,
                    "profiles": summary.profiles_written,
                    "measurements": summary.measurements_written,
                }),
                Err(error) => serde_json::json!({
                    "file": outcome.name,
                    "error": error,
                }),
            };
            let kind = if outcome.result.is_ok() {
                "file_succeeded"
            } else {
                "file_failed"
            };
            if let Err(err) = store::append_event(&self.db, job.id, kind, payload).await {
                tracing::warn!(error = %err, "failed to append file outcome event");
            }
        }

        let failed: Vec<&FileOutcome> =
            outcomes.iter().filter(|o| o.result.is_err()).collect();
        if !failed.is_empty() {
            let detail = failed
                .iter()
                .map(|o| {
                    format!(
                        "{}: {}",
                        o.name,
                        o.result.as_ref().err().map(String::as_str).unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StageError::permanent(anyhow!(
                "{} of {} file(s) failed: {detail}",
                failed.len(),
                total_entries
            )));
        }

        // Summary generation happens after every row write is committed; any
        // model failure degrades to the template and never fails the job.
        self.write_dataset_summary(dataset_id).await;

        Ok(dataset_id)
    }

    /// One file through parse → clean → transactional write + metadata.
    /// The transaction commits only when every row write for this file landed.
    async fn ingest_entry(
        &self,
        entry: &archive::ArchiveEntry,
        dataset_id: Uuid,
        variables: &mut Vec<String>,
    ) -> StageResult<(writer::WriteSummary, i32)> {
        // The parser reads from a local path and owns the file for the
        // duration of the parse.
        let mut parse = {
            use std::io::Write;
            let mut scratch = tempfile::NamedTempFile::new()
                .map_err(|err| StageError::transient(anyhow!("temp storage: {err}")))?;
            scratch
                .write_all(&entry.bytes)
                .map_err(|err| StageError::transient(anyhow!("temp storage: {err}")))?;
            parser::parse_file(scratch.path())?
        };
        let entry_profiles = parse.profiles.len() as i32;
        let report = cleaner::clean(&mut parse, &self.bounds);
        if report.levels_flagged > 0 {
            tracing::info!(
                file = %entry.name,
                flagged = report.levels_flagged,
                total = report.levels_total,
                "outlier screening flagged levels"
            );
        }
        for variable in &parse.variables {
            if !variables.contains(variable) {
                variables.push(variable.clone());
            }
        }

        let mut tx = self.db.begin().await.map_err(StageError::from)?;
        let summary = writer::write_parse_result(&mut tx, &parse, dataset_id, self.batch_size)
            .await
            .map_err(StageError::from)?;
        metadata::compute_and_store(&mut tx, dataset_id, variables)
            .await
            .map_err(StageError::from)?;
        tx.commit().await.map_err(StageError::from)?;

        Ok((summary, entry_profiles))
    }

    async fn write_dataset_summary(&self, dataset_id: Uuid) {
        let stats: Result<Option<metadata::DatasetStats>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT name, date_range_start, date_range_end, float_count, profile_count, variables
            FROM datasets
            WHERE id = $1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.db)
        .await;

        let Ok(Some(stats)) = stats else {
            tracing::warn!(dataset_id = %dataset_id, "could not load dataset stats for summary");
            return;
        };

        let summary = match self.llm.get(None) {
            Ok(provider) => metadata::generate_summary(provider.as_ref(), &stats).await,
            Err(err) => {
                tracing::warn!(error = %err, "no LLM provider for summary; using template");
                metadata::template_summary(&stats)
            }
        };
        if let Err(err) = metadata::store_summary(&self.db, dataset_id, &summary).await {
            tracing::warn!(dataset_id = %dataset_id, error = %err, "failed to store dataset summary");
        }
    }
}
