use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::services::index::IndexerService;
use crate::services::nl::context::ContextStore;
use crate::services::nl::executor::QueryExecutor;
use crate::services::nl::NlPipeline;
use crate::services::object_store::ObjectStorage;

#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    /// Write-capable pool used by ingestion and job bookkeeping.
    pub db: PgPool,
    /// Read-only-role pool; the query engine cannot write through it.
    pub read_db: PgPool,
    pub storage: Arc<ObjectStorage>,
    pub context: Arc<ContextStore>,
    pub pipeline: Arc<NlPipeline>,
    pub executor: Arc<QueryExecutor>,
    pub indexer: Arc<IndexerService>,
    pub http: reqwest::Client,
}

impl FromRef<AppState> for CoreConfig {
    fn from_ref(state: &AppState) -> CoreConfig {
        state.config.clone()
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
