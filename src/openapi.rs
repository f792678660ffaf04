use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_handler,
        crate::routes::datasets::upload_dataset,
        crate::routes::datasets::get_job,
        crate::routes::datasets::list_jobs,
        crate::routes::datasets::retry_job,
        crate::routes::datasets::list_datasets,
        crate::routes::datasets::download_dataset,
        crate::routes::query::query_handler,
        crate::routes::query::query_stream_handler,
        crate::routes::query::query_benchmark_handler,
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::routes::datasets::UploadAccepted,
        crate::routes::datasets::ApiErrorBody,
        crate::routes::datasets::JobResponse,
        crate::routes::datasets::JobListResponse,
        crate::routes::datasets::DatasetSummary,
        crate::routes::datasets::DatasetDownload,
        crate::routes::query::QueryRequest,
        crate::routes::query::QueryResponse,
        crate::services::ingest::types::IngestJobPublic,
        crate::services::ingest::types::IngestJobStatus,
        crate::services::nl::executor::ExecutionResult,
        crate::services::nl::types::ProviderBenchmark,
        crate::services::nl::types::QueryError,
        crate::services::nl::validator::ValidationErrorKind,
        crate::error::ErrorType,
    )),
    tags(
        (name = "datasets", description = "Admin upload and ingestion job management"),
        (name = "query", description = "Natural-language query engine")
    )
)]
struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_else(|_| serde_json::json!({}))
}

async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_the_public_surface() {
        let doc = openapi_json();
        let paths = doc.get("paths").and_then(|p| p.as_object()).unwrap();
        assert!(paths.contains_key("/api/v1/datasets/upload"));
        assert!(paths.contains_key("/api/v1/datasets/jobs/{id}/retry"));
        assert!(paths.contains_key("/api/v1/query"));
        assert!(paths.contains_key("/api/v1/query/benchmark"));
        assert!(paths.contains_key("/health"));
    }
}
