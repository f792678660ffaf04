//! Researcher query surface: JSON request/response, an SSE streaming variant
//! for chat, and a per-provider benchmark endpoint that never executes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use futures::channel::mpsc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use crate::error::ErrorType;
use crate::services::nl::context::ConversationTurn;
use crate::services::nl::executor::ExecutionResult;
use crate::services::nl::types::{ProviderBenchmark, QueryError};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub confirm: bool,
    /// Provider override; omitted means the configured default.
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QueryResponse {
    pub session_id: String,
    pub sql: String,
    pub interpretation: String,
    pub attempt_count: u32,
    pub awaiting_confirmation: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Vec<Vec<Object>>>)]
    pub rows: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

enum QueryOutcome {
    AwaitingConfirmation {
        session_id: String,
        sql: String,
        interpretation: String,
        attempt_count: u32,
        warnings: Vec<String>,
        estimated_rows: Option<i64>,
    },
    Completed {
        session_id: String,
        sql: String,
        interpretation: String,
        attempt_count: u32,
        warnings: Vec<String>,
        result: ExecutionResult,
    },
}

/// Generation, the confirmation gate, execution and context append. Shared by
/// the JSON and SSE surfaces so their behavior cannot drift.
async fn run_query(
    state: &AppState,
    request: &QueryRequest,
) -> Result<QueryOutcome, QueryError> {
    let generated = state
        .pipeline
        .generate(
            &request.query,
            request.session_id.clone(),
            request.provider.as_deref(),
        )
        .await;

    let generated = match generated {
        Ok(generated) => generated,
        Err(err) => {
            // Failed turns are remembered too; the SQL slot stays empty.
            if let Some(session_id) = request
                .session_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                let turn = ConversationTurn {
                    query: request.query.clone(),
                    sql: None,
                    row_count: None,
                    timestamp: Utc::now(),
                };
                state.context.append(session_id, &turn).await;
            }
            return Err(err);
        }
    };

    // Plan-based confirmation gate. Estimator failure defaults to execute.
    let estimated_rows = state.executor.estimate_rows(&generated.sql).await;
    if !request.confirm {
        if let Some(estimate) = estimated_rows {
            if estimate > state.config.confirm_row_threshold {
                return Ok(QueryOutcome::AwaitingConfirmation {
                    session_id: generated.session_id,
                    sql: generated.sql,
                    interpretation: generated.interpretation,
                    attempt_count: generated.attempt_count,
                    warnings: generated.warnings,
                    estimated_rows,
                });
            }
        }
    }

    let result = state.executor.execute(&generated.sql).await?;

    let turn = ConversationTurn {
        query: request.query.clone(),
        sql: Some(generated.sql.clone()),
        row_count: Some(result.row_count as i64),
        timestamp: Utc::now(),
    };
    state.context.append(&generated.session_id, &turn).await;

    Ok(QueryOutcome::Completed {
        session_id: generated.session_id,
        sql: generated.sql,
        interpretation: generated.interpretation,
        attempt_count: generated.attempt_count,
        warnings: generated.warnings,
        result,
    })
}

fn error_status(err: &QueryError) -> StatusCode {
    match err.error_type {
        ErrorType::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorType::ConfigurationError => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/query",
    tag = "query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Query result or confirmation gate", body = QueryResponse),
        (status = 400, description = "Blank query"),
        (status = 422, description = "Generation or validation failed"),
        (status = 504, description = "Statement timeout")
    )
)]
pub async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<QueryError>)> {
    if request.query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(QueryError::new(
                ErrorType::ValidationFailure,
                "query must not be blank",
            )),
        ));
    }

    match run_query(&state, &request).await {
        Ok(QueryOutcome::AwaitingConfirmation {
            session_id,
            sql,
            interpretation,
            attempt_count,
            warnings,
            estimated_rows,
        }) => Ok(Json(QueryResponse {
            session_id,
            sql,
            interpretation,
            attempt_count,
            awaiting_confirmation: true,
            warnings,
            estimated_rows,
            columns: None,
            rows: None,
            row_count: None,
            truncated: None,
            execution_time_ms: None,
        })),
        Ok(QueryOutcome::Completed {
            session_id,
            sql,
            interpretation,
            attempt_count,
            warnings,
            result,
        }) => Ok(Json(QueryResponse {
            session_id,
            sql,
            interpretation,
            attempt_count,
            awaiting_confirmation: false,
            warnings,
            estimated_rows: None,
            columns: Some(result.columns),
            rows: Some(result.rows),
            row_count: Some(result.row_count),
            truncated: Some(result.truncated),
            execution_time_ms: Some(result.execution_time_ms),
        })),
        Err(err) => Err((error_status(&err), Json(err))),
    }
}

fn sse_event(name: &'static str, payload: serde_json::Value) -> Event {
    // serde_json never emits newlines; every data: payload is one line.
    Event::default().event(name).data(payload.to_string())
}

/// Follow-up prompts for the chat surface, keyed off what the user asked.
fn suggestions_for(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut suggestions = Vec::new();
    if !lowered.contains("map") {
        suggestions.push("Show the float positions on a map".to_string());
    }
    if lowered.contains("temperature") {
        suggestions.push("Compare salinity at the same depths".to_string());
    } else {
        suggestions.push("Show temperature for the same selection".to_string());
    }
    if !lowered.contains("qc") && !lowered.contains("good") {
        suggestions.push("Restrict to good-QC measurements only".to_string());
    }
    suggestions.truncate(3);
    suggestions
}

#[utoipa::path(
    post,
    path = "/api/v1/query/stream",
    tag = "query",
    request_body = QueryRequest,
    responses((status = 200, description = "SSE stream of query lifecycle events"))
)]
pub async fn query_stream_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded::<Result<Event, Infallible>>();

    tokio::spawn(async move {
        // A failed send means the client went away; stop quietly.
        let send = |event: Event| tx.unbounded_send(Ok(event)).is_ok();

        if request.query.trim().is_empty() {
            let err = QueryError::new(ErrorType::ValidationFailure, "query must not be blank");
            let _ = send(sse_event("error", serde_json::json!(err)));
            let _ = send(sse_event("done", serde_json::json!({})));
            return;
        }

        if !send(sse_event("thinking", serde_json::json!({ "query": request.query }))) {
            return;
        }

        let generated = match state
            .pipeline
            .generate(
                &request.query,
                request.session_id.clone(),
                request.provider.as_deref(),
            )
            .await
        {
            Ok(generated) => generated,
            Err(err) => {
                let _ = send(sse_event("error", serde_json::json!(err)));
                let _ = send(sse_event("done", serde_json::json!({})));
                return;
            }
        };

        if !send(sse_event(
            "interpreting",
            serde_json::json!({
                "interpretation": generated.interpretation,
                "sql": generated.sql,
            }),
        )) {
            return;
        }

        let estimated_rows = state.executor.estimate_rows(&generated.sql).await;
        if !request.confirm {
            if let Some(estimate) = estimated_rows {
                if estimate > state.config.confirm_row_threshold {
                    let _ = send(sse_event(
                        "awaiting_confirmation",
                        serde_json::json!({
                            "session_id": generated.session_id,
                            "sql": generated.sql,
                            "interpretation": generated.interpretation,
                            "estimated_rows": estimate,
                        }),
                    ));
                    let _ = send(sse_event("done", serde_json::json!({})));
                    return;
                }
            }
        }

        if !send(sse_event("executing", serde_json::json!({}))) {
            return;
        }

        match state.executor.execute(&generated.sql).await {
            Ok(result) => {
                let turn = ConversationTurn {
                    query: request.query.clone(),
                    sql: Some(generated.sql.clone()),
                    row_count: Some(result.row_count as i64),
                    timestamp: Utc::now(),
                };
                state.context.append(&generated.session_id, &turn).await;

                let _ = send(sse_event(
                    "results",
                    serde_json::json!({
                        "session_id": generated.session_id,
                        "columns": result.columns,
                        "rows": result.rows,
                        "row_count": result.row_count,
                        "truncated": result.truncated,
                        "sql": generated.sql,
                        "interpretation": generated.interpretation,
                        "execution_time_ms": result.execution_time_ms,
                        "attempt_count": generated.attempt_count,
                    }),
                ));
                let _ = send(sse_event(
                    "suggestions",
                    serde_json::json!({ "suggestions": suggestions_for(&request.query) }),
                ));
            }
            Err(err) => {
                let _ = send(sse_event("error", serde_json::json!(err)));
            }
        }
        let _ = send(sse_event("done", serde_json::json!({})));
    });

    Sse::new(rx).keep_alive(KeepAlive::default())
}

#[utoipa::path(
    post,
    path = "/api/v1/query/benchmark",
    tag = "query",
    request_body = QueryRequest,
    responses((status = 200, description = "Per-provider generation results", body = [ProviderBenchmark]))
)]
pub async fn query_benchmark_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Vec<ProviderBenchmark>>, (StatusCode, Json<QueryError>)> {
    if request.query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(QueryError::new(
                ErrorType::ValidationFailure,
                "query must not be blank",
            )),
        ));
    }
    Ok(Json(state.pipeline.benchmark(&request.query).await))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/query", post(query_handler))
        .route("/query/stream", post(query_stream_handler))
        .route("/query/benchmark", post(query_benchmark_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_payloads_are_single_line() {
        let payload = serde_json::json!({
            "columns": ["a", "b"],
            "rows": [[1, "two\nthree"]],
        });
        let line = payload.to_string();
        assert!(!line.contains('\n'), "escaped newlines only: {line}");
    }

    #[test]
    fn suggestions_adapt_to_the_question() {
        let base = suggestions_for("show temperature near sri lanka");
        assert!(base.iter().any(|s| s.contains("salinity")));
        assert!(base.len() <= 3);

        let qc = suggestions_for("good qc salinity data");
        assert!(!qc.iter().any(|s| s.contains("good-QC")));
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let timeout = QueryError::new(ErrorType::Timeout, "slow");
        assert_eq!(error_status(&timeout), StatusCode::GATEWAY_TIMEOUT);
        let validation = QueryError::new(ErrorType::ValidationFailure, "bad");
        assert_eq!(error_status(&validation), StatusCode::UNPROCESSABLE_ENTITY);
        let config = QueryError::new(ErrorType::ConfigurationError, "missing");
        assert_eq!(error_status(&config), StatusCode::SERVICE_UNAVAILABLE);
    }
}
