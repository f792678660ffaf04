//! Bounded execution of validated SQL on the read-only pool: session-local
//! statement timeout, LIMIT wrapper, structured errors. The original SQL is
//! never rewritten; it runs verbatim inside the wrapper subselect.

use serde::Serialize;
use sqlx::{Column, Executor, PgPool};
use std::time::Instant;

use crate::error::ErrorType;

use super::types::QueryError;

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    #[schema(value_type = Vec<Vec<Object>>)]
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

pub struct QueryExecutor {
    read_db: PgPool,
    default_limit: i64,
    max_limit: i64,
    timeout_ms: u64,
}

/// SQLSTATE for statement_timeout cancellation.
const QUERY_CANCELED: &str = "57014";

impl QueryExecutor {
    pub fn new(read_db: PgPool, default_limit: i64, max_limit: i64, timeout_ms: u64) -> Self {
        Self {
            read_db,
            default_limit: default_limit.max(1),
            max_limit: max_limit.max(1),
            timeout_ms: timeout_ms.max(100),
        }
    }

    pub fn row_limit(&self) -> i64 {
        self.default_limit.min(self.max_limit)
    }

    fn wrap(sql: &str, limit: i64) -> String {
        let trimmed = sql.trim().trim_end_matches(';');
        format!("SELECT * FROM ({trimmed}) AS _q LIMIT {limit}")
    }

    /// JSON projection of the wrapper; lets arbitrary result shapes decode
    /// without per-type column handling.
    fn wrap_as_json(sql: &str, limit: i64) -> String {
        let wrapped = Self::wrap(sql, limit);
        format!("SELECT row_to_json(_w)::text AS row_json FROM ({wrapped}) AS _w")
    }

    pub async fn execute(&self, sql: &str) -> Result<ExecutionResult, QueryError> {
        let limit = self.row_limit();
        let started = Instant::now();

        let mut tx = self
            .read_db
            .begin()
            .await
            .map_err(|err| map_execution_error(&err))?;

        // statement_timeout takes no bind parameters; timeout_ms is
        // config-sourced, never user input.
        let set_timeout = format!("SET LOCAL statement_timeout = {}", self.timeout_ms);
        (&mut *tx)
            .execute(set_timeout.as_str())
            .await
            .map_err(|err| map_execution_error(&err))?;

        let wrapped = Self::wrap(sql, limit);
        let columns = {
            let describe = (&mut *tx)
                .describe(wrapped.as_str())
                .await
                .map_err(|err| map_execution_error(&err))?;
            describe
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect::<Vec<String>>()
        };

        let raw_rows: Vec<(String,)> = sqlx::query_as(&Self::wrap_as_json(sql, limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(|err| map_execution_error(&err))?;

        // Read-only work; rollback keeps the session clean either way.
        let _ = tx.rollback().await;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for (raw,) in &raw_rows {
            let object: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
                QueryError::new(
                    ErrorType::ExecutionError,
                    format!("result row was not decodable: {err}"),
                )
            })?;
            let row = columns
                .iter()
                .map(|column| object.get(column).cloned().unwrap_or(serde_json::Value::Null))
                .collect();
            rows.push(row);
        }

        let row_count = rows.len();
        Ok(ExecutionResult {
            columns,
            rows,
            row_count,
            truncated: row_count as i64 == limit,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Plan-based row estimate for the confirmation gate. `None` on any
    /// planner failure; the caller defaults to executing.
    pub async fn estimate_rows(&self, sql: &str) -> Option<i64> {
        let trimmed = sql.trim().trim_end_matches(';');
        let explain = format!("EXPLAIN (FORMAT JSON) {trimmed}");
        let row: (serde_json::Value,) = match sqlx::query_as(&explain)
            .fetch_one(&self.read_db)
            .await
        {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(error = %err, "row estimate unavailable; defaulting to execute");
                return None;
            }
        };
        row.0
            .get(0)
            .and_then(|plan| plan.get("Plan"))
            .and_then(|plan| plan.get("Plan Rows"))
            .and_then(|rows| rows.as_i64())
    }
}

fn map_execution_error(err: &sqlx::Error) -> QueryError {
    if let sqlx::Error::Database(db) = err {
        if db.code().as_deref() == Some(QUERY_CANCELED) {
            return QueryError::new(
                ErrorType::Timeout,
                "query exceeded the statement timeout".to_string(),
            );
        }
        return QueryError::new(ErrorType::ExecutionError, db.message().to_string());
    }
    QueryError::new(ErrorType::ExecutionError, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_preserves_the_original_sql() {
        let wrapped = QueryExecutor::wrap("SELECT * FROM floats;", 10_000);
        assert_eq!(wrapped, "SELECT * FROM (SELECT * FROM floats) AS _q LIMIT 10000");
    }

    #[test]
    fn json_wrapper_nests_the_limit_wrapper() {
        let wrapped = QueryExecutor::wrap_as_json("SELECT id FROM profiles", 50);
        assert!(wrapped.starts_with("SELECT row_to_json(_w)::text"));
        assert!(wrapped.contains("SELECT * FROM (SELECT id FROM profiles) AS _q LIMIT 50"));
    }

    #[tokio::test]
    async fn row_limit_is_capped_by_the_absolute_maximum() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://ro@localhost/floatcore")
            .unwrap();
        let executor = QueryExecutor::new(pool, 500_000, 100_000, 30_000);
        assert_eq!(executor.row_limit(), 100_000);
    }

}
