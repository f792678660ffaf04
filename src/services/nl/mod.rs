//! Natural-language → SQL pipeline: context retrieval, geography hints,
//! prompt assembly, bounded validator-driven retries, and interpretation.
//! This module is the only caller of the chat providers.

pub mod context;
pub mod executor;
pub mod geography;
pub mod llm;
pub mod prompt;
pub mod types;
pub mod validator;

use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::ErrorType;

use context::ContextStore;
use llm::{ChatMessage, ChatProvider, LlmRegistry};
use types::{GeneratedQuery, ProviderBenchmark, QueryError};
use validator::{ValidationErrorKind, ValidationReport};

/// Total generation attempts, counting the first.
const MAX_ATTEMPTS: u32 = 3;

const GENERATION_MAX_TOKENS: u32 = 1024;
const INTERPRETATION_MAX_TOKENS: u32 = 96;

/// Fallback when the interpretation call fails; never blocks a query.
const INTERPRETATION_FALLBACK: &str = "Running your query…";

const INTERPRETATION_PROMPT: &str = "You describe SQL queries over an ARGO ocean float \
database. Given a user question and the SQL that will answer it, reply with one short \
sentence telling the user what the result will show. No SQL, no markdown.";

pub struct NlPipeline {
    registry: Arc<LlmRegistry>,
    context: Arc<ContextStore>,
}

impl NlPipeline {
    pub fn new(registry: Arc<LlmRegistry>, context: Arc<ContextStore>) -> Self {
        Self { registry, context }
    }

    /// Runs the full generation loop. Returns validated SQL or a structured
    /// error; unvalidated SQL is never returned.
    pub async fn generate(
        &self,
        query_text: &str,
        session_id: Option<String>,
        provider_override: Option<&str>,
    ) -> Result<GeneratedQuery, QueryError> {
        let session_id = session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let provider = self
            .registry
            .get(provider_override)
            .map_err(|err| QueryError::new(ErrorType::ConfigurationError, format!("{err:#}")))?;

        let turns = self.context.recent(&session_id).await;
        let mut user_message = String::from(query_text.trim());
        if let Some(hint) = geography::coordinate_hint(query_text) {
            user_message.push_str("\n\n");
            user_message.push_str(&hint);
        }
        if let Some(snippet) = context::format_snippet(&turns) {
            user_message.push_str("\n\n");
            user_message.push_str(&snippet);
        }

        let mut last_error: Option<QueryError> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let messages = [
                ChatMessage::system(prompt::schema_prompt()),
                ChatMessage::user(user_message.clone()),
            ];
            let raw = match provider
                .chat(&messages, 0.0, GENERATION_MAX_TOKENS)
                .await
            {
                Ok(raw) => raw,
                Err(err) => {
                    // Provider deadline or transport failure: consumes an
                    // attempt, then retries with the same message.
                    tracing::warn!(attempt, error = %err, "model call failed");
                    last_error = Some(QueryError::new(
                        ErrorType::GenerationFailure,
                        format!("model call failed: {err:#}"),
                    ));
                    continue;
                }
            };

            let Some(candidate) = extract_sql(&raw) else {
                tracing::debug!(attempt, "response contained no SELECT statement");
                last_error = Some(QueryError::new(
                    ErrorType::GenerationFailure,
                    "the model response contained no SELECT statement",
                ));
                user_message.push_str(
                    "\n\nYour previous response was not a SQL statement. Respond with a \
                     single SELECT statement only.",
                );
                continue;
            };

            let report = validator::validate(&candidate);
            if report.valid {
                let interpretation = self
                    .interpret(provider.as_ref(), query_text, &candidate)
                    .await;
                return Ok(GeneratedQuery {
                    sql: candidate,
                    interpretation,
                    session_id,
                    attempt_count: attempt,
                    warnings: report.warnings,
                });
            }

            tracing::debug!(
                attempt,
                kind = ?report.error_kind,
                error = ?report.error,
                "generated SQL failed validation"
            );
            user_message.push_str(&validation_feedback(&report));
            last_error = Some(report_to_error(&report));
        }

        Err(last_error.unwrap_or_else(|| {
            QueryError::new(
                ErrorType::GenerationFailure,
                "no usable SQL after all attempts",
            )
        }))
    }

    async fn interpret(&self, provider: &dyn ChatProvider, question: &str, sql: &str) -> String {
        let messages = [
            ChatMessage::system(INTERPRETATION_PROMPT),
            ChatMessage::user(format!("Question: {question}\nSQL: {sql}")),
        ];
        match provider
            .chat(&messages, 0.2, INTERPRETATION_MAX_TOKENS)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => INTERPRETATION_FALLBACK.to_string(),
            Err(err) => {
                tracing::debug!(error = %err, "interpretation call failed; using fallback");
                INTERPRETATION_FALLBACK.to_string()
            }
        }
    }

    /// Single-shot generation per provider; never executes anything.
    pub async fn benchmark(&self, query_text: &str) -> Vec<ProviderBenchmark> {
        let mut results = Vec::new();
        let mut names = self.registry.provider_names();
        names.sort_unstable();
        for name in names {
            let provider = match self.registry.get(Some(name)) {
                Ok(provider) => provider,
                Err(err) => {
                    results.push(ProviderBenchmark {
                        provider: name.to_string(),
                        sql: None,
                        valid: false,
                        validation_errors: Vec::new(),
                        latency_ms: 0,
                        error: Some(format!("{err:#}")),
                    });
                    continue;
                }
            };

            let mut user_message = String::from(query_text.trim());
            if let Some(hint) = geography::coordinate_hint(query_text) {
                user_message.push_str("\n\n");
                user_message.push_str(&hint);
            }
            let messages = [
                ChatMessage::system(prompt::schema_prompt()),
                ChatMessage::user(user_message),
            ];

            let started = Instant::now();
            let outcome = provider.chat(&messages, 0.0, GENERATION_MAX_TOKENS).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let benchmark = match outcome {
                Ok(raw) => match extract_sql(&raw) {
                    Some(sql) => {
                        let report = validator::validate(&sql);
                        ProviderBenchmark {
                            provider: name.to_string(),
                            valid: report.valid,
                            validation_errors: report
                                .error
                                .into_iter()
                                .chain(report.warnings)
                                .collect(),
                            sql: Some(sql),
                            latency_ms,
                            error: None,
                        }
                    }
                    None => ProviderBenchmark {
                        provider: name.to_string(),
                        sql: None,
                        valid: false,
                        validation_errors: vec!["no SELECT statement in response".to_string()],
                        latency_ms,
                        error: None,
                    },
                },
                Err(err) => ProviderBenchmark {
                    provider: name.to_string(),
                    sql: None,
                    valid: false,
                    validation_errors: Vec::new(),
                    latency_ms,
                    error: Some(format!("{err:#}")),
                },
            };
            results.push(benchmark);
        }
        results
    }
}

fn validation_feedback(report: &ValidationReport) -> String {
    let mut feedback = String::from("\n\nThe previous SQL was rejected: ");
    feedback.push_str(report.error.as_deref().unwrap_or("validation failed"));
    for warning in &report.warnings {
        feedback.push_str("\nAlso: ");
        feedback.push_str(warning);
    }
    feedback.push_str("\nReturn a corrected SELECT statement only.");
    feedback
}

fn report_to_error(report: &ValidationReport) -> QueryError {
    let error_type = match report.error_kind {
        Some(ValidationErrorKind::SyntaxError) => ErrorType::GenerationFailure,
        _ => ErrorType::ValidationFailure,
    };
    let kind = report
        .error_kind
        .map(|kind| kind.as_str())
        .unwrap_or("validation_failure");
    QueryError::new(
        error_type,
        format!(
            "{kind}: {}",
            report.error.as_deref().unwrap_or("validation failed")
        ),
    )
}

/// Strips markdown fences and any preamble, returning the SQL candidate from
/// the first SELECT/WITH onwards. Returns `None` when no statement is found;
/// the definitive begins-with-SELECT check is the validator's AST pass.
fn extract_sql(raw: &str) -> Option<String> {
    let mut text = raw.trim();

    if let Some(fence_start) = text.find("```") {
        let after = &text[fence_start + 3..];
        // Skip a language tag like ```sql on the fence line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body_end = body.find("```").unwrap_or(body.len());
        text = body[..body_end].trim();
    }

    let lowered = text.to_lowercase();
    let mut starts: Vec<usize> = [
        find_keyword(&lowered, "select"),
        find_keyword(&lowered, "with"),
    ]
    .into_iter()
    .flatten()
    .collect();
    starts.sort_unstable();
    starts.dedup();
    if starts.is_empty() {
        return None;
    }

    // Prose can legitimately contain the word "with" ahead of the statement;
    // prefer the earliest candidate that parses, falling back to the earliest
    // slice so the validator can report what went wrong.
    for start in &starts {
        let candidate = text[*start..].trim();
        if candidate.is_empty() {
            continue;
        }
        if sqlparser::parser::Parser::parse_sql(
            &sqlparser::dialect::PostgreSqlDialect {},
            candidate,
        )
        .is_ok()
        {
            return Some(candidate.to_string());
        }
    }
    Some(text[starts[0]..].trim().to_string())
}

/// First occurrence of `keyword` starting at a word boundary.
fn find_keyword(lowered: &str, keyword: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(pos) = lowered[offset..].find(keyword) {
        let absolute = offset + pos;
        let boundary_before = absolute == 0
            || !lowered.as_bytes()[absolute - 1].is_ascii_alphanumeric();
        let after = absolute + keyword.len();
        let boundary_after =
            after >= lowered.len() || !lowered.as_bytes()[after].is_ascii_alphanumeric();
        if boundary_before && boundary_after {
            return Some(absolute);
        }
        offset = absolute + keyword.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::llm::testing::ScriptedProvider;

    fn pipeline_with(provider: ScriptedProvider) -> NlPipeline {
        let registry = Arc::new(LlmRegistry::with_provider(Arc::new(provider)));
        let context = Arc::new(futures::executor::block_on(ContextStore::connect(
            None, 10, 3, 3600,
        )));
        NlPipeline::new(registry, context)
    }

    #[test]
    fn extract_strips_fences_and_preamble() {
        assert_eq!(
            extract_sql("```sql\nSELECT 1\n```").as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(
            extract_sql("Here is your query:\n\nSELECT * FROM floats").as_deref(),
            Some("SELECT * FROM floats")
        );
        assert_eq!(
            extract_sql("WITH x AS (SELECT 1) SELECT * FROM x").map(|s| s.starts_with("WITH")),
            Some(true)
        );
        assert!(extract_sql("I cannot answer that.").is_none());
        // 'selected' must not match as the SELECT keyword.
        assert!(extract_sql("the selected rows are gone").is_none());
    }

    #[tokio::test]
    async fn first_valid_attempt_returns_attempt_count_one() {
        let provider = ScriptedProvider::new(vec![
            Ok("SELECT platform_number FROM floats".to_string()),
            Ok("The result lists all float identifiers.".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let outcome = pipeline.generate("list all floats", None, None).await.unwrap();
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.sql, "SELECT platform_number FROM floats");
        assert_eq!(outcome.interpretation, "The result lists all float identifiers.");
        assert!(!outcome.session_id.is_empty());
    }

    #[tokio::test]
    async fn validator_feedback_drives_a_retry() {
        let provider = ScriptedProvider::new(vec![
            Ok("SELECT * FROM pg_tables".to_string()),
            Ok("SELECT * FROM floats".to_string()),
            Ok("Lists floats.".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let outcome = pipeline.generate("show floats", None, None).await.unwrap();
        assert_eq!(outcome.attempt_count, 2);
        assert_eq!(outcome.sql, "SELECT * FROM floats");
    }

    #[tokio::test]
    async fn write_attempts_fail_all_three_attempts_without_execution() {
        let provider = ScriptedProvider::new(vec![
            Ok("DELETE FROM floats".to_string()),
            Ok("delete from floats".to_string()),
            Ok("DELETE FROM floats;".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let err = pipeline
            .generate("delete all floats", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_type, ErrorType::ValidationFailure);
        assert!(err.message.contains("read_only_violation"), "{}", err.message);
    }

    #[tokio::test]
    async fn unparsable_output_is_generation_failure() {
        let provider = ScriptedProvider::new(vec![
            Ok("I am sorry, I cannot help.".to_string()),
            Ok("Still no SQL here.".to_string()),
            Ok("Nope.".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let err = pipeline.generate("nonsense", None, None).await.unwrap_err();
        assert_eq!(err.error_type, ErrorType::GenerationFailure);
    }

    #[tokio::test]
    async fn provider_failures_consume_attempts() {
        let provider = ScriptedProvider::new(vec![
            Err("deadline exceeded".to_string()),
            Ok("SELECT count(*) FROM profiles".to_string()),
            Ok("Counts profiles.".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let outcome = pipeline.generate("how many profiles", None, None).await.unwrap();
        assert_eq!(outcome.attempt_count, 2);
    }

    #[tokio::test]
    async fn interpretation_failure_uses_fallback() {
        let provider = ScriptedProvider::new(vec![
            Ok("SELECT count(*) FROM profiles".to_string()),
            Err("interpretation deadline".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let outcome = pipeline.generate("count profiles", None, None).await.unwrap();
        assert_eq!(outcome.interpretation, INTERPRETATION_FALLBACK);
    }

    #[tokio::test]
    async fn provided_session_id_is_kept() {
        let provider = ScriptedProvider::new(vec![
            Ok("SELECT 1".to_string()),
            Ok("One.".to_string()),
        ]);
        let pipeline = pipeline_with(provider);
        let outcome = pipeline
            .generate("one", Some("session-abc".to_string()), None)
            .await
            .unwrap();
        assert_eq!(outcome.session_id, "session-abc");
    }

    #[tokio::test]
    async fn geography_hint_lands_in_the_prompt() {
        let provider = ScriptedProvider::new(vec![
            Ok("SELECT * FROM profiles".to_string()),
            Ok("Profiles near Sri Lanka.".to_string()),
        ]);
        let registry_provider = Arc::new(provider);
        let registry = Arc::new(LlmRegistry::with_provider(registry_provider.clone()));
        let context = Arc::new(ContextStore::connect(None, 10, 3, 3600).await);
        let pipeline = NlPipeline::new(registry, context);

        pipeline
            .generate("temperature near sri lanka", None, None)
            .await
            .unwrap();
        let prompts = registry_provider.prompts.lock().unwrap();
        let user = &prompts[0][1].content;
        assert!(user.contains("latitude 7.9"));
        assert!(user.contains("longitude 80.7"));
    }
}
