//! Per-session conversation memory in Redis. The store is advisory: every
//! failure path degrades to empty reads or dropped appends with a warning,
//! and no query ever fails because Redis is away.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

const KEY_PREFIX: &str = "floatcore:context:";

/// Longest slice of the natural-language text carried into prompts.
const SNIPPET_TEXT_CHARS: usize = 150;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub sql: Option<String>,
    pub row_count: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

pub struct ContextStore {
    conn: Option<ConnectionManager>,
    max_turns: usize,
    recent_turns: usize,
    ttl_seconds: u64,
}

impl ContextStore {
    /// Connects if a URL is configured; otherwise (or on failure) the store
    /// runs disabled.
    pub async fn connect(
        redis_url: Option<&str>,
        max_turns: usize,
        recent_turns: usize,
        ttl_seconds: u64,
    ) -> Self {
        let conn = match redis_url {
            Some(url) => match Self::try_connect(url).await {
                Ok(conn) => Some(conn),
                Err(err) => {
                    tracing::warn!(error = %err, "context store unavailable; running without memory");
                    None
                }
            },
            None => {
                tracing::info!("no redis url configured; context store disabled");
                None
            }
        };
        Self {
            conn,
            max_turns: max_turns.max(1),
            recent_turns: recent_turns.max(1),
            ttl_seconds: ttl_seconds.max(60),
        }
    }

    async fn try_connect(url: &str) -> redis::RedisResult<ConnectionManager> {
        let client = redis::Client::open(url)?;
        client.get_connection_manager().await
    }

    fn key(session_id: &str) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }

    /// Most-recent turns, oldest first. Empty on any failure.
    pub async fn recent(&self, session_id: &str) -> Vec<ConversationTurn> {
        let Some(conn) = &self.conn else {
            return Vec::new();
        };
        let mut conn = conn.clone();
        let key = Self::key(session_id);
        let raw: Vec<String> = match conn.lrange(&key, 0, self.recent_turns as isize - 1).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "context retrieval failed; continuing without memory");
                return Vec::new();
            }
        };
        let mut turns: Vec<ConversationTurn> = raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect();
        // LPUSH stores newest first; prompts read oldest first.
        turns.reverse();
        turns
    }

    /// Appends a completed turn and refreshes the TTL. No-op with a warning
    /// when the store is away.
    pub async fn append(&self, session_id: &str, turn: &ConversationTurn) {
        let Some(conn) = &self.conn else {
            return;
        };
        let mut conn = conn.clone();
        let key = Self::key(session_id);
        let payload = match serde_json::to_string(turn) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize conversation turn");
                return;
            }
        };
        let result: redis::RedisResult<()> = async {
            let _: () = conn.lpush(&key, payload).await?;
            let _: () = conn.ltrim(&key, 0, self.max_turns as isize - 1).await?;
            let _: () = conn.expire(&key, self.ttl_seconds as i64).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "context append failed; turn dropped");
        }
    }
}

/// Compact dialogue snippet for prompt inclusion, oldest turn first.
pub fn format_snippet(turns: &[ConversationTurn]) -> Option<String> {
    if turns.is_empty() {
        return None;
    }
    let lines: Vec<String> = turns
        .iter()
        .map(|turn| {
            let text = truncate_chars(&turn.query, SNIPPET_TEXT_CHARS);
            match turn.sql.as_deref() {
                Some(sql) => format!("User: {text}\nSQL: {sql}"),
                None => format!("User: {text}\nSQL: (generation failed)"),
            }
        })
        .collect();
    Some(format!(
        "Recent conversation:\n{}",
        lines.join("\n")
    ))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(query: &str, sql: Option<&str>) -> ConversationTurn {
        ConversationTurn {
            query: query.to_string(),
            sql: sql.map(str::to_string),
            row_count: Some(10),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn snippet_is_oldest_first_with_sql() {
        let turns = vec![
            turn("warm water near india", Some("SELECT 1")),
            turn("and salinity?", Some("SELECT 2")),
        ];
        let snippet = format_snippet(&turns).unwrap();
        let first = snippet.find("warm water").unwrap();
        let second = snippet.find("and salinity").unwrap();
        assert!(first < second);
        assert!(snippet.contains("SQL: SELECT 1"));
    }

    #[test]
    fn long_queries_are_truncated() {
        let long = "x".repeat(400);
        let snippet = format_snippet(&[turn(&long, None)]).unwrap();
        assert!(snippet.contains(&"x".repeat(150)));
        assert!(!snippet.contains(&"x".repeat(151)));
        assert!(snippet.contains("(generation failed)"));
    }

    #[test]
    fn empty_history_yields_no_snippet() {
        assert!(format_snippet(&[]).is_none());
    }

    #[tokio::test]
    async fn disabled_store_degrades_to_empty() {
        let store = ContextStore::connect(None, 10, 3, 3600).await;
        assert!(store.recent("session").await.is_empty());
        // Append on a disabled store is a no-op, not an error.
        store.append("session", &turn("q", None)).await;
    }
}
