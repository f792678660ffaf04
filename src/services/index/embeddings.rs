//! Embedding provider client (OpenAI-compatible `/embeddings` shape).

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::CoreConfig;

pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    pub dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn from_config(config: &CoreConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: config.embedding_api_key.clone(),
            model: config.embedding_model.clone(),
            dimension: config.embedding_dimension,
        }
    }

    /// Embeds a batch of texts in one provider call. Callers batch; this
    /// never loops per item.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(60))
            .json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("embedding request failed for {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("embedding endpoint returned {status}: {text}"));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("embedding endpoint returned unparsable JSON")?;
        if parsed.data.len() != texts.len() {
            return Err(anyhow!(
                "embedding endpoint returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            ));
        }
        for datum in &parsed.data {
            if datum.embedding.len() != self.dimension {
                return Err(anyhow!(
                    "embedding dimension {} does not match configured {}",
                    datum.embedding.len(),
                    self.dimension
                ));
            }
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
