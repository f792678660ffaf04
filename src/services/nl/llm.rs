//! Pluggable chat-completion providers. Everything model-facing in the
//! repository funnels through [`ChatProvider`]; alternative backends only
//! need the OpenAI-compatible HTTP shape and a name in the registry.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CoreConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;
}

/// Any service speaking the `/chat/completions` shape: OpenAI, vLLM, Ollama's
/// compatibility endpoint, gateway proxies.
pub struct OpenAiCompatProvider {
    name: String,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        http: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut request = self.http.post(&url).timeout(self.timeout).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("chat completion request failed for {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("chat completion returned {status}: {text}"));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("chat completion returned unparsable JSON")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| anyhow!("chat completion returned no content"))
    }
}

/// Name-keyed provider registry with a default. Construction is a plain
/// factory over the configured base URLs.
pub struct LlmRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    default_name: String,
}

impl LlmRegistry {
    pub fn from_config(config: &CoreConfig, http: reqwest::Client) -> Self {
        let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        let default = Arc::new(OpenAiCompatProvider::new(
            config.llm_provider.clone(),
            http,
            &config.llm_base_url,
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            Duration::from_secs(config.llm_timeout_seconds),
        ));
        providers.insert(config.llm_provider.clone(), default);
        Self {
            providers,
            default_name: config.llm_provider.clone(),
        }
    }

    #[cfg(test)]
    pub fn with_provider(provider: Arc<dyn ChatProvider>) -> Self {
        let name = provider.name().to_string();
        let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert(name.clone(), provider);
        Self {
            providers,
            default_name: name,
        }
    }

    /// Resolves the default provider or a per-call override by name.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn ChatProvider>> {
        let name = name.unwrap_or(&self.default_name);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown LLM provider: {name}"))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted provider for pipeline tests: pops canned replies in order and
    /// records every prompt it was handed.
    pub struct ScriptedProvider {
        name: String,
        replies: Mutex<Vec<Result<String, String>>>,
        pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Result<String, String>>) -> Self {
            let mut reversed = replies;
            reversed.reverse();
            Self {
                name: "scripted".to_string(),
                replies: Mutex::new(reversed),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            match self.replies.lock().unwrap().pop() {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Err(anyhow!("scripted provider ran out of replies")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_default_and_override() {
        let config = crate::test_support::test_config();
        let registry = LlmRegistry::from_config(&config, reqwest::Client::new());
        assert!(registry.get(None).is_ok());
        assert!(registry.get(Some("openai")).is_ok());
        assert!(registry.get(Some("missing-provider")).is_err());
    }

    #[tokio::test]
    async fn scripted_provider_pops_in_order() {
        let provider = testing::ScriptedProvider::new(vec![
            Ok("SELECT 1".to_string()),
            Err("boom".to_string()),
        ]);
        let first = provider.chat(&[ChatMessage::user("hi")], 0.0, 10).await;
        assert_eq!(first.unwrap(), "SELECT 1");
        assert!(provider.chat(&[], 0.0, 10).await.is_err());
    }
}
