//! Concrete [`LlmClient`] backed by an OpenAI-compatible chat
//! completions endpoint — the LLM tier itself is endpoint-agnostic
//! (SPEC_FULL.md §4.5), this is the one real network implementation,
//! wired up the way `collective::sync`'s `RemoteSync` talks to its own
//! HTTP endpoint: a bare `reqwest::Client`, a bearer token, `anyhow`
//! context on every fallible hop.

use crate::error::ExtractError;
use crate::extract::llm_tier::{LlmClient, LlmCompletion};
use async_trait::async_trait;
use serde::Deserialize;

pub struct HttpLlmClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    /// `endpoint` is the full chat-completions URL (e.g.
    /// `https://api.openai.com/v1/chat/completions`).
    pub fn new(endpoint: String, api_key: String, model: String, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            api_key,
            model,
            client,
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<LlmCompletion, ExtractError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.0,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractError::LlmFailure(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ExtractError::LlmFailure(format!("{status}: {text}")));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| ExtractError::LlmFailure(format!("malformed response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::LlmFailure("response had no choices".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(LlmCompletion {
            text: choice.message.content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}
