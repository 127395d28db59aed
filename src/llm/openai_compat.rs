// src/llm/openai_compat.rs
// OpenAI-compatible chat completion client (/v1/chat/completions)
//
// Works against OpenAI itself and any compatible local endpoint. Retries
// transient failures internally; what escapes is final.

use crate::error::{LlmError, LlmErrorCode};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChatMessage, LlmClient};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Internal retry budget for transient failures (timeout, rate limit).
const RETRY_ATTEMPTS: usize = 2;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat client.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>, model: String) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            api_key,
            model,
            http_client,
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
        if status.as_u16() == 429 {
            return LlmError::new(LlmErrorCode::RateLimited, format!("rate limited: {body}"));
        }
        if body.contains("safety") || body.contains("content_filter") {
            return LlmError::new(LlmErrorCode::Safety, format!("blocked by safety filter: {body}"));
        }
        LlmError::new(
            LlmErrorCode::Unknown,
            format!("chat completion failed ({status}): {body}"),
        )
    }

    async fn request_once(
        &self,
        body: &serde_json::Value,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.http_client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::timeout(format!("chat completion timed out: {e}"))
            } else {
                LlmError::new(LlmErrorCode::Unknown, format!("chat completion request error: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body_text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            LlmError::new(LlmErrorCode::Unknown, format!("failed to parse chat response: {e}"))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::empty("chat response had no choices"))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::new(
                LlmErrorCode::Safety,
                "chat completion stopped by content filter",
            ));
        }

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::empty("chat completion returned empty content"));
        }
        Ok(content)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        response_schema: Option<serde_json::Value>,
    ) -> Result<String, LlmError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(schema) = response_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "response",
                    "schema": schema,
                    "strict": true,
                },
            });
        }

        debug!(model = %self.model, message_count = messages_len(&body), "chat completion request");

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1000 * attempt as u64)).await;
            }
            match self.request_once(&body).await {
                Ok(content) => return Ok(content),
                Err(e) => {
                    let retryable =
                        matches!(e.code, LlmErrorCode::Timeout | LlmErrorCode::RateLimited);
                    if retryable && attempt < RETRY_ATTEMPTS {
                        warn!(
                            code = e.code.as_str(),
                            attempt = attempt + 1,
                            "transient LLM failure, retrying"
                        );
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| LlmError::new(LlmErrorCode::Unknown, "chat completion failed")))
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

fn messages_len(body: &serde_json::Value) -> usize {
    body.get("messages")
        .and_then(|m| m.as_array())
        .map(|a| a.len())
        .unwrap_or(0)
}
