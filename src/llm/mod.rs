// src/llm/mod.rs
// LLM capability: provider trait and clients
//
// Clients own their retry budget and usage metering; callers treat a
// surfaced LlmError as final.

mod fake;
mod openai_compat;

pub use self::fake::FakeLlm;
pub use self::openai_compat::OpenAiCompatClient;

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system" | "user" | "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Trait for LLM clients.
///
/// `response_schema`, when given, constrains the output to a JSON document
/// matching the schema; the returned string is then the raw JSON text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        response_schema: Option<serde_json::Value>,
    ) -> Result<String, LlmError>;

    /// Get the model name
    fn model_name(&self) -> String;
}

/// Strip a Markdown code fence (```json ... ```) wrapping, if present.
///
/// Schema-constrained providers return bare JSON, but looser models wrap it.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}
