// src/llm/fake.rs
// Scripted in-process LLM for tests

use crate::error::LlmError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ChatMessage, LlmClient};

/// Fake LLM client.
///
/// Responses are served from a scripted queue; once the queue drains, every
/// call returns a deterministic summary line derived from the prompt. All
/// received prompts are recorded for assertions.
pub struct FakeLlm {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue one more scripted response.
    pub fn push_response(&self, response: Result<String, LlmError>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    /// All prompts received so far (last user message of each call).
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for FakeLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        _response_schema: Option<serde_json::Value>,
    ) -> Result<String, LlmError> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }

        if let Ok(mut queue) = self.responses.lock()
            && let Some(scripted) = queue.pop_front()
        {
            return scripted;
        }

        Ok(format!("要約 #{}: {} 文字の入力をまとめた。", self.call_count(), prompt.chars().count()))
    }

    fn model_name(&self) -> String {
        "fake-llm".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmErrorCode;

    #[tokio::test]
    async fn scripted_responses_then_default() {
        let fake = FakeLlm::with_responses(vec![
            Ok("first".to_string()),
            Err(LlmError::new(LlmErrorCode::Timeout, "slow")),
        ]);

        let first = fake
            .generate(vec![ChatMessage::user("a")], None)
            .await
            .expect("first");
        assert_eq!(first, "first");

        let second = fake.generate(vec![ChatMessage::user("b")], None).await;
        assert!(second.is_err());

        let third = fake
            .generate(vec![ChatMessage::user("c")], None)
            .await
            .expect("default");
        assert!(third.contains("要約"));

        assert_eq!(fake.call_count(), 3);
        assert_eq!(fake.prompts(), vec!["a", "b", "c"]);
    }
}
