// src/embeddings/openai.rs
// OpenAI embeddings client (/v1/embeddings)

use crate::error::{Result, WeaveError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const API_URL: &str = "https://api.openai.com/v1/embeddings";

/// Default dimensions for text-embedding-3-small
const DEFAULT_DIMENSIONS: usize = 1536;

/// OpenAI's embedding input limit is 8191 tokens; stay well under it.
const MAX_TEXT_CHARS: usize = 8191 * 3;

/// Max texts per batch request
const MAX_BATCH_SIZE: usize = 256;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// OpenAI embeddings client.
pub struct OpenAiEmbeddings {
    api_key: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, model: String, dimensions: Option<usize>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            api_key,
            model,
            dimensions: dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            http_client,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        if texts.len() <= MAX_BATCH_SIZE {
            return self.embed_texts(texts).await;
        }

        let mut all_results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            all_results.extend(self.embed_texts(chunk).await?);
        }
        Ok(all_results)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| {
                if t.len() > MAX_TEXT_CHARS {
                    debug!("Truncating text from {} chars for OpenAI embedding", t.len());
                    let mut end = MAX_TEXT_CHARS;
                    while end > 0 && !t.is_char_boundary(end) {
                        end -= 1;
                    }
                    &t[..end]
                } else {
                    t.as_str()
                }
            })
            .collect();

        let body = serde_json::json!({
            "input": inputs,
            "model": self.model,
            "dimensions": self.dimensions,
        });

        let response = self
            .http_client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| WeaveError::Embedding(format!("OpenAI embedding request error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(WeaveError::Embedding(format!(
                "OpenAI embedding request failed ({status}): {body_text}"
            )));
        }

        let resp: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| WeaveError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        let mut data = resp.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}
