// src/embeddings/ollama.rs
// Embeddings served by a local Ollama instance
//
// Talks to the OpenAI-compatible /v1/embeddings route, no auth. There is no
// retry here on purpose: message embedding is best-effort (the row is kept
// without chunks) and the re-embed pass repairs whatever failed, so a
// transport error surfaces once and is done.

use crate::error::{Result, WeaveError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Ollama ships nomic-embed-text as its standard embedding model.
const FALLBACK_MODEL: &str = "nomic-embed-text";
const FALLBACK_DIM: usize = 768;

/// Inputs per request; Ollama accepts arrays but degrades past this.
const BATCH_LIMIT: usize = 64;

/// Character cap per input. Chunked message content sits far below this;
/// only raw recall queries can reach it.
const INPUT_CHAR_LIMIT: usize = 16_000;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedRow>,
}

#[derive(Deserialize)]
struct EmbedRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Clip a text to at most `limit` characters (never mid-codepoint).
fn clip_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => {
            debug!(chars = limit, "clipping oversize embedding input");
            &text[..cut]
        }
        None => text,
    }
}

/// Client for Ollama's embeddings endpoint.
pub struct OllamaEmbeddings {
    endpoint: String,
    model: String,
    dim: usize,
    http: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: Option<String>, dim: Option<usize>) -> Self {
        Self {
            endpoint: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            model: model.unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            dim: dim.unwrap_or(FALLBACK_DIM),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Embed texts, splitting the work into endpoint-sized requests.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for group in texts.chunks(BATCH_LIMIT) {
            vectors.extend(self.request(group).await?);
        }
        Ok(vectors)
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbedRequest {
            model: &self.model,
            input: texts.iter().map(|t| clip_chars(t, INPUT_CHAR_LIMIT)).collect(),
        };

        // Transport and decode failures surface as Http; a non-2xx status
        // from the endpoint is an Embedding error with the server's detail.
        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(WeaveError::Embedding(format!(
                "embedding endpoint returned {status}: {detail}"
            )));
        }
        let mut parsed: EmbedResponse = response.json().await?;

        parsed.data.sort_unstable_by_key(|row| row.index);
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}
