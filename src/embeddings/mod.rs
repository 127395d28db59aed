// src/embeddings/mod.rs
// Embedding capability: provider trait, backends, and the process-wide cache

mod fake;
mod ollama;
mod openai;

pub use self::fake::FakeEmbedder;
pub use self::ollama::OllamaEmbeddings;
pub use self::openai::OpenAiEmbeddings;

use crate::config::Settings;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Narrow embedding capability. Output length always equals input length and
/// the inner dimension is stable for the process lifetime.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>>;
    fn dim(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Ollama(OllamaEmbeddings),
}

/// Embedding client with automatic provider selection and model-aware
/// query/passage prefixing.
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    model: String,
    /// E5-family models want "query: "/"passage: " prefixes.
    wants_prefix: bool,
}

impl EmbeddingClient {
    /// Create a client from settings.
    ///
    /// Priority: OpenAI (API key present) > Ollama (base URL present).
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        if let Some(api_key) = settings.embed_api_key.as_ref() {
            info!(model = %settings.embed_model, "Using OpenAI-compatible embeddings");
            return Some(Self::wrap(
                settings.embed_model.clone(),
                EmbeddingBackend::OpenAi(OpenAiEmbeddings::new(
                    api_key.clone(),
                    settings.embed_model.clone(),
                    settings.embed_dim,
                )),
            ));
        }

        if let Some(base_url) = settings.embed_base_url.as_ref() {
            info!(model = %settings.embed_model, "Using Ollama embeddings");
            return Some(Self::wrap(
                settings.embed_model.clone(),
                EmbeddingBackend::Ollama(OllamaEmbeddings::new(
                    base_url.clone(),
                    Some(settings.embed_model.clone()),
                    settings.embed_dim,
                )),
            ));
        }

        None
    }

    fn wrap(model: String, backend: EmbeddingBackend) -> Self {
        let wants_prefix = model.to_lowercase().contains("e5");
        Self {
            backend,
            model,
            wants_prefix,
        }
    }

    /// Provider-appropriate sub-batch size so a failed request doesn't
    /// discard embeddings from earlier sub-batches.
    pub fn batch_size(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => 256,
            EmbeddingBackend::Ollama(_) => 64,
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>> {
        let prefixed: Vec<String> = if self.wants_prefix {
            let prefix = if is_query { "query: " } else { "passage: " };
            texts.iter().map(|t| format!("{prefix}{t}")).collect()
        } else {
            texts.to_vec()
        };

        let vectors = match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed_batch(&prefixed).await?,
            EmbeddingBackend::Ollama(c) => c.embed_batch(&prefixed).await?,
        };

        if vectors.len() != texts.len() {
            return Err(crate::error::WeaveError::Embedding(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    fn dim(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Ollama(c) => c.dimensions(),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Process-wide cache of embedding clients keyed by (model, endpoint, dim).
///
/// Held by the application root and passed to persona engines explicitly;
/// there is no ambient singleton.
#[derive(Default)]
pub struct EmbedderCache {
    clients: Mutex<HashMap<(String, String, Option<usize>), Arc<EmbeddingClient>>>,
}

impl EmbedderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build the client for the given settings.
    pub fn get(&self, settings: &Settings) -> Option<Arc<EmbeddingClient>> {
        let endpoint = settings
            .embed_api_key
            .as_ref()
            .map(|_| "openai".to_string())
            .or_else(|| settings.embed_base_url.clone())?;
        let key = (settings.embed_model.clone(), endpoint, settings.embed_dim);

        let mut clients = self.clients.lock().ok()?;
        if let Some(existing) = clients.get(&key) {
            return Some(existing.clone());
        }
        let client = Arc::new(EmbeddingClient::from_settings(settings)?);
        clients.insert(key, client.clone());
        Some(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e5_models_want_prefixes() {
        let client = EmbeddingClient::wrap(
            "intfloat/multilingual-e5-small".into(),
            EmbeddingBackend::Ollama(OllamaEmbeddings::new(
                "http://localhost:11434".into(),
                None,
                None,
            )),
        );
        assert!(client.wants_prefix);

        let client = EmbeddingClient::wrap(
            "nomic-embed-text".into(),
            EmbeddingBackend::Ollama(OllamaEmbeddings::new(
                "http://localhost:11434".into(),
                None,
                None,
            )),
        );
        assert!(!client.wants_prefix);
    }
}
