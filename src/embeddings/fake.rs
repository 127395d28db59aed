// src/embeddings/fake.rs
// Deterministic in-process embedder for tests

use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Embedder;

/// Deterministic fake embedder.
///
/// Two modes:
/// - `new(dim)` hashes lowercase words into `dim` buckets (hashing trick), so
///   texts sharing words land near each other and unrelated texts do not.
/// - `with_concepts(groups)` dedicates one axis per word group, letting tests
///   state exactly which texts should recall each other. A final axis carries
///   a small residual so no vector has zero norm.
pub struct FakeEmbedder {
    dim: usize,
    concepts: Option<Vec<Vec<String>>>,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            concepts: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_concepts(groups: Vec<Vec<&str>>) -> Self {
        let dim = groups.len() + 1;
        Self {
            dim,
            concepts: Some(
                groups
                    .into_iter()
                    .map(|g| g.into_iter().map(|w| w.to_lowercase()).collect())
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of embed() calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector = vec![0.0f32; self.dim];

        match &self.concepts {
            Some(groups) => {
                for (axis, group) in groups.iter().enumerate() {
                    for word in group {
                        if lower.contains(word.as_str()) {
                            vector[axis] += 1.0;
                        }
                    }
                }
                // Residual axis keeps unrelated texts off the zero vector.
                vector[self.dim - 1] = 0.1;
            }
            None => {
                for word in lower.split_whitespace() {
                    let digest = Sha256::digest(word.as_bytes());
                    let bucket = u64::from_le_bytes(
                        digest[..8].try_into().unwrap_or([0u8; 8]),
                    ) as usize
                        % self.dim;
                    vector[bucket] += 1.0;
                }
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String], _is_query: bool) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_same_vector() {
        let fake = FakeEmbedder::new(16);
        let a = fake.embed(&["hello world".into()], false).await.expect("embed");
        let b = fake.embed(&["hello world".into()], true).await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
    }

    #[tokio::test]
    async fn concept_groups_align_related_texts() {
        let fake = FakeEmbedder::with_concepts(vec![vec!["fruit", "apple", "orange"]]);
        let vectors = fake
            .embed(
                &[
                    "fruit purchase".into(),
                    "I bought apples at the market".into(),
                    "How many?".into(),
                ],
                false,
            )
            .await
            .expect("embed");

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }
}
