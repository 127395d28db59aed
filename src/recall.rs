// src/recall.rs
// Semantic recall: cosine top-k over chunk embeddings with neighbor expansion

use crate::db::messages::{self, Message};
use crate::db::pool::DatabasePool;
use crate::embeddings::Embedder;
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Recall request parameters.
#[derive(Debug, Clone, Default)]
pub struct RecallParams {
    pub thread_id: Option<String>,
    pub resource_id: Option<String>,
    pub topk: usize,
    pub range_before: usize,
    pub range_after: usize,
    /// "resource" searches all threads sharing resource_id; anything else
    /// stays within thread_id.
    pub scope: String,
    /// Every tag listed must be present in the message metadata.
    pub required_tags: Vec<String>,
    pub exclude_message_ids: HashSet<String>,
}

/// A recall group: the semantically matching seed, its chronological
/// neighborhood bundle (seed included), and the seed's cosine score.
#[derive(Debug, Clone)]
pub struct RecallGroup {
    pub seed: Message,
    pub bundle: Vec<Message>,
    pub score: f32,
}

/// Cosine similarity in f32; zero norm on either side scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Score the corpus and keep the top-k seeds (max chunk score per message).
async fn score_seeds(
    pool: &Arc<DatabasePool>,
    embedder: &Arc<dyn Embedder>,
    query: &str,
    params: &RecallParams,
) -> Result<Vec<(Message, f32, usize)>> {
    let query_vectors = embedder.embed(&[query.to_string()], true).await?;
    let query_vec = query_vectors
        .into_iter()
        .next()
        .ok_or_else(|| crate::error::WeaveError::Embedding("empty query embedding".into()))?;
    let dim = query_vec.len();

    let (thread_filter, resource_filter) = if params.scope == "resource" && params.resource_id.is_some()
    {
        (None, params.resource_id.clone())
    } else {
        (params.thread_id.clone(), None)
    };

    let corpus = pool
        .interact(move |conn| {
            messages::get_embeddings_for_scope_sync(
                conn,
                thread_filter.as_deref(),
                resource_filter.as_deref(),
            )
        })
        .await?;

    // Max score per message across its chunks.
    let mut scored: Vec<(Message, f32, usize)> = Vec::new();
    let mut index_by_id: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for (msg, vector, chunk_index) in corpus {
        if params.exclude_message_ids.contains(&msg.id) {
            continue;
        }
        if !params.required_tags.is_empty() {
            let tags = msg.tags();
            if !params.required_tags.iter().all(|t| tags.contains(&t.as_str())) {
                continue;
            }
        }
        if vector.len() != dim {
            warn!(
                message_id = %msg.id,
                expected = dim,
                got = vector.len(),
                "skipping chunk with embedding dim mismatch"
            );
            continue;
        }
        let score = cosine_similarity(&query_vec, &vector);
        match index_by_id.get(&msg.id) {
            Some(&i) => {
                if score > scored[i].1 {
                    scored[i].1 = score;
                    scored[i].2 = chunk_index;
                }
            }
            None => {
                index_by_id.insert(msg.id.clone(), scored.len());
                scored.push((msg, score, chunk_index));
            }
        }
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(params.topk);
    Ok(scored)
}

/// Fetch the chronological neighborhood bundle for each seed.
async fn expand_groups(
    pool: &Arc<DatabasePool>,
    seeds: Vec<(Message, f32, usize)>,
    before: usize,
    after: usize,
) -> Result<Vec<RecallGroup>> {
    pool.interact(move |conn| {
        let mut groups = Vec::with_capacity(seeds.len());
        for (seed, score, _chunk_index) in seeds {
            let mut bundle = if before > 0 || after > 0 {
                messages::get_messages_around_sync(conn, &seed, before, after)?
            } else {
                Vec::new()
            };
            bundle.push(seed.clone());
            bundle.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            groups.push(RecallGroup { seed, bundle, score });
        }
        Ok(groups)
    })
    .await
    .map_err(Into::into)
}

/// Top-k semantic recall with ±range neighbor expansion.
///
/// Returns the union of all bundles, chronologically ordered and deduped.
pub async fn semantic_recall(
    pool: &Arc<DatabasePool>,
    embedder: &Arc<dyn Embedder>,
    query: &str,
    params: &RecallParams,
) -> Result<Vec<Message>> {
    let groups = semantic_recall_groups(pool, embedder, query, params).await?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<Message> = Vec::new();
    for group in groups {
        for msg in group.bundle {
            if seen.insert(msg.id.clone()) {
                merged.push(msg);
            }
        }
    }
    merged.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    Ok(merged)
}

/// Like `semantic_recall` but keeps each seed's neighborhood as its own
/// group, for building per-seed recall blocks in prompt context.
pub async fn semantic_recall_groups(
    pool: &Arc<DatabasePool>,
    embedder: &Arc<dyn Embedder>,
    query: &str,
    params: &RecallParams,
) -> Result<Vec<RecallGroup>> {
    let seeds = score_seeds(pool, embedder, query, params).await?;
    expand_groups(pool, seeds, params.range_before, params.range_after).await
}

/// Render recall groups into a compact text snippet for prompt injection.
///
/// Seed lines carry the cosine score; every line is truncated to 240 chars
/// and the whole snippet to `max_chars`.
pub fn build_recall_snippet(groups: &[RecallGroup], max_chars: usize) -> String {
    let mut lines: Vec<String> = vec!["[Memory Recall]".to_string()];
    let mut seen: HashSet<&str> = HashSet::new();

    for group in groups {
        for msg in &group.bundle {
            if !seen.insert(&msg.id) {
                continue;
            }
            let mut content = msg.content.trim().replace('\n', " ");
            if content.is_empty() {
                continue;
            }
            if content.chars().count() > 240 {
                content = content.chars().take(240).collect::<String>() + "…";
            }
            let ts = chrono::DateTime::from_timestamp(msg.created_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "?".to_string());
            let line = if msg.id == group.seed.id {
                format!("- {} @ {} (score={:.3}): {}", msg.display_role(), ts, group.score, content)
            } else {
                format!("- {} @ {}: {}", msg.display_role(), ts, content)
            };
            lines.push(line);
        }
    }

    if lines.len() == 1 {
        return String::new();
    }
    let snippet = lines.join("\n");
    if snippet.chars().count() > max_chars {
        snippet.chars().take(max_chars.saturating_sub(1)).collect::<String>() + "…"
    } else {
        snippet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::FakeEmbedder;
    use crate::messages::MessageStore;

    fn params_for_thread(thread_id: &str, topk: usize) -> RecallParams {
        RecallParams {
            thread_id: Some(thread_id.to_string()),
            topk,
            range_before: 1,
            range_after: 1,
            scope: "thread".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn cosine_handles_zero_norm() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[tokio::test]
    async fn recall_expands_neighbors_and_orders_chronologically() {
        let embedder: Arc<FakeEmbedder> = Arc::new(FakeEmbedder::with_concepts(vec![
            vec!["fruit", "apple", "orange"],
            vec!["weather", "rain"],
        ]));
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let store = MessageStore::new(
            pool.clone(),
            Some(embedder.clone() as Arc<dyn Embedder>),
            0,
            480,
        );

        store
            .append_message("p1:t", "user", "I bought apples at the market", None, Some(10), None)
            .await
            .expect("m1");
        store
            .append_message("p1:t", "assistant", "How many?", None, Some(11), None)
            .await
            .expect("m2");
        store
            .append_message("p1:t", "user", "Twelve, and some oranges too", None, Some(12), None)
            .await
            .expect("m3");
        store
            .append_message("p1:t", "user", "It might rain tomorrow", None, Some(13), None)
            .await
            .expect("m4");

        let embedder_dyn: Arc<dyn Embedder> = embedder;
        let result = semantic_recall(
            &pool,
            &embedder_dyn,
            "fruit purchase",
            &params_for_thread("p1:t", 2),
        )
        .await
        .expect("recall");

        let contents: Vec<&str> = result.iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"I bought apples at the market"));
        assert!(contents.contains(&"Twelve, and some oranges too"));
        // Neighbor pulled in by expansion
        assert!(contents.contains(&"How many?"));
        // Chronological order
        let times: Vec<i64> = result.iter().map(|m| m.created_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
        // No duplicates
        let ids: HashSet<&str> = result.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), result.len());
    }

    #[tokio::test]
    async fn dim_mismatch_chunks_are_skipped() {
        let embedder: Arc<FakeEmbedder> =
            Arc::new(FakeEmbedder::with_concepts(vec![vec!["fruit", "apple"]]));
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let store = MessageStore::new(
            pool.clone(),
            Some(embedder.clone() as Arc<dyn Embedder>),
            0,
            480,
        );

        let good = store
            .append_message("p1:t", "user", "apple pie recipe", None, Some(1), None)
            .await
            .expect("good");
        let bad = store
            .append_message("p1:t", "user", "fruit salad", None, Some(2), None)
            .await
            .expect("bad");
        // Corrupt the second message's vector dimension.
        store
            .replace_message_embeddings(&bad, vec![vec![1.0; 99]])
            .await
            .expect("corrupt");

        let embedder_dyn: Arc<dyn Embedder> = embedder;
        let mut params = params_for_thread("p1:t", 5);
        params.range_before = 0;
        params.range_after = 0;
        let result = semantic_recall(&pool, &embedder_dyn, "fruit", &params)
            .await
            .expect("recall");

        let ids: Vec<&str> = result.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&good.as_str()));
        assert!(!ids.contains(&bad.as_str()));
    }

    #[tokio::test]
    async fn required_tags_filter_corpus() {
        let embedder: Arc<FakeEmbedder> =
            Arc::new(FakeEmbedder::with_concepts(vec![vec!["festival"]]));
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let store = MessageStore::new(
            pool.clone(),
            Some(embedder.clone() as Arc<dyn Embedder>),
            0,
            480,
        );

        store
            .append_message(
                "p1:t",
                "user",
                "festival planning",
                None,
                Some(1),
                Some(serde_json::json!({"tags": ["conversation"]})),
            )
            .await
            .expect("tagged");
        let untagged = store
            .append_message("p1:t", "user", "festival budget", None, Some(2), None)
            .await
            .expect("untagged");

        let embedder_dyn: Arc<dyn Embedder> = embedder;
        let mut params = params_for_thread("p1:t", 5);
        params.range_before = 0;
        params.range_after = 0;
        params.required_tags = vec!["conversation".to_string()];
        let result = semantic_recall(&pool, &embedder_dyn, "festival", &params)
            .await
            .expect("recall");

        assert_eq!(result.len(), 1);
        assert_ne!(result[0].id, untagged);
    }

    #[tokio::test]
    async fn groups_carry_seed_and_sorted_bundle() {
        let embedder: Arc<FakeEmbedder> =
            Arc::new(FakeEmbedder::with_concepts(vec![vec!["garden"]]));
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let store = MessageStore::new(
            pool.clone(),
            Some(embedder.clone() as Arc<dyn Embedder>),
            0,
            480,
        );

        store
            .append_message("p1:t", "user", "before", None, Some(1), None)
            .await
            .expect("m0");
        let seed_id = store
            .append_message("p1:t", "user", "garden tour", None, Some(2), None)
            .await
            .expect("seed");
        store
            .append_message("p1:t", "user", "after", None, Some(3), None)
            .await
            .expect("m2");

        let embedder_dyn: Arc<dyn Embedder> = embedder;
        let groups = semantic_recall_groups(
            &pool,
            &embedder_dyn,
            "garden",
            &params_for_thread("p1:t", 1),
        )
        .await
        .expect("groups");

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].seed.id, seed_id);
        assert_eq!(groups[0].bundle.len(), 3);
        let times: Vec<i64> = groups[0].bundle.iter().map(|m| m.created_at).collect();
        assert_eq!(times, vec![1, 2, 3]);

        let snippet = build_recall_snippet(&groups, 800);
        assert!(snippet.starts_with("[Memory Recall]"));
        assert!(snippet.contains("score="));
    }
}
