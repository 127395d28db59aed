// src/messages.rs
// Async message API over the per-persona store
//
// Appends write the message row first, then chunk + embed as a separate
// best-effort step: an embedding failure never loses the message, the
// chunks are picked up by the next re-embed run.

use crate::chunker::chunk_text;
use crate::db::messages::{self, Message, ThreadSummary};
use crate::db::pool::DatabasePool;
use crate::embeddings::Embedder;
use crate::error::{Result, WeaveError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Distinguished suffix for a persona's private thread; building-scoped
/// threads use the building id as the suffix.
pub const PERSONA_THREAD_SUFFIX: &str = "__persona__";

/// Build a full thread id from persona id and suffix.
pub fn thread_id_for(persona_id: &str, suffix: Option<&str>) -> String {
    format!("{persona_id}:{}", suffix.unwrap_or(PERSONA_THREAD_SUFFIX))
}

/// Message-level operations for one persona.
pub struct MessageStore {
    pool: Arc<DatabasePool>,
    embedder: Option<Arc<dyn Embedder>>,
    pub chunk_min_chars: usize,
    pub chunk_max_chars: usize,
}

impl MessageStore {
    pub fn new(
        pool: Arc<DatabasePool>,
        embedder: Option<Arc<dyn Embedder>>,
        chunk_min_chars: usize,
        chunk_max_chars: usize,
    ) -> Self {
        Self {
            pool,
            embedder,
            chunk_min_chars,
            chunk_max_chars,
        }
    }

    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    /// Append a message, creating the thread if missing.
    ///
    /// `created_at` defaults to now. Content is chunked and embedded unless
    /// empty or embedding is disabled in metadata.
    pub async fn append_message(
        &self,
        thread_id: &str,
        role: &str,
        content: &str,
        resource_id: Option<&str>,
        created_at: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let created_at = created_at.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let metadata = metadata.unwrap_or(serde_json::Value::Null);

        let embedding_disabled = metadata
            .get("embedding_disabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        {
            let thread_id = thread_id.to_string();
            let role = role.to_string();
            let content = content.to_string();
            let resource_id = resource_id.map(str::to_string);
            let message_id = message_id.clone();
            let metadata = metadata.clone();
            self.pool
                .interact_with_retry(move |conn| {
                    messages::get_or_create_thread_sync(conn, &thread_id, resource_id.as_deref())?;
                    messages::insert_message_sync(
                        conn,
                        &message_id,
                        &thread_id,
                        &role,
                        &content,
                        resource_id.as_deref(),
                        created_at,
                        &metadata,
                    )
                })
                .await?;
        }

        if !content.trim().is_empty() && !embedding_disabled {
            if let Err(e) = self.embed_and_store(&message_id, content).await {
                warn!(%message_id, "embedding failed, message kept without chunks: {e}");
            }
        }

        debug!(%message_id, thread_id, role, "message appended");
        Ok(message_id)
    }

    /// Chunk content and write its embedding rows (atomic replacement).
    async fn embed_and_store(&self, message_id: &str, content: &str) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        let chunks = chunk_text(content, self.chunk_min_chars, self.chunk_max_chars);
        let vectors = embedder.embed(&chunks, false).await?;
        self.replace_message_embeddings(message_id, vectors).await
    }

    /// Internal: replace a message's embedding chunks (used by re-embed too).
    pub async fn replace_message_embeddings(
        &self,
        message_id: &str,
        vectors: Vec<Vec<f32>>,
    ) -> Result<()> {
        let message_id = message_id.to_string();
        self.pool
            .interact(move |conn| messages::replace_message_embeddings_sync(conn, &message_id, &vectors))
            .await?;
        Ok(())
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let message_id = message_id.to_string();
        self.pool
            .interact(move |conn| messages::get_message_sync(conn, &message_id))
            .await
            .map_err(Into::into)
    }

    /// 0-indexed page of a thread's messages, ascending by (created_at, id).
    pub async fn list_thread_messages(
        &self,
        thread_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Message>> {
        let thread_id = thread_id.to_string();
        self.pool
            .interact(move |conn| messages::get_messages_paginated_sync(conn, &thread_id, page, page_size))
            .await
            .map_err(Into::into)
    }

    pub async fn count_thread_messages(&self, thread_id: &str) -> Result<i64> {
        let thread_id = thread_id.to_string();
        self.pool
            .interact(move |conn| messages::count_thread_messages_sync(conn, &thread_id))
            .await
            .map_err(Into::into)
    }

    /// Last `limit` messages, oldest-first.
    pub async fn get_messages_last(&self, thread_id: &str, limit: usize) -> Result<Vec<Message>> {
        let thread_id = thread_id.to_string();
        self.pool
            .interact(move |conn| messages::get_messages_last_sync(conn, &thread_id, limit))
            .await
            .map_err(Into::into)
    }

    /// Neighbors of a message in its thread, excluding the anchor.
    pub async fn get_messages_around(
        &self,
        message_id: &str,
        before: usize,
        after: usize,
    ) -> Result<Vec<Message>> {
        let message_id = message_id.to_string();
        self.pool
            .interact(move |conn| {
                let Some(anchor) = messages::get_message_sync(conn, &message_id)? else {
                    return Ok(Vec::new());
                };
                messages::get_messages_around_sync(conn, &anchor, before, after)
            })
            .await
            .map_err(Into::into)
    }

    /// Replace a message's content and re-embed it.
    ///
    /// The row update and chunk deletion commit together; the fresh chunks
    /// follow once embedding succeeds. Empty new content leaves the row with
    /// zero chunks.
    pub async fn update_message_content(&self, message_id: &str, new_content: &str) -> Result<()> {
        let found = {
            let message_id = message_id.to_string();
            let new_content = new_content.to_string();
            self.pool
                .interact(move |conn| {
                    let tx = conn.unchecked_transaction()?;
                    let updated = messages::update_message_row_sync(conn, &message_id, &new_content, None)?;
                    if updated {
                        messages::delete_message_embeddings_sync(conn, &message_id)?;
                    }
                    tx.commit()?;
                    Ok(updated)
                })
                .await?
        };
        if !found {
            return Err(WeaveError::NotFound(format!("message not found: {message_id}")));
        }

        if !new_content.trim().is_empty() {
            if let Err(e) = self.embed_and_store(message_id, new_content).await {
                warn!(message_id, "re-embedding after update failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let deleted = {
            let message_id = message_id.to_string();
            self.pool
                .interact(move |conn| messages::delete_message_sync(conn, &message_id))
                .await?
        };
        if !deleted {
            return Err(WeaveError::NotFound(format!("message not found: {message_id}")));
        }
        Ok(())
    }

    /// Delete a thread and everything under it (messages first, then the row).
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let deleted = {
            let thread_id = thread_id.to_string();
            self.pool
                .interact(move |conn| messages::delete_thread_sync(conn, &thread_id))
                .await?
        };
        if !deleted {
            return Err(WeaveError::NotFound(format!("thread not found: {thread_id}")));
        }
        Ok(())
    }

    pub async fn list_thread_summaries(&self, persona_id: &str) -> Result<Vec<ThreadSummary>> {
        let persona_id = persona_id.to_string();
        self.pool
            .interact(move |conn| messages::list_thread_summaries_sync(conn, &persona_id))
            .await
            .map_err(Into::into)
    }

    pub async fn set_thread_overview(&self, thread_id: &str, overview: &str) -> Result<()> {
        let thread_id = thread_id.to_string();
        let overview = overview.to_string();
        self.pool
            .interact(move |conn| messages::set_thread_overview_sync(conn, &thread_id, &overview))
            .await
            .map_err(Into::into)
    }

    pub async fn get_thread_overview(&self, thread_id: &str) -> Result<Option<String>> {
        let thread_id = thread_id.to_string();
        self.pool
            .interact(move |conn| messages::get_thread_overview_sync(conn, &thread_id))
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::FakeEmbedder;

    async fn store_with_fake() -> MessageStore {
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        MessageStore::new(pool, Some(Arc::new(FakeEmbedder::new(8))), 0, 480)
    }

    #[tokio::test]
    async fn append_creates_thread_and_embeds() {
        let store = store_with_fake().await;
        let id = store
            .append_message("p1:t", "user", "hello there", Some("p1"), Some(100), None)
            .await
            .expect("append");

        let msg = store.get_message(&id).await.expect("get").expect("exists");
        assert_eq!(msg.thread_id, "p1:t");
        assert_eq!(msg.created_at, 100);

        let dims = {
            let id = id.clone();
            store
                .pool()
                .interact(move |conn| crate::db::messages::get_embedding_dims_sync(conn, &id))
                .await
                .expect("dims")
        };
        assert_eq!(dims, vec![8]);
    }

    #[tokio::test]
    async fn empty_content_is_not_embedded() {
        let store = store_with_fake().await;
        let id = store
            .append_message("p1:t", "system", "", None, None, None)
            .await
            .expect("append");

        let dims = {
            let id = id.clone();
            store
                .pool()
                .interact(move |conn| crate::db::messages::get_embedding_dims_sync(conn, &id))
                .await
                .expect("dims")
        };
        assert!(dims.is_empty());
    }

    #[tokio::test]
    async fn metadata_can_disable_embedding() {
        let store = store_with_fake().await;
        let id = store
            .append_message(
                "p1:t",
                "user",
                "do not embed this",
                None,
                None,
                Some(serde_json::json!({"embedding_disabled": true})),
            )
            .await
            .expect("append");

        let dims = {
            let id = id.clone();
            store
                .pool()
                .interact(move |conn| crate::db::messages::get_embedding_dims_sync(conn, &id))
                .await
                .expect("dims")
        };
        assert!(dims.is_empty());
    }

    #[tokio::test]
    async fn update_replaces_content_and_chunks() {
        let store = store_with_fake().await;
        let id = store
            .append_message("p1:t", "user", "original", None, Some(1), None)
            .await
            .expect("append");

        store
            .update_message_content(&id, "replacement text")
            .await
            .expect("update");

        let msg = store.get_message(&id).await.expect("get").expect("exists");
        assert_eq!(msg.content, "replacement text");

        // Emptying the content leaves zero chunks.
        store.update_message_content(&id, "").await.expect("clear");
        let dims = {
            let id = id.clone();
            store
                .pool()
                .interact(move |conn| crate::db::messages::get_embedding_dims_sync(conn, &id))
                .await
                .expect("dims")
        };
        assert!(dims.is_empty());
    }

    #[tokio::test]
    async fn update_missing_message_is_not_found() {
        let store = store_with_fake().await;
        let err = store
            .update_message_content("nope", "content")
            .await
            .expect_err("missing");
        assert!(matches!(err, WeaveError::NotFound(_)));
    }

    #[test]
    fn thread_id_convention() {
        assert_eq!(thread_id_for("air_city_a", None), "air_city_a:__persona__");
        assert_eq!(thread_id_for("air_city_a", Some("bldg9")), "air_city_a:bldg9");
    }
}
