// src/db/messages.rs
// Threads, messages, and message_embeddings - sync SQL layer
//
// All functions take &Connection and run inside pool.interact() closures.
// Message ordering everywhere is ascending created_at with id as tiebreak.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// A stored conversational message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub resource_id: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Message {
    /// Role with the `model` alias folded into `assistant`.
    pub fn display_role(&self) -> &str {
        if self.role == "model" { "assistant" } else { &self.role }
    }

    /// Tags carried in metadata (`tags: [string]` by convention).
    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get("tags")
            .and_then(|t| t.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Whether embedding was explicitly disabled for this message.
    pub fn embedding_disabled(&self) -> bool {
        self.metadata
            .get("embedding_disabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Summary row for the thread list. The active flag is stamped by the
/// engine from active_state.json, not stored here.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub id: String,
    pub suffix: String,
    pub resource_id: Option<String>,
    pub overview: Option<String>,
    pub message_count: i64,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<i64>,
    pub is_active: bool,
}

pub(crate) fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let metadata_raw: Option<String> = row.get(6)?;
    let metadata = metadata_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null);
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        resource_id: row.get(4)?,
        created_at: row.get(5)?,
        metadata,
    })
}

const MESSAGE_COLUMNS: &str = "id, thread_id, role, content, resource_id, created_at, metadata";

// ----- Threads -----

pub fn get_or_create_thread_sync(
    conn: &Connection,
    thread_id: &str,
    resource_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO threads (id, resource_id) VALUES (?, ?) ON CONFLICT(id) DO NOTHING",
        params![thread_id, resource_id],
    )?;
    Ok(())
}

pub fn thread_exists_sync(conn: &Connection, thread_id: &str) -> Result<bool> {
    let exists = conn
        .query_row("SELECT 1 FROM threads WHERE id = ?", [thread_id], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(exists)
}

pub fn set_thread_overview_sync(conn: &Connection, thread_id: &str, overview: &str) -> Result<()> {
    let updated = conn.execute(
        "UPDATE threads SET overview = ?, overview_updated_at = ? WHERE id = ?",
        params![overview, chrono::Utc::now().timestamp(), thread_id],
    )?;
    if updated == 0 {
        anyhow::bail!("thread not found: {thread_id}");
    }
    Ok(())
}

pub fn get_thread_overview_sync(conn: &Connection, thread_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT overview FROM threads WHERE id = ?",
            [thread_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

/// Thread list with preview of the most recent message.
pub fn list_thread_summaries_sync(conn: &Connection, persona_id: &str) -> Result<Vec<ThreadSummary>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.resource_id, t.overview,
                (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id),
                (SELECT m.content FROM messages m WHERE m.thread_id = t.id
                 ORDER BY m.created_at DESC, m.id DESC LIMIT 1),
                (SELECT m.created_at FROM messages m WHERE m.thread_id = t.id
                 ORDER BY m.created_at DESC, m.id DESC LIMIT 1)
         FROM threads t ORDER BY t.id ASC",
    )?;
    let prefix = format!("{persona_id}:");
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let preview: Option<String> = row.get(4)?;
        Ok(ThreadSummary {
            suffix: id.strip_prefix(&prefix).unwrap_or(&id).to_string(),
            id,
            resource_id: row.get(1)?,
            overview: row.get(2)?,
            message_count: row.get(3)?,
            last_message_preview: preview.map(|p| {
                if p.chars().count() > 120 {
                    let truncated: String = p.chars().take(120).collect();
                    format!("{truncated}…")
                } else {
                    p
                }
            }),
            last_message_at: row.get(5)?,
            is_active: false,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ----- Messages -----

pub fn insert_message_sync(
    conn: &Connection,
    id: &str,
    thread_id: &str,
    role: &str,
    content: &str,
    resource_id: Option<&str>,
    created_at: i64,
    metadata: &serde_json::Value,
) -> Result<()> {
    let metadata_text = if metadata.is_null() {
        None
    } else {
        Some(serde_json::to_string(metadata)?)
    };
    conn.execute(
        "INSERT INTO messages (id, thread_id, role, content, resource_id, created_at, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![id, thread_id, role, content, resource_id, created_at, metadata_text],
    )?;
    Ok(())
}

pub fn get_message_sync(conn: &Connection, message_id: &str) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"),
            [message_id],
            row_to_message,
        )
        .optional()?)
}

pub fn get_messages_by_ids_sync(conn: &Connection, ids: &[String]) -> Result<Vec<Message>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(msg) = get_message_sync(conn, id)? {
            out.push(msg);
        }
    }
    out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    Ok(out)
}

/// Last `limit` messages of a thread, returned oldest-first.
pub fn get_messages_last_sync(conn: &Connection, thread_id: &str, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?
         ORDER BY created_at DESC, id DESC LIMIT ?"
    ))?;
    let mut rows = stmt
        .query_map(params![thread_id, limit as i64], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.reverse();
    Ok(rows)
}

/// 0-indexed pagination, ascending chronological order.
pub fn get_messages_paginated_sync(
    conn: &Connection,
    thread_id: &str,
    page: usize,
    page_size: usize,
) -> Result<Vec<Message>> {
    let page_size = page_size.max(1);
    let offset = page * page_size;
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?
         ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
    ))?;
    let rows = stmt
        .query_map(params![thread_id, page_size as i64, offset as i64], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_thread_messages_sync(conn: &Connection, thread_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE thread_id = ?",
        [thread_id],
        |row| row.get(0),
    )?)
}

pub fn count_messages_sync(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
}

/// All messages in global chronological order (chronicle generation input).
pub fn get_all_messages_ordered_sync(conn: &Connection) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Messages within [from, to] across all threads, ascending, capped.
pub fn get_messages_in_range_sync(
    conn: &Connection,
    from: i64,
    to: i64,
    limit: usize,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE created_at >= ? AND created_at <= ?
         ORDER BY created_at ASC, id ASC LIMIT ?"
    ))?;
    let rows = stmt
        .query_map(params![from, to, limit as i64], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Most recent message in a thread whose content contains `needle`.
pub fn find_message_containing_sync(
    conn: &Connection,
    thread_id: &str,
    needle: &str,
) -> Result<Option<Message>> {
    let pattern = format!("%{needle}%");
    Ok(conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE thread_id = ? AND content LIKE ?
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ),
            params![thread_id, pattern],
            row_to_message,
        )
        .optional()?)
}

/// Neighbors of a message within its thread: `before` earlier plus `after`
/// later messages, returned as one chronologically ascending list that does
/// not include the anchor itself.
pub fn get_messages_around_sync(
    conn: &Connection,
    anchor: &Message,
    before: usize,
    after: usize,
) -> Result<Vec<Message>> {
    let mut earlier = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ? AND (created_at < ? OR (created_at = ? AND id < ?))
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))?;
        stmt.query_map(
            params![anchor.thread_id, anchor.created_at, anchor.created_at, anchor.id, before as i64],
            row_to_message,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };
    earlier.reverse();

    let later = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ? AND (created_at > ? OR (created_at = ? AND id > ?))
             ORDER BY created_at ASC, id ASC LIMIT ?"
        ))?;
        stmt.query_map(
            params![anchor.thread_id, anchor.created_at, anchor.created_at, anchor.id, after as i64],
            row_to_message,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    earlier.extend(later);
    Ok(earlier)
}

pub fn update_message_row_sync(
    conn: &Connection,
    message_id: &str,
    content: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<bool> {
    let updated = match metadata {
        Some(meta) => {
            let meta_text = serde_json::to_string(meta)?;
            conn.execute(
                "UPDATE messages SET content = ?, metadata = ? WHERE id = ?",
                params![content, meta_text, message_id],
            )?
        }
        None => conn.execute(
            "UPDATE messages SET content = ? WHERE id = ?",
            params![content, message_id],
        )?,
    };
    Ok(updated > 0)
}

pub fn delete_message_sync(conn: &Connection, message_id: &str) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM message_embeddings WHERE message_id = ?", [message_id])?;
    let deleted = tx.execute("DELETE FROM messages WHERE id = ?", [message_id])?;
    tx.commit()?;
    Ok(deleted > 0)
}

/// Delete every message of a thread (embeddings first), then the thread row.
pub fn delete_thread_sync(conn: &Connection, thread_id: &str) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM message_embeddings WHERE message_id IN
         (SELECT id FROM messages WHERE thread_id = ?)",
        [thread_id],
    )?;
    tx.execute("DELETE FROM messages WHERE thread_id = ?", [thread_id])?;
    let deleted = tx.execute("DELETE FROM threads WHERE id = ?", [thread_id])?;
    tx.commit()?;
    Ok(deleted > 0)
}

// ----- Embedding chunks -----

/// Replace all chunks for a message atomically (delete-then-insert, one tx).
pub fn replace_message_embeddings_sync(
    conn: &Connection,
    message_id: &str,
    vectors: &[Vec<f32>],
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM message_embeddings WHERE message_id = ?", [message_id])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO message_embeddings (message_id, chunk_index, vector) VALUES (?, ?, ?)",
        )?;
        for (chunk_index, vector) in vectors.iter().enumerate() {
            stmt.execute(params![message_id, chunk_index as i64, serde_json::to_string(vector)?])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn delete_message_embeddings_sync(conn: &Connection, message_id: &str) -> Result<()> {
    conn.execute("DELETE FROM message_embeddings WHERE message_id = ?", [message_id])?;
    Ok(())
}

/// Chunk vector dimensions stored for a message, in chunk order.
pub fn get_embedding_dims_sync(conn: &Connection, message_id: &str) -> Result<Vec<usize>> {
    let mut stmt = conn.prepare(
        "SELECT vector FROM message_embeddings WHERE message_id = ? ORDER BY chunk_index ASC",
    )?;
    let rows = stmt.query_map([message_id], |row| row.get::<_, String>(0))?;
    let mut dims = Vec::new();
    for raw in rows {
        let vector: Vec<f32> = serde_json::from_str(&raw?).unwrap_or_default();
        dims.push(vector.len());
    }
    Ok(dims)
}

pub fn count_embedded_messages_sync(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(DISTINCT message_id) FROM message_embeddings",
        [],
        |row| row.get(0),
    )?)
}

/// Corpus for recall scoring: every (message, chunk vector, chunk index) in
/// the scope. Thread scope wins when both filters are provided.
pub fn get_embeddings_for_scope_sync(
    conn: &Connection,
    thread_id: Option<&str>,
    resource_id: Option<&str>,
) -> Result<Vec<(Message, Vec<f32>, usize)>> {
    let base = "SELECT m.id, m.thread_id, m.role, m.content, m.resource_id, m.created_at, m.metadata,
                e.vector, e.chunk_index
         FROM messages m JOIN message_embeddings e ON m.id = e.message_id";
    let (sql, filter): (String, Option<&str>) = match (thread_id, resource_id) {
        (Some(tid), _) => (
            format!("{base} WHERE m.thread_id = ? ORDER BY m.created_at ASC, m.id ASC, e.chunk_index ASC"),
            Some(tid),
        ),
        (None, Some(rid)) => (
            format!("{base} WHERE m.resource_id = ? ORDER BY m.created_at ASC, m.id ASC, e.chunk_index ASC"),
            Some(rid),
        ),
        (None, None) => (
            format!("{base} ORDER BY m.created_at ASC, m.id ASC, e.chunk_index ASC"),
            None,
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &Row| -> rusqlite::Result<(Message, String, i64)> {
        Ok((row_to_message(row)?, row.get(7)?, row.get(8)?))
    };
    let raw = match filter {
        Some(value) => stmt.query_map([value], map_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt.query_map([], map_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
    };

    let mut out = Vec::with_capacity(raw.len());
    for (msg, vector_json, chunk_index) in raw {
        let vector: Vec<f32> = serde_json::from_str(&vector_json).unwrap_or_default();
        out.push((msg, vector, chunk_index as usize));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        super::super::schema::run_migrations(&conn).expect("migrate");
        conn
    }

    fn add(conn: &Connection, id: &str, thread: &str, created_at: i64) {
        get_or_create_thread_sync(conn, thread, Some("p1")).expect("thread");
        insert_message_sync(
            conn,
            id,
            thread,
            "user",
            &format!("message {id}"),
            Some("p1"),
            created_at,
            &serde_json::Value::Null,
        )
        .expect("insert");
    }

    #[test]
    fn pagination_orders_by_time_then_id() {
        let conn = test_conn();
        add(&conn, "b", "p1:t", 5);
        add(&conn, "a", "p1:t", 5);
        add(&conn, "c", "p1:t", 3);

        let page = get_messages_paginated_sync(&conn, "p1:t", 0, 10).expect("page");
        let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn messages_around_excludes_anchor_and_respects_window() {
        let conn = test_conn();
        for (i, id) in ["m0", "m1", "m2", "m3", "m4"].iter().enumerate() {
            add(&conn, id, "p1:t", i as i64);
        }
        let anchor = get_message_sync(&conn, "m2").expect("get").expect("exists");
        let around = get_messages_around_sync(&conn, &anchor, 1, 2).expect("around");
        let ids: Vec<&str> = around.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3", "m4"]);
    }

    #[test]
    fn replace_embeddings_is_atomic_delete_then_insert() {
        let conn = test_conn();
        add(&conn, "m1", "p1:t", 1);
        replace_message_embeddings_sync(&conn, "m1", &[vec![1.0, 0.0], vec![0.0, 1.0]])
            .expect("replace");
        assert_eq!(get_embedding_dims_sync(&conn, "m1").expect("dims"), vec![2, 2]);

        replace_message_embeddings_sync(&conn, "m1", &[vec![0.5, 0.5, 0.5]]).expect("replace again");
        assert_eq!(get_embedding_dims_sync(&conn, "m1").expect("dims"), vec![3]);
    }

    #[test]
    fn thread_delete_cascades_messages_and_embeddings() {
        let conn = test_conn();
        add(&conn, "m1", "p1:t", 1);
        replace_message_embeddings_sync(&conn, "m1", &[vec![1.0]]).expect("embed");

        assert!(delete_thread_sync(&conn, "p1:t").expect("delete"));
        assert_eq!(count_messages_sync(&conn).expect("count"), 0);
        assert_eq!(count_embedded_messages_sync(&conn).expect("count"), 0);
        assert!(!thread_exists_sync(&conn, "p1:t").expect("exists"));
    }

    #[test]
    fn tags_read_from_metadata() {
        let msg = Message {
            id: "m".into(),
            thread_id: "t".into(),
            role: "model".into(),
            content: "c".into(),
            resource_id: None,
            created_at: 0,
            metadata: serde_json::json!({"tags": ["conversation", "summary"]}),
        };
        assert_eq!(msg.tags(), vec!["conversation", "summary"]);
        assert_eq!(msg.display_role(), "assistant");
    }
}
