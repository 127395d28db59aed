// src/db/chronicle.rs
// Chronicle (arasuji) entry storage - sync SQL layer

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One chronicle entry: level 1 summarizes raw messages, higher levels
/// consolidate entries one level below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChronicleEntry {
    pub id: String,
    pub level: i64,
    pub content: String,
    /// Message ids at level 1, child entry ids at level 2+.
    pub source_ids: Vec<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub source_count: i64,
    /// Total raw messages covered, aggregated up the tree.
    pub message_count: i64,
    pub parent_id: Option<String>,
    pub is_consolidated: bool,
    pub created_at: i64,
}

/// Advisory generation bookmark; the authoritative processed set is always
/// derived from level-1 source_ids.
#[derive(Debug, Clone, Serialize)]
pub struct ChronicleProgress {
    pub id: String,
    pub last_processed_message_id: Option<String>,
    pub last_processed_at: Option<i64>,
}

const ENTRY_COLUMNS: &str = "id, level, content, source_ids_json, start_time, end_time, \
     source_count, message_count, parent_id, is_consolidated, created_at";

fn row_to_entry(row: &Row) -> rusqlite::Result<ChronicleEntry> {
    let source_ids_json: String = row.get(3)?;
    let source_ids = serde_json::from_str(&source_ids_json).unwrap_or_default();
    Ok(ChronicleEntry {
        id: row.get(0)?,
        level: row.get(1)?,
        content: row.get(2)?,
        source_ids,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        source_count: row.get(6)?,
        message_count: row.get(7)?,
        parent_id: row.get(8)?,
        is_consolidated: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
    })
}

pub fn create_entry_sync(
    conn: &Connection,
    level: i64,
    content: &str,
    source_ids: &[String],
    start_time: Option<i64>,
    end_time: Option<i64>,
    source_count: i64,
    message_count: i64,
) -> Result<ChronicleEntry> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO arasuji_entries (
            id, level, content, source_ids_json, start_time, end_time,
            source_count, message_count, parent_id, is_consolidated, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, ?)",
        params![
            id,
            level,
            content,
            serde_json::to_string(source_ids)?,
            start_time,
            end_time,
            source_count,
            message_count,
            now
        ],
    )?;
    Ok(ChronicleEntry {
        id,
        level,
        content: content.to_string(),
        source_ids: source_ids.to_vec(),
        start_time,
        end_time,
        source_count,
        message_count,
        parent_id: None,
        is_consolidated: false,
        created_at: now,
    })
}

pub fn get_entry_sync(conn: &Connection, entry_id: &str) -> Result<Option<ChronicleEntry>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM arasuji_entries WHERE id = ?"),
            [entry_id],
            row_to_entry,
        )
        .optional()?)
}

pub fn get_entries_by_level_sync(conn: &Connection, level: i64) -> Result<Vec<ChronicleEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM arasuji_entries WHERE level = ? ORDER BY end_time ASC"
    ))?;
    let rows = stmt
        .query_map([level], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Unconsolidated entries at a level, chronologically ascending by end_time.
pub fn get_unconsolidated_entries_sync(conn: &Connection, level: i64) -> Result<Vec<ChronicleEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM arasuji_entries
         WHERE level = ? AND is_consolidated = 0 ORDER BY end_time ASC"
    ))?;
    let rows = stmt
        .query_map([level], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All entries across levels ordered by end_time descending (newest first).
pub fn get_all_entries_ordered_sync(
    conn: &Connection,
    limit: Option<usize>,
) -> Result<Vec<ChronicleEntry>> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT {ENTRY_COLUMNS} FROM arasuji_entries ORDER BY end_time DESC LIMIT {n}"
        ),
        None => format!("SELECT {ENTRY_COLUMNS} FROM arasuji_entries ORDER BY end_time DESC"),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_max_level_sync(conn: &Connection) -> Result<i64> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(level) FROM arasuji_entries", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0))
}

pub fn get_children_sync(conn: &Connection, parent_id: &str) -> Result<Vec<ChronicleEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM arasuji_entries WHERE parent_id = ? ORDER BY end_time ASC"
    ))?;
    let rows = stmt
        .query_map([parent_id], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Entries at a level ending strictly before `end_time`, newest first.
pub fn get_entries_ending_before_sync(
    conn: &Connection,
    end_time: i64,
    level: i64,
    limit: usize,
) -> Result<Vec<ChronicleEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM arasuji_entries
         WHERE level = ? AND end_time < ? ORDER BY end_time DESC LIMIT ?"
    ))?;
    let rows = stmt
        .query_map(params![level, end_time, limit as i64], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Find an entry at `level` whose [start_time, end_time] fully contains
/// [start, end]. Newest such entry wins.
pub fn find_covering_entry_sync(
    conn: &Connection,
    start: i64,
    end: i64,
    level: i64,
) -> Result<Option<ChronicleEntry>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM arasuji_entries
                 WHERE level = ? AND start_time IS NOT NULL AND end_time IS NOT NULL
                   AND start_time <= ? AND end_time >= ?
                 ORDER BY end_time DESC LIMIT 1"
            ),
            params![level, start, end],
            row_to_entry,
        )
        .optional()?)
}

/// Case-insensitive substring search over entry content, newest first.
pub fn search_entries_sync(conn: &Connection, needle: &str, limit: usize) -> Result<Vec<ChronicleEntry>> {
    let pattern = format!("%{needle}%");
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM arasuji_entries
         WHERE content LIKE ? ORDER BY end_time DESC LIMIT ?"
    ))?;
    let rows = stmt
        .query_map(params![pattern, limit as i64], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Mark entries as consolidated under a new parent (single statement).
pub fn mark_consolidated_sync(conn: &Connection, entry_ids: &[String], parent_id: &str) -> Result<()> {
    if entry_ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; entry_ids.len()].join(",");
    let mut params: Vec<&dyn rusqlite::ToSql> = vec![&parent_id];
    for id in entry_ids {
        params.push(id);
    }
    conn.execute(
        &format!(
            "UPDATE arasuji_entries SET is_consolidated = 1, parent_id = ? WHERE id IN ({placeholders})"
        ),
        params.as_slice(),
    )?;
    Ok(())
}

/// Append an entry to a parent's source_ids and mark it consolidated.
pub fn add_to_parent_source_ids_sync(
    conn: &Connection,
    entry_id: &str,
    parent_id: &str,
) -> Result<bool> {
    let Some(parent) = get_entry_sync(conn, parent_id)? else {
        return Ok(false);
    };
    let mut source_ids = parent.source_ids;
    source_ids.push(entry_id.to_string());

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE arasuji_entries SET source_ids_json = ? WHERE id = ?",
        params![serde_json::to_string(&source_ids)?, parent_id],
    )?;
    tx.execute(
        "UPDATE arasuji_entries SET is_consolidated = 1, parent_id = ? WHERE id = ?",
        params![parent_id, entry_id],
    )?;
    tx.commit()?;
    Ok(true)
}

/// In-place content/aggregate update preserving id, parent and links.
pub fn update_entry_content_sync(
    conn: &Connection,
    entry_id: &str,
    content: &str,
    start_time: Option<i64>,
    end_time: Option<i64>,
    message_count: i64,
    source_count: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE arasuji_entries
         SET content = ?, start_time = ?, end_time = ?, message_count = ?, source_count = ?
         WHERE id = ?",
        params![content, start_time, end_time, message_count, source_count, entry_id],
    )?;
    Ok(())
}

/// Delete an entry and remove it from its parent's source_ids.
/// Returns (deleted, parent_id).
pub fn delete_entry_and_update_parent_sync(
    conn: &Connection,
    entry_id: &str,
) -> Result<(bool, Option<String>)> {
    let Some(entry) = get_entry_sync(conn, entry_id)? else {
        return Ok((false, None));
    };

    let tx = conn.unchecked_transaction()?;
    if let Some(parent_id) = &entry.parent_id
        && let Some(parent) = get_entry_sync(conn, parent_id)?
    {
        let remaining: Vec<String> = parent
            .source_ids
            .into_iter()
            .filter(|sid| sid != entry_id)
            .collect();
        tx.execute(
            "UPDATE arasuji_entries SET source_ids_json = ? WHERE id = ?",
            params![serde_json::to_string(&remaining)?, parent_id],
        )?;
    }
    tx.execute("DELETE FROM arasuji_entries WHERE id = ?", [entry_id])?;
    tx.commit()?;
    Ok((true, entry.parent_id))
}

/// Union of message ids appearing in level-1 source_ids (the processed set).
pub fn get_processed_message_ids_sync(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT json_each.value
         FROM arasuji_entries, json_each(source_ids_json)
         WHERE level = 1",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
}

pub fn count_entries_by_level_sync(conn: &Connection) -> Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT level, COUNT(*) FROM arasuji_entries GROUP BY level ORDER BY level",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_unconsolidated_by_level_sync(conn: &Connection) -> Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT level, COUNT(*) FROM arasuji_entries
         WHERE is_consolidated = 0 GROUP BY level ORDER BY level",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Total raw messages covered by all level-1 entries.
pub fn get_total_message_count_sync(conn: &Connection) -> Result<i64> {
    let total: Option<i64> = conn.query_row(
        "SELECT SUM(message_count) FROM arasuji_entries WHERE level = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(total.unwrap_or(0))
}

// ----- Progress bookmark -----

pub fn get_progress_sync(conn: &Connection) -> Result<Option<ChronicleProgress>> {
    Ok(conn
        .query_row(
            "SELECT id, last_processed_message_id, last_processed_at FROM arasuji_progress WHERE id = 'main'",
            [],
            |row| {
                Ok(ChronicleProgress {
                    id: row.get(0)?,
                    last_processed_message_id: row.get(1)?,
                    last_processed_at: row.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn update_progress_sync(conn: &Connection, last_processed_message_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO arasuji_progress (id, last_processed_message_id, last_processed_at)
         VALUES ('main', ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             last_processed_message_id = excluded.last_processed_message_id,
             last_processed_at = excluded.last_processed_at",
        params![last_processed_message_id, chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}
