// src/db/schema.rs
// Database schema and migrations, keyed by PRAGMA user_version

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 3;

/// Base tables, created at version 1.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    resource_id TEXT,
    overview TEXT,
    overview_updated_at INTEGER
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    resource_id TEXT,
    created_at INTEGER NOT NULL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_thread_created ON messages(thread_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_resource_created ON messages(resource_id, created_at);

CREATE TABLE IF NOT EXISTS message_embeddings (
    message_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    vector TEXT NOT NULL,
    PRIMARY KEY (message_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS arasuji_entries (
    id TEXT PRIMARY KEY,
    level INTEGER NOT NULL,
    content TEXT NOT NULL,
    source_ids_json TEXT NOT NULL,
    start_time INTEGER,
    end_time INTEGER,
    source_count INTEGER NOT NULL,
    message_count INTEGER NOT NULL,
    parent_id TEXT,
    is_consolidated INTEGER DEFAULT 0,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (parent_id) REFERENCES arasuji_entries(id)
);
CREATE INDEX IF NOT EXISTS idx_arasuji_level ON arasuji_entries(level);
CREATE INDEX IF NOT EXISTS idx_arasuji_end_time ON arasuji_entries(end_time DESC);
CREATE INDEX IF NOT EXISTS idx_arasuji_consolidated ON arasuji_entries(is_consolidated);
CREATE INDEX IF NOT EXISTS idx_arasuji_parent ON arasuji_entries(parent_id);

CREATE TABLE IF NOT EXISTS arasuji_progress (
    id TEXT PRIMARY KEY DEFAULT 'main',
    last_processed_message_id TEXT,
    last_processed_at INTEGER
);

CREATE TABLE IF NOT EXISTS memopedia_pages (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    title TEXT NOT NULL,
    summary TEXT DEFAULT '',
    content TEXT DEFAULT '',
    category TEXT NOT NULL,
    keywords TEXT DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (parent_id) REFERENCES memopedia_pages(id)
);
CREATE INDEX IF NOT EXISTS idx_memopedia_pages_parent ON memopedia_pages(parent_id);
CREATE INDEX IF NOT EXISTS idx_memopedia_pages_category ON memopedia_pages(category);

CREATE TABLE IF NOT EXISTS memopedia_page_states (
    thread_id TEXT NOT NULL,
    page_id TEXT NOT NULL,
    is_open INTEGER DEFAULT 0,
    opened_at INTEGER,
    PRIMARY KEY (thread_id, page_id),
    FOREIGN KEY (page_id) REFERENCES memopedia_pages(id)
);

CREATE TABLE IF NOT EXISTS memopedia_update_log (
    id TEXT PRIMARY KEY,
    last_message_id TEXT,
    last_message_created_at INTEGER,
    processed_at INTEGER NOT NULL
);
"#;

/// Version 2: vividness / trunk / importance / soft-delete flags and the
/// append-only edit history.
const SCHEMA_V2: &str = r#"
ALTER TABLE memopedia_pages ADD COLUMN vividness TEXT DEFAULT 'rough';
ALTER TABLE memopedia_pages ADD COLUMN is_trunk INTEGER DEFAULT 0;
ALTER TABLE memopedia_pages ADD COLUMN is_important INTEGER DEFAULT 0;
ALTER TABLE memopedia_pages ADD COLUMN is_deleted INTEGER DEFAULT 0;
CREATE INDEX IF NOT EXISTS idx_memopedia_pages_deleted ON memopedia_pages(is_deleted);

CREATE TABLE IF NOT EXISTS memopedia_edit_history (
    id TEXT PRIMARY KEY,
    page_id TEXT NOT NULL,
    edited_at INTEGER NOT NULL,
    diff_text TEXT NOT NULL,
    ref_start_message_id TEXT,
    ref_end_message_id TEXT,
    edit_type TEXT NOT NULL,
    edit_source TEXT,
    FOREIGN KEY (page_id) REFERENCES memopedia_pages(id)
);
CREATE INDEX IF NOT EXISTS idx_memopedia_edits_page ON memopedia_edit_history(page_id, edited_at);
"#;

/// Run all pending migrations. Idempotent: each step applies once, keyed by
/// `PRAGMA user_version`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
        tracing::info!("schema migrated to version 1");
    }

    if version < 2 {
        conn.execute_batch(SCHEMA_V2)?;
        conn.pragma_update(None, "user_version", 2)?;
        tracing::info!("schema migrated to version 2");
    }

    if version < 3 {
        migrate_events_category(conn)?;
        conn.pragma_update(None, "user_version", 3)?;
        tracing::info!("schema migrated to version 3");
    }

    super::memopedia::seed_root_pages_sync(conn)?;

    Ok(())
}

/// Version 3: fold the legacy `events` category into `terms`.
///
/// Older databases carried a `root_events` root; its subtree becomes part of
/// the terms forest. The terms root must exist before reparenting so the
/// parent_id foreign key stays satisfied, and the old root is deleted only
/// after its children have moved.
fn migrate_events_category(conn: &Connection) -> Result<()> {
    let has_events_root: bool = conn
        .query_row(
            "SELECT 1 FROM memopedia_pages WHERE id = 'root_events'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if has_events_root {
        super::memopedia::seed_root_pages_sync(conn)?;
        conn.execute(
            "UPDATE memopedia_pages SET parent_id = 'root_terms' WHERE parent_id = 'root_events'",
            [],
        )?;
        conn.execute(
            "DELETE FROM memopedia_page_states WHERE page_id = 'root_events'",
            [],
        )?;
        conn.execute("DELETE FROM memopedia_pages WHERE id = 'root_events'", [])?;
    }

    conn.execute(
        "UPDATE memopedia_pages SET category = 'terms' WHERE category = 'events'",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA foreign_keys=ON;").expect("pragma");
        conn
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = open_memory_conn();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn roots_are_seeded_once() {
        let conn = open_memory_conn();
        run_migrations(&conn).expect("migrate");
        run_migrations(&conn).expect("migrate again");

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memopedia_pages WHERE parent_id IS NULL",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 3);
    }

    #[test]
    fn legacy_events_rows_become_terms() {
        let conn = open_memory_conn();

        // Simulate a version-2 database carrying the legacy category.
        conn.execute_batch(SCHEMA_V1).expect("v1");
        conn.execute_batch(SCHEMA_V2).expect("v2");
        conn.pragma_update(None, "user_version", 2).expect("version");
        conn.execute(
            "INSERT INTO memopedia_pages (id, parent_id, title, category, created_at, updated_at)
             VALUES ('root_events', NULL, '出来事', 'events', 0, 0)",
            [],
        )
        .expect("root");
        conn.execute(
            "INSERT INTO memopedia_pages (id, parent_id, title, category, created_at, updated_at)
             VALUES ('pg1', 'root_events', 'Festival', 'events', 0, 0)",
            [],
        )
        .expect("child");

        run_migrations(&conn).expect("migrate");

        let (parent, category): (String, String) = conn
            .query_row(
                "SELECT parent_id, category FROM memopedia_pages WHERE id = 'pg1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("child row");
        assert_eq!(parent, "root_terms");
        assert_eq!(category, "terms");

        let events_left: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memopedia_pages WHERE category = 'events' OR id = 'root_events'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(events_left, 0);
    }
}
