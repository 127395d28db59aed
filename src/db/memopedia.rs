// src/db/memopedia.rs
// Memopedia pages, per-thread page states, and edit history - sync SQL layer
//
// Soft-deleted pages are excluded from every query here except the edit
// history reads.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

pub const CATEGORY_PEOPLE: &str = "people";
pub const CATEGORY_TERMS: &str = "terms";
pub const CATEGORY_PLANS: &str = "plans";

pub const ROOT_PEOPLE: &str = "root_people";
pub const ROOT_TERMS: &str = "root_terms";
pub const ROOT_PLANS: &str = "root_plans";

/// Categories in canonical display order.
pub const CATEGORIES: [&str; 3] = [CATEGORY_PEOPLE, CATEGORY_TERMS, CATEGORY_PLANS];

/// How detailed a page's content is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Vividness {
    Vivid,
    #[default]
    Rough,
    Faint,
    Buried,
}

impl Vividness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vivid => "vivid",
            Self::Rough => "rough",
            Self::Faint => "faint",
            Self::Buried => "buried",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vivid" => Some(Self::Vivid),
            "rough" => Some(Self::Rough),
            "faint" => Some(Self::Faint),
            "buried" => Some(Self::Buried),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub category: String,
    pub keywords: Vec<String>,
    pub vividness: Vividness,
    pub is_trunk: bool,
    pub is_important: bool,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Page {
    pub fn is_root(&self) -> bool {
        self.id.starts_with("root_")
    }

    /// Composite string the edit-history diffs are computed over.
    pub fn composite(&self) -> String {
        composite(&self.title, &self.summary, &self.content)
    }
}

/// `"title: T\nsummary: S\ncontent:\nC"` - the diffable representation.
pub fn composite(title: &str, summary: &str, content: &str) -> String {
    format!("title: {title}\nsummary: {summary}\ncontent:\n{content}")
}

#[derive(Debug, Clone, Serialize)]
pub struct PageState {
    pub thread_id: String,
    pub page_id: String,
    pub is_open: bool,
    pub opened_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditType {
    Create,
    Update,
    Append,
    Delete,
}

impl EditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Append => "append",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "append" => Some(Self::Append),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageEdit {
    pub id: String,
    pub page_id: String,
    pub edited_at: i64,
    pub diff_text: String,
    pub ref_start_message_id: Option<String>,
    pub ref_end_message_id: Option<String>,
    pub edit_type: EditType,
    pub edit_source: Option<String>,
}

const PAGE_COLUMNS: &str = "id, parent_id, title, summary, content, category, keywords, \
     vividness, is_trunk, is_important, is_deleted, created_at, updated_at";

fn row_to_page(row: &Row) -> rusqlite::Result<Page> {
    let keywords_json: Option<String> = row.get(6)?;
    let keywords = keywords_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let vividness_raw: Option<String> = row.get(7)?;
    Ok(Page {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        summary: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        content: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        category: row.get(5)?,
        keywords,
        vividness: vividness_raw
            .as_deref()
            .and_then(Vividness::parse)
            .unwrap_or_default(),
        is_trunk: row.get::<_, Option<i64>>(8)?.unwrap_or(0) != 0,
        is_important: row.get::<_, Option<i64>>(9)?.unwrap_or(0) != 0,
        is_deleted: row.get::<_, Option<i64>>(10)?.unwrap_or(0) != 0,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// Seed the three category roots if missing. Called from migrations.
pub fn seed_root_pages_sync(conn: &Connection) -> Result<()> {
    let roots: [(&str, &str, &str, &str); 3] = [
        (ROOT_PEOPLE, "人物", CATEGORY_PEOPLE, "関わりのある人物についての記録"),
        (ROOT_TERMS, "用語", CATEGORY_TERMS, "用語・概念についての記録"),
        (ROOT_PLANS, "予定", CATEGORY_PLANS, "進行中や計画中のプロジェクト・予定"),
    ];
    let now = chrono::Utc::now().timestamp();
    for (id, title, category, summary) in roots {
        conn.execute(
            "INSERT INTO memopedia_pages (id, parent_id, title, summary, content, category, created_at, updated_at)
             VALUES (?, NULL, ?, ?, '', ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
            params![id, title, summary, category, now, now],
        )?;
    }
    Ok(())
}

// ----- Page CRUD -----

pub fn create_page_sync(
    conn: &Connection,
    page_id: Option<&str>,
    parent_id: Option<&str>,
    title: &str,
    summary: &str,
    content: &str,
    category: &str,
    keywords: &[String],
    vividness: Vividness,
    is_trunk: bool,
) -> Result<Page> {
    let id = page_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO memopedia_pages (
            id, parent_id, title, summary, content, category, keywords,
            vividness, is_trunk, is_important, is_deleted, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)",
        params![
            id,
            parent_id,
            title,
            summary,
            content,
            category,
            serde_json::to_string(keywords)?,
            vividness.as_str(),
            is_trunk as i64,
            now,
            now
        ],
    )?;
    Ok(Page {
        id,
        parent_id: parent_id.map(str::to_string),
        title: title.to_string(),
        summary: summary.to_string(),
        content: content.to_string(),
        category: category.to_string(),
        keywords: keywords.to_vec(),
        vividness,
        is_trunk,
        is_important: false,
        is_deleted: false,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_page_sync(conn: &Connection, page_id: &str) -> Result<Option<Page>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PAGE_COLUMNS} FROM memopedia_pages WHERE id = ? AND is_deleted = 0"),
            [page_id],
            row_to_page,
        )
        .optional()?)
}

/// Lookup that also returns soft-deleted pages (history endpoint only).
pub fn get_page_including_deleted_sync(conn: &Connection, page_id: &str) -> Result<Option<Page>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PAGE_COLUMNS} FROM memopedia_pages WHERE id = ?"),
            [page_id],
            row_to_page,
        )
        .optional()?)
}

pub fn update_page_row_sync(conn: &Connection, page: &Page) -> Result<()> {
    conn.execute(
        "UPDATE memopedia_pages
         SET parent_id = ?, title = ?, summary = ?, content = ?, keywords = ?,
             vividness = ?, is_trunk = ?, is_important = ?, updated_at = ?
         WHERE id = ?",
        params![
            page.parent_id,
            page.title,
            page.summary,
            page.content,
            serde_json::to_string(&page.keywords)?,
            page.vividness.as_str(),
            page.is_trunk as i64,
            page.is_important as i64,
            chrono::Utc::now().timestamp(),
            page.id
        ],
    )?;
    Ok(())
}

pub fn soft_delete_page_sync(conn: &Connection, page_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE memopedia_pages SET is_deleted = 1, updated_at = ? WHERE id = ?",
        params![chrono::Utc::now().timestamp(), page_id],
    )?;
    Ok(())
}

pub fn get_all_pages_sync(conn: &Connection) -> Result<Vec<Page>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAGE_COLUMNS} FROM memopedia_pages WHERE is_deleted = 0 ORDER BY category, title"
    ))?;
    let rows = stmt
        .query_map([], row_to_page)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_children_sync(conn: &Connection, parent_id: &str) -> Result<Vec<Page>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAGE_COLUMNS} FROM memopedia_pages
         WHERE parent_id = ? AND is_deleted = 0 ORDER BY title"
    ))?;
    let rows = stmt
        .query_map([parent_id], row_to_page)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn find_page_by_title_sync(
    conn: &Connection,
    title: &str,
    category: Option<&str>,
) -> Result<Option<Page>> {
    let result = match category {
        Some(cat) => conn
            .query_row(
                &format!(
                    "SELECT {PAGE_COLUMNS} FROM memopedia_pages
                     WHERE title = ? AND category = ? AND is_deleted = 0"
                ),
                params![title, cat],
                row_to_page,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "SELECT {PAGE_COLUMNS} FROM memopedia_pages WHERE title = ? AND is_deleted = 0"
                ),
                [title],
                row_to_page,
            )
            .optional()?,
    };
    Ok(result)
}

/// Case-insensitive substring search over title, summary, content, keywords.
pub fn search_pages_filtered_sync(
    conn: &Connection,
    query: &str,
    category: Option<&str>,
    limit: usize,
) -> Result<Vec<Page>> {
    let pattern = format!("%{}%", query.to_lowercase());
    let base = format!(
        "SELECT {PAGE_COLUMNS} FROM memopedia_pages
         WHERE is_deleted = 0
           AND (LOWER(title) LIKE ?1 OR LOWER(summary) LIKE ?1
                OR LOWER(content) LIKE ?1 OR LOWER(keywords) LIKE ?1)"
    );
    let rows = match category {
        Some(cat) => {
            let mut stmt = conn.prepare(&format!(
                "{base} AND category = ?2 ORDER BY updated_at DESC LIMIT ?3"
            ))?;
            stmt.query_map(params![pattern, cat, limit as i64], row_to_page)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt =
                conn.prepare(&format!("{base} ORDER BY updated_at DESC LIMIT ?2"))?;
            stmt.query_map(params![pattern, limit as i64], row_to_page)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    Ok(rows)
}

/// Whether `candidate` lies in the subtree rooted at `ancestor` (inclusive).
/// Bounded walk so a corrupted parent chain cannot loop forever.
pub fn is_in_subtree_sync(conn: &Connection, ancestor: &str, candidate: &str) -> Result<bool> {
    const DEPTH_LIMIT: usize = 64;
    let mut current = Some(candidate.to_string());
    for _ in 0..DEPTH_LIMIT {
        let Some(id) = current else { return Ok(false) };
        if id == ancestor {
            return Ok(true);
        }
        current = conn
            .query_row(
                "SELECT parent_id FROM memopedia_pages WHERE id = ?",
                [id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
    }
    anyhow::bail!("page ancestry exceeds depth limit (cycle?)")
}

// ----- Page states -----

pub fn set_page_open_sync(
    conn: &Connection,
    thread_id: &str,
    page_id: &str,
    is_open: bool,
) -> Result<PageState> {
    let opened_at = is_open.then(|| chrono::Utc::now().timestamp());
    conn.execute(
        "INSERT INTO memopedia_page_states (thread_id, page_id, is_open, opened_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(thread_id, page_id) DO UPDATE SET is_open = ?3, opened_at = ?4",
        params![thread_id, page_id, is_open as i64, opened_at],
    )?;
    Ok(PageState {
        thread_id: thread_id.to_string(),
        page_id: page_id.to_string(),
        is_open,
        opened_at,
    })
}

pub fn get_open_states_for_thread_sync(
    conn: &Connection,
    thread_id: &str,
) -> Result<Vec<(String, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT page_id, is_open FROM memopedia_page_states WHERE thread_id = ?",
    )?;
    let rows = stmt.query_map([thread_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_open_pages_sync(conn: &Connection, thread_id: &str) -> Result<Vec<Page>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}
         FROM memopedia_pages p
         JOIN memopedia_page_states s ON p.id = s.page_id
         WHERE s.thread_id = ? AND s.is_open = 1 AND p.is_deleted = 0
         ORDER BY s.opened_at ASC",
        PAGE_COLUMNS
            .split(", ")
            .map(|c| format!("p.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    ))?;
    let rows = stmt
        .query_map([thread_id], row_to_page)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ----- Edit history (append-only) -----

pub fn record_page_edit_sync(
    conn: &Connection,
    page_id: &str,
    diff_text: &str,
    edit_type: EditType,
    ref_start_message_id: Option<&str>,
    ref_end_message_id: Option<&str>,
    edit_source: Option<&str>,
) -> Result<PageEdit> {
    let id = uuid::Uuid::new_v4().to_string();
    let edited_at = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO memopedia_edit_history (
            id, page_id, edited_at, diff_text,
            ref_start_message_id, ref_end_message_id, edit_type, edit_source
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            page_id,
            edited_at,
            diff_text,
            ref_start_message_id,
            ref_end_message_id,
            edit_type.as_str(),
            edit_source
        ],
    )?;
    Ok(PageEdit {
        id,
        page_id: page_id.to_string(),
        edited_at,
        diff_text: diff_text.to_string(),
        ref_start_message_id: ref_start_message_id.map(str::to_string),
        ref_end_message_id: ref_end_message_id.map(str::to_string),
        edit_type,
        edit_source: edit_source.map(str::to_string),
    })
}

/// Edit history for a page, newest first. Insertion order breaks same-second
/// ties via rowid.
pub fn get_page_edit_history_sync(
    conn: &Connection,
    page_id: &str,
    limit: usize,
) -> Result<Vec<PageEdit>> {
    let mut stmt = conn.prepare(
        "SELECT id, page_id, edited_at, diff_text, ref_start_message_id,
                ref_end_message_id, edit_type, edit_source
         FROM memopedia_edit_history
         WHERE page_id = ?
         ORDER BY edited_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt.query_map(params![page_id, limit as i64], |row| {
        let edit_type_raw: String = row.get(6)?;
        Ok(PageEdit {
            id: row.get(0)?,
            page_id: row.get(1)?,
            edited_at: row.get(2)?,
            diff_text: row.get(3)?,
            ref_start_message_id: row.get(4)?,
            ref_end_message_id: row.get(5)?,
            edit_type: EditType::parse(&edit_type_raw).unwrap_or(EditType::Update),
            edit_source: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ----- Update log bookmark -----

pub fn record_update_log_sync(
    conn: &Connection,
    last_message_id: Option<&str>,
    last_message_created_at: Option<i64>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO memopedia_update_log (id, last_message_id, last_message_created_at, processed_at)
         VALUES (?, ?, ?, ?)",
        params![id, last_message_id, last_message_created_at, chrono::Utc::now().timestamp()],
    )?;
    Ok(id)
}

pub fn get_last_update_log_sync(
    conn: &Connection,
) -> Result<Option<(String, Option<String>, Option<i64>, i64)>> {
    Ok(conn
        .query_row(
            "SELECT id, last_message_id, last_message_created_at, processed_at
             FROM memopedia_update_log ORDER BY processed_at DESC, rowid DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        super::super::schema::run_migrations(&conn).expect("migrate");
        conn
    }

    #[test]
    fn soft_deleted_pages_vanish_from_queries_but_not_history() {
        let conn = test_conn();
        let page = create_page_sync(
            &conn,
            None,
            Some(ROOT_PEOPLE),
            "Alice",
            "friend",
            "met at cafe",
            CATEGORY_PEOPLE,
            &[],
            Vividness::Rough,
            false,
        )
        .expect("create");
        record_page_edit_sync(&conn, &page.id, "diff", EditType::Create, None, None, None)
            .expect("edit");

        soft_delete_page_sync(&conn, &page.id).expect("delete");

        assert!(get_page_sync(&conn, &page.id).expect("q").is_none());
        assert!(get_children_sync(&conn, ROOT_PEOPLE).expect("children").is_empty());
        assert!(find_page_by_title_sync(&conn, "Alice", None).expect("q").is_none());
        assert!(get_page_including_deleted_sync(&conn, &page.id).expect("q").is_some());
        assert_eq!(get_page_edit_history_sync(&conn, &page.id, 10).expect("hist").len(), 1);
    }

    #[test]
    fn search_matches_keywords_case_insensitively() {
        let conn = test_conn();
        create_page_sync(
            &conn,
            None,
            Some(ROOT_TERMS),
            "Sourdough",
            "",
            "",
            CATEGORY_TERMS,
            &["Bread".into(), "fermentation".into()],
            Vividness::Rough,
            false,
        )
        .expect("create");

        let hits = search_pages_filtered_sync(&conn, "BREAD", None, 10).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Sourdough");

        let misses =
            search_pages_filtered_sync(&conn, "BREAD", Some(CATEGORY_PEOPLE), 10).expect("search");
        assert!(misses.is_empty());
    }

    #[test]
    fn subtree_check_walks_parent_chain() {
        let conn = test_conn();
        let trunk = create_page_sync(
            &conn, None, Some(ROOT_PEOPLE), "Family", "", "", CATEGORY_PEOPLE, &[],
            Vividness::Rough, true,
        )
        .expect("trunk");
        let leaf = create_page_sync(
            &conn, None, Some(&trunk.id), "Bob", "", "", CATEGORY_PEOPLE, &[],
            Vividness::Rough, false,
        )
        .expect("leaf");

        assert!(is_in_subtree_sync(&conn, &trunk.id, &leaf.id).expect("q"));
        assert!(is_in_subtree_sync(&conn, ROOT_PEOPLE, &leaf.id).expect("q"));
        assert!(!is_in_subtree_sync(&conn, &leaf.id, &trunk.id).expect("q"));
    }

    #[test]
    fn open_pages_ordered_by_opened_at() {
        let conn = test_conn();
        let a = create_page_sync(
            &conn, None, Some(ROOT_TERMS), "A", "", "", CATEGORY_TERMS, &[],
            Vividness::Rough, false,
        )
        .expect("a");
        set_page_open_sync(&conn, "p1:t", &a.id, true).expect("open");
        set_page_open_sync(&conn, "p1:t", &a.id, false).expect("close");

        assert!(get_open_pages_sync(&conn, "p1:t").expect("open").is_empty());
        let states = get_open_states_for_thread_sync(&conn, "p1:t").expect("states");
        assert_eq!(states, vec![(a.id.clone(), false)]);
    }
}
