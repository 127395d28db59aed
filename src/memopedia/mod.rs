// src/memopedia/mod.rs
// Memopedia: a category-rooted forest of knowledge pages with diff-based
// edit history
//
// Three roots (people / terms / plans) are seeded at migration time. Roots
// cannot be edited, deleted, or moved; every other page inherits its
// category from its parent. Deletion is soft and the edit trail survives it.

pub mod diff;
pub mod generator;

pub use generator::{MemopediaGenerator, PageGenerationReport};

use crate::db::memopedia::{self, CATEGORIES, EditType, Page, PageEdit, Vividness};
use crate::db::pool::DatabasePool;
use crate::error::{Result, WeaveError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Optional provenance attached to an edit record.
#[derive(Debug, Clone, Default)]
pub struct EditRefs {
    pub start_message_id: Option<String>,
    pub end_message_id: Option<String>,
    pub source: Option<String>,
}

/// Fields accepted by `update_page`; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct PageUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub vividness: Option<Vividness>,
}

/// One node of the rendered tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub vividness: Vividness,
    pub is_trunk: bool,
    pub is_important: bool,
    pub is_open: bool,
    pub content: String,
    pub children: Vec<TreeNode>,
}

/// The category forest.
#[derive(Debug, Clone, Serialize)]
pub struct Tree {
    pub people: Vec<TreeNode>,
    pub terms: Vec<TreeNode>,
    pub plans: Vec<TreeNode>,
}

pub struct Memopedia {
    pool: Arc<DatabasePool>,
}

fn category_name(category: &str) -> &str {
    match category {
        "people" => "人物",
        "terms" => "用語",
        "plans" => "予定",
        other => other,
    }
}

pub(crate) fn root_for_category(category: &str) -> Option<&'static str> {
    match category {
        "people" => Some(memopedia::ROOT_PEOPLE),
        "terms" => Some(memopedia::ROOT_TERMS),
        "plans" => Some(memopedia::ROOT_PLANS),
        _ => None,
    }
}

fn build_nodes(
    pages: &[Page],
    states: &HashMap<String, bool>,
) -> HashMap<String, Vec<TreeNode>> {
    // Children grouped by parent, leaves attached bottom-up. Pages are
    // pre-sorted by title from the query.
    let mut children_of: HashMap<Option<String>, Vec<&Page>> = HashMap::new();
    for page in pages {
        children_of.entry(page.parent_id.clone()).or_default().push(page);
    }

    fn attach(
        page: &Page,
        children_of: &HashMap<Option<String>, Vec<&Page>>,
        states: &HashMap<String, bool>,
    ) -> TreeNode {
        let children = children_of
            .get(&Some(page.id.clone()))
            .map(|kids| kids.iter().map(|k| attach(k, children_of, states)).collect())
            .unwrap_or_default();
        TreeNode {
            id: page.id.clone(),
            title: page.title.clone(),
            summary: page.summary.clone(),
            keywords: page.keywords.clone(),
            vividness: page.vividness,
            is_trunk: page.is_trunk,
            is_important: page.is_important,
            is_open: states.get(&page.id).copied().unwrap_or(false),
            content: page.content.clone(),
            children,
        }
    }

    let mut by_category: HashMap<String, Vec<TreeNode>> = HashMap::new();
    if let Some(roots) = children_of.get(&None) {
        for root in roots {
            by_category
                .entry(root.category.clone())
                .or_default()
                .push(attach(root, &children_of, states));
        }
    }
    by_category
}

impl Memopedia {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    // ----- Tree operations -----

    /// Full category forest; with `thread_id`, nodes carry that thread's
    /// open/closed state.
    pub async fn get_tree(&self, thread_id: Option<&str>) -> Result<Tree> {
        let thread_id = thread_id.map(str::to_string);
        let (pages, states) = self
            .pool
            .interact(move |conn| {
                let pages = memopedia::get_all_pages_sync(conn)?;
                let states = match &thread_id {
                    Some(tid) => memopedia::get_open_states_for_thread_sync(conn, tid)?
                        .into_iter()
                        .collect(),
                    None => HashMap::new(),
                };
                Ok((pages, states))
            })
            .await?;

        let mut by_category = build_nodes(&pages, &states);
        Ok(Tree {
            people: by_category.remove("people").unwrap_or_default(),
            terms: by_category.remove("terms").unwrap_or_default(),
            plans: by_category.remove("plans").unwrap_or_default(),
        })
    }

    /// Tree as a Markdown outline for prompt injection.
    ///
    /// `show_markers` renders [OPEN]/[-] per page, `include_keywords` adds a
    /// keyword suffix.
    pub async fn get_tree_markdown(
        &self,
        thread_id: Option<&str>,
        include_keywords: bool,
        show_markers: bool,
    ) -> Result<String> {
        let tree = self.get_tree(thread_id).await?;
        let mut lines: Vec<String> = Vec::new();

        fn render(node: &TreeNode, depth: usize, include_keywords: bool, show_markers: bool, lines: &mut Vec<String>) {
            let indent = "  ".repeat(depth);
            let marker = if show_markers {
                if node.is_open { "[OPEN] " } else { "[-] " }
            } else {
                ""
            };
            let summary = if node.summary.is_empty() {
                String::new()
            } else {
                format!(" - {}", node.summary)
            };
            let keywords = if include_keywords && !node.keywords.is_empty() {
                format!(" ({})", node.keywords.join(", "))
            } else {
                String::new()
            };
            lines.push(format!("{indent}- {marker}**{}**{summary}{keywords}", node.title));
            for child in &node.children {
                render(child, depth + 1, include_keywords, show_markers, lines);
            }
        }

        for (category, nodes) in [("people", &tree.people), ("terms", &tree.terms), ("plans", &tree.plans)]
        {
            lines.push(format!("\n## {}\n", category_name(category)));
            for node in nodes {
                render(node, 0, include_keywords, show_markers, &mut lines);
            }
        }
        Ok(lines.join("\n"))
    }

    // ----- Page operations -----

    pub async fn get_page(&self, page_id: &str) -> Result<Option<Page>> {
        let page_id = page_id.to_string();
        self.pool
            .interact(move |conn| memopedia::get_page_sync(conn, &page_id))
            .await
            .map_err(Into::into)
    }

    /// Create a page under an existing parent; the category is inherited.
    pub async fn create_page(
        &self,
        parent_id: &str,
        title: &str,
        summary: &str,
        content: &str,
        keywords: Vec<String>,
        vividness: Vividness,
        is_trunk: bool,
        refs: EditRefs,
    ) -> Result<Page> {
        let parent_id = parent_id.to_string();
        let title = title.to_string();
        let summary = summary.to_string();
        let content = content.to_string();
        self.pool
            .interact(move |conn| {
                let parent = memopedia::get_page_sync(conn, &parent_id)?
                    .ok_or_else(|| anyhow::anyhow!("parent page not found: {parent_id}"))?;
                let page = memopedia::create_page_sync(
                    conn,
                    None,
                    Some(&parent_id),
                    &title,
                    &summary,
                    &content,
                    &parent.category,
                    &keywords,
                    vividness,
                    is_trunk,
                )?;
                let diff_text = diff::generate_diff("", &page.composite());
                memopedia::record_page_edit_sync(
                    conn,
                    &page.id,
                    &diff_text,
                    EditType::Create,
                    refs.start_message_id.as_deref(),
                    refs.end_message_id.as_deref(),
                    refs.source.as_deref(),
                )?;
                Ok(page)
            })
            .await
            .map_err(|e| {
                if e.to_string().contains("parent page not found") {
                    WeaveError::NotFound(e.to_string())
                } else {
                    e.into()
                }
            })
    }

    /// Update provided fields. An `update` edit is recorded only when the
    /// title/summary/content composite actually changed.
    pub async fn update_page(
        &self,
        page_id: &str,
        update: PageUpdate,
        refs: EditRefs,
    ) -> Result<Page> {
        if page_id.starts_with("root_") {
            return Err(WeaveError::Invalid("root pages cannot be edited".into()));
        }
        let page_id = page_id.to_string();
        let updated = self
            .pool
            .interact(move |conn| {
                let Some(mut page) = memopedia::get_page_sync(conn, &page_id)? else {
                    return Ok(None);
                };
                let before = page.composite();

                if let Some(title) = update.title {
                    page.title = title;
                }
                if let Some(summary) = update.summary {
                    page.summary = summary;
                }
                if let Some(content) = update.content {
                    page.content = content;
                }
                if let Some(keywords) = update.keywords {
                    page.keywords = keywords;
                }
                if let Some(vividness) = update.vividness {
                    page.vividness = vividness;
                }

                memopedia::update_page_row_sync(conn, &page)?;

                let after = page.composite();
                let diff_text = diff::generate_diff(&before, &after);
                if !diff_text.is_empty() {
                    memopedia::record_page_edit_sync(
                        conn,
                        &page.id,
                        &diff_text,
                        EditType::Update,
                        refs.start_message_id.as_deref(),
                        refs.end_message_id.as_deref(),
                        refs.source.as_deref(),
                    )?;
                }
                Ok(Some(page))
            })
            .await?;
        updated.ok_or_else(|| WeaveError::NotFound("page not found".into()))
    }

    /// Append text to a page's content, separated by a blank line.
    pub async fn append_to_content(&self, page_id: &str, text: &str, refs: EditRefs) -> Result<Page> {
        if page_id.starts_with("root_") {
            return Err(WeaveError::Invalid("root pages cannot be edited".into()));
        }
        let page_id = page_id.to_string();
        let text = text.to_string();
        let updated = self
            .pool
            .interact(move |conn| {
                let Some(mut page) = memopedia::get_page_sync(conn, &page_id)? else {
                    return Ok(None);
                };
                let before = page.composite();
                page.content = if page.content.is_empty() {
                    text.clone()
                } else {
                    format!("{}\n\n{text}", page.content)
                };
                memopedia::update_page_row_sync(conn, &page)?;
                let diff_text = diff::generate_diff(&before, &page.composite());
                memopedia::record_page_edit_sync(
                    conn,
                    &page.id,
                    &diff_text,
                    EditType::Append,
                    refs.start_message_id.as_deref(),
                    refs.end_message_id.as_deref(),
                    refs.source.as_deref(),
                )?;
                Ok(Some(page))
            })
            .await?;
        updated.ok_or_else(|| WeaveError::NotFound("page not found".into()))
    }

    /// Soft-delete a page, recording a `delete` edit. The page row, its
    /// history, and its descendants' rows are preserved.
    pub async fn delete_page(&self, page_id: &str, refs: EditRefs) -> Result<()> {
        if page_id.starts_with("root_") {
            return Err(WeaveError::Invalid("root pages cannot be deleted".into()));
        }
        let page_id_owned = page_id.to_string();
        let deleted = self
            .pool
            .interact(move |conn| {
                let Some(page) = memopedia::get_page_sync(conn, &page_id_owned)? else {
                    return Ok(false);
                };
                let diff_text = diff::generate_diff(&page.composite(), "");
                memopedia::record_page_edit_sync(
                    conn,
                    &page.id,
                    &diff_text,
                    EditType::Delete,
                    refs.start_message_id.as_deref(),
                    refs.end_message_id.as_deref(),
                    refs.source.as_deref(),
                )?;
                memopedia::soft_delete_page_sync(conn, &page.id)?;
                Ok(true)
            })
            .await?;
        if !deleted {
            return Err(WeaveError::NotFound(format!("page not found: {page_id}")));
        }
        Ok(())
    }

    pub async fn set_trunk(&self, page_id: &str, is_trunk: bool) -> Result<Page> {
        self.set_flag(page_id, move |page| page.is_trunk = is_trunk).await
    }

    pub async fn set_important(&self, page_id: &str, is_important: bool) -> Result<Page> {
        self.set_flag(page_id, move |page| page.is_important = is_important).await
    }

    pub async fn set_vividness(&self, page_id: &str, vividness: Vividness) -> Result<Page> {
        self.set_flag(page_id, move |page| page.vividness = vividness).await
    }

    async fn set_flag<F>(&self, page_id: &str, mutate: F) -> Result<Page>
    where
        F: FnOnce(&mut Page) + Send + 'static,
    {
        if page_id.starts_with("root_") {
            return Err(WeaveError::Invalid("root pages cannot be edited".into()));
        }
        let page_id = page_id.to_string();
        let updated = self
            .pool
            .interact(move |conn| {
                let Some(mut page) = memopedia::get_page_sync(conn, &page_id)? else {
                    return Ok(None);
                };
                mutate(&mut page);
                memopedia::update_page_row_sync(conn, &page)?;
                Ok(Some(page))
            })
            .await?;
        updated.ok_or_else(|| WeaveError::NotFound("page not found".into()))
    }

    /// Reparent pages under a trunk page, atomically.
    ///
    /// Moving under a category root is allowed only for trunk pages, cycles
    /// are refused, and the whole batch commits or none of it does.
    pub async fn move_pages_to_trunk(&self, page_ids: Vec<String>, new_parent_id: &str) -> Result<()> {
        let new_parent_id = new_parent_id.to_string();
        self.pool
            .interact(move |conn| {
                let parent = memopedia::get_page_sync(conn, &new_parent_id)?
                    .ok_or_else(|| anyhow::anyhow!("invalid: parent page not found: {new_parent_id}"))?;

                let tx = conn.unchecked_transaction()?;
                for page_id in &page_ids {
                    let Some(mut page) = memopedia::get_page_sync(conn, page_id)? else {
                        anyhow::bail!("invalid: page not found: {page_id}");
                    };
                    if page.is_root() {
                        anyhow::bail!("invalid: root pages cannot be moved");
                    }
                    if parent.is_root() && !page.is_trunk {
                        anyhow::bail!("invalid: only trunk pages may sit directly under a root");
                    }
                    if page.category != parent.category {
                        anyhow::bail!("invalid: cannot move across categories");
                    }
                    if memopedia::is_in_subtree_sync(conn, page_id, &parent.id)? {
                        anyhow::bail!("invalid: move would create a cycle");
                    }
                    page.parent_id = Some(parent.id.clone());
                    memopedia::update_page_row_sync(conn, &page)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("invalid:") {
                    WeaveError::Invalid(text)
                } else {
                    e.into()
                }
            })
    }

    pub async fn find_by_title(&self, title: &str, category: Option<&str>) -> Result<Option<Page>> {
        let title = title.to_string();
        let category = category.map(str::to_string);
        self.pool
            .interact(move |conn| memopedia::find_page_by_title_sync(conn, &title, category.as_deref()))
            .await
            .map_err(Into::into)
    }

    pub async fn search_pages_filtered(
        &self,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Page>> {
        let query = query.to_string();
        let category = category.map(str::to_string);
        self.pool
            .interact(move |conn| {
                memopedia::search_pages_filtered_sync(conn, &query, category.as_deref(), limit)
            })
            .await
            .map_err(Into::into)
    }

    /// Edit history, newest first. Works for soft-deleted pages too.
    pub async fn get_page_edit_history(&self, page_id: &str, limit: usize) -> Result<Vec<PageEdit>> {
        let page_id = page_id.to_string();
        self.pool
            .interact(move |conn| memopedia::get_page_edit_history_sync(conn, &page_id, limit))
            .await
            .map_err(Into::into)
    }

    // ----- Page states (per-thread open/close) -----

    pub async fn open_page(&self, thread_id: &str, page_id: &str) -> Result<Page> {
        let thread_id = thread_id.to_string();
        let page_id = page_id.to_string();
        let page = self
            .pool
            .interact(move |conn| {
                let Some(page) = memopedia::get_page_sync(conn, &page_id)? else {
                    return Ok(None);
                };
                memopedia::set_page_open_sync(conn, &thread_id, &page_id, true)?;
                Ok(Some(page))
            })
            .await?;
        page.ok_or_else(|| WeaveError::NotFound("page not found".into()))
    }

    pub async fn close_page(&self, thread_id: &str, page_id: &str) -> Result<()> {
        let thread_id = thread_id.to_string();
        let page_id = page_id.to_string();
        self.pool
            .interact(move |conn| {
                memopedia::set_page_open_sync(conn, &thread_id, &page_id, false)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_open_pages(&self, thread_id: &str) -> Result<Vec<Page>> {
        let thread_id = thread_id.to_string();
        self.pool
            .interact(move |conn| memopedia::get_open_pages_sync(conn, &thread_id))
            .await
            .map_err(Into::into)
    }

    /// Content of all open pages as Markdown sections, for prompt injection.
    pub async fn get_open_pages_content(&self, thread_id: &str) -> Result<String> {
        let pages = self.get_open_pages(thread_id).await?;
        if pages.is_empty() {
            return Ok(String::new());
        }
        let sections: Vec<String> = pages
            .iter()
            .map(|page| {
                let mut lines = vec![format!("## {}", page.title)];
                if !page.summary.is_empty() {
                    lines.push(format!("*{}*", page.summary));
                }
                if !page.content.is_empty() {
                    lines.push(String::new());
                    lines.push(page.content.clone());
                }
                lines.join("\n")
            })
            .collect();
        Ok(sections.join("\n\n---\n\n"))
    }

    // ----- Update-run bookmark -----

    pub async fn record_update(
        &self,
        last_message_id: Option<String>,
        last_message_created_at: Option<i64>,
    ) -> Result<String> {
        self.pool
            .interact(move |conn| {
                memopedia::record_update_log_sync(
                    conn,
                    last_message_id.as_deref(),
                    last_message_created_at,
                )
            })
            .await
            .map_err(Into::into)
    }

    /// Reconstruct a page's composite at each point of its history.
    ///
    /// Returns the states newest-first, starting with the current composite
    /// and walking the diffs backwards. Used by history views; a replay
    /// failure yields what was reconstructed so far.
    pub async fn replay_history(&self, page_id: &str, limit: usize) -> Result<Vec<String>> {
        let page_id_owned = page_id.to_string();
        let (current, edits) = self
            .pool
            .interact(move |conn| {
                let page = memopedia::get_page_including_deleted_sync(conn, &page_id_owned)?;
                let edits = memopedia::get_page_edit_history_sync(conn, &page_id_owned, limit)?;
                Ok((page, edits))
            })
            .await?;
        let Some(page) = current else {
            return Err(WeaveError::NotFound(format!("page not found: {page_id}")));
        };

        let mut states = vec![if page.is_deleted { String::new() } else { page.composite() }];
        for edit in &edits {
            let latest = states.last().cloned().unwrap_or_default();
            match diff::apply_diff_reverse(&latest, &edit.diff_text) {
                Ok(previous) => states.push(previous),
                Err(e) => {
                    warn!(page = %page.id, edit = %edit.id, "history replay stopped: {e}");
                    break;
                }
            }
        }
        Ok(states)
    }

    /// Short brief (titles, summaries, keywords) for generation prompts.
    pub async fn brief(&self, max_chars: usize) -> Result<String> {
        let markdown = self.get_tree_markdown(None, true, false).await?;
        if markdown.chars().count() <= max_chars {
            return Ok(markdown);
        }
        Ok(markdown.chars().take(max_chars).collect())
    }
}

/// Category string validation for callers taking user input.
pub fn validate_category(category: &str) -> Result<&str> {
    if CATEGORIES.contains(&category) {
        Ok(category)
    } else {
        Err(WeaveError::Invalid(format!(
            "unknown category {category:?}, expected one of {CATEGORIES:?}"
        )))
    }
}
