// src/uri.rs
// saiverse:// URI parsing and resolution
//
// URI forms:
//     saiverse://{city}/{persona_name}/{resource_type}/{path}?{params}
//     saiverse://self/{resource_type}/{path}?{params}
//     saiverse://image/{filename}        (global schemes)
//     saiverse://web?url={encoded_url}
//
// persona_id <-> city/name: persona_id = {name}_{city}.
//
// Persona-scoped schemes (messagelog / memopedia / chronicle) are readable
// only by the owning persona; the ACL check runs before any database access.
// Every handler is total: failures come back as ResolvedContent with
// content_type "error", never as a panic or an Err across the boundary.

use crate::db::chronicle::{self, ChronicleEntry};
use crate::db::messages::{self, Message};
use crate::db::pool::DatabasePool;
use crate::error::{Result, WeaveError};
use crate::memopedia::Memopedia;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub const URI_PREFIX: &str = "saiverse://";

/// Schemes that carry no city/persona prefix.
pub const GLOBAL_SCHEMES: [&str; 6] = ["image", "document", "item", "persona", "building", "web"];

/// Persona-scoped resource types.
pub const PERSONA_SCHEMES: [&str; 3] = ["messagelog", "memopedia", "chronicle"];

/// A parsed saiverse URI.
#[derive(Debug, Clone)]
pub struct ParsedUri {
    pub raw: String,
    pub scheme: String,
    /// Resolved persona id ("self" already substituted).
    pub persona_id: Option<String>,
    pub city: Option<String>,
    pub persona_name: Option<String>,
    pub path_parts: Vec<String>,
    pub params: HashMap<String, String>,
}

impl ParsedUri {
    pub fn is_persona_scoped(&self) -> bool {
        PERSONA_SCHEMES.contains(&self.scheme.as_str())
    }

    fn param_usize(&self, key: &str, default: usize) -> usize {
        self.params
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn param_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.parse().ok())
    }
}

/// Resolution result; `content_type` is "error" for every failure mode.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedContent {
    pub uri: String,
    pub content: String,
    pub content_type: String,
    pub char_count: usize,
    pub metadata: serde_json::Value,
}

impl ResolvedContent {
    pub fn new(
        uri: impl Into<String>,
        content: impl Into<String>,
        content_type: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        let content = content.into();
        Self {
            uri: uri.into(),
            char_count: content.chars().count(),
            content,
            content_type: content_type.into(),
            metadata,
        }
    }

    pub fn error(uri: impl Into<String>, message: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self::new(uri, format!("({})", message.into()), "error", metadata)
    }

    fn set_content(&mut self, content: String) {
        self.char_count = content.chars().count();
        self.content = content;
    }
}

/// Split persona_id into (city, name). City names usually start with
/// "city_"; fall back to the last underscore.
pub fn persona_id_to_city_name(persona_id: &str) -> (Option<String>, Option<String>) {
    if let Some(idx) = persona_id.find("_city_") {
        return (
            Some(persona_id[idx + 1..].to_string()),
            Some(persona_id[..idx].to_string()),
        );
    }
    match persona_id.rfind('_') {
        Some(idx) if idx > 0 => (
            Some(persona_id[idx + 1..].to_string()),
            Some(persona_id[..idx].to_string()),
        ),
        _ => (None, Some(persona_id.to_string())),
    }
}

pub fn city_name_to_persona_id(city: &str, persona_name: &str) -> String {
    format!("{persona_name}_{city}")
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decoded = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        params.insert(key.to_string(), decoded);
    }
    params
}

/// Parse a saiverse URI. `context_persona_id` resolves `self` references.
pub fn parse_uri(uri: &str, context_persona_id: Option<&str>) -> Result<ParsedUri> {
    let body = uri
        .strip_prefix(URI_PREFIX)
        .ok_or_else(|| WeaveError::Invalid(format!("URI must start with {URI_PREFIX}: {uri}")))?;

    let (body, params) = match body.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (body, HashMap::new()),
    };

    let parts: Vec<String> = body.split('/').filter(|p| !p.is_empty()).map(str::to_string).collect();
    let Some(first) = parts.first() else {
        return Err(WeaveError::Invalid(format!("empty URI path: {uri}")));
    };

    // "self" reference
    if first == "self" {
        let persona_id = context_persona_id.ok_or_else(|| {
            WeaveError::Invalid(format!("cannot resolve 'self' without a context persona: {uri}"))
        })?;
        let scheme = parts.get(1).ok_or_else(|| {
            WeaveError::Invalid(format!("missing resource type after 'self': {uri}"))
        })?;
        let (city, name) = persona_id_to_city_name(persona_id);
        return Ok(ParsedUri {
            raw: uri.to_string(),
            scheme: scheme.clone(),
            persona_id: Some(persona_id.to_string()),
            city,
            persona_name: name,
            path_parts: parts[2..].to_vec(),
            params,
        });
    }

    // Global schemes
    if GLOBAL_SCHEMES.contains(&first.as_str()) {
        return Ok(ParsedUri {
            raw: uri.to_string(),
            scheme: first.clone(),
            persona_id: None,
            city: None,
            persona_name: None,
            path_parts: parts[1..].to_vec(),
            params,
        });
    }

    // Persona-scoped: {city}/{persona_name}/{resource_type}/...
    if parts.len() >= 3 && PERSONA_SCHEMES.contains(&parts[2].as_str()) {
        let city = parts[0].clone();
        let persona_name = parts[1].clone();
        return Ok(ParsedUri {
            raw: uri.to_string(),
            scheme: parts[2].clone(),
            persona_id: Some(city_name_to_persona_id(&city, &persona_name)),
            city: Some(city),
            persona_name: Some(persona_name),
            path_parts: parts[3..].to_vec(),
            params,
        });
    }

    // Unknown scheme falls through; the resolver reports it as an error.
    Ok(ParsedUri {
        raw: uri.to_string(),
        scheme: first.clone(),
        persona_id: None,
        city: None,
        persona_name: None,
        path_parts: parts[1..].to_vec(),
        params,
    })
}

/// Access to per-persona memory databases.
#[async_trait]
pub trait PersonaDirectory: Send + Sync {
    /// Open (or fetch) the persona's database pool; None when unknown.
    async fn pool_for(&self, persona_id: &str) -> Option<Arc<DatabasePool>>;

    /// The persona's active thread suffix (defaults to the private thread).
    async fn active_thread_suffix(&self, _persona_id: &str) -> Option<String> {
        None
    }
}

/// Collaborator handling the global schemes (items, buildings, web, files).
#[async_trait]
pub trait GlobalResolver: Send + Sync {
    async fn resolve(&self, parsed: &ParsedUri) -> ResolvedContent;
}

pub struct UriResolver {
    directory: Arc<dyn PersonaDirectory>,
    global: Option<Arc<dyn GlobalResolver>>,
}

impl UriResolver {
    pub fn new(directory: Arc<dyn PersonaDirectory>, global: Option<Arc<dyn GlobalResolver>>) -> Self {
        Self { directory, global }
    }

    /// Resolve a single URI. Total: every failure is an error content.
    pub async fn resolve(&self, uri: &str, persona_id: Option<&str>) -> ResolvedContent {
        let parsed = match parse_uri(uri, persona_id) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ResolvedContent::error(uri, format!("URI解決エラー: {e}"), serde_json::json!({"error": e.to_string()}));
            }
        };

        // Persona-scope ACL: only the owning persona reads its memory.
        if parsed.is_persona_scoped() {
            let Some(caller) = persona_id else {
                warn!(uri, "access denied: persona-scoped URI without caller persona");
                return ResolvedContent::error(
                    uri,
                    "アクセス拒否: ペルソナスコープURIにはpersona_idが必要です",
                    serde_json::json!({"error": "access_denied", "reason": "persona_id_required"}),
                );
            };
            if parsed.persona_id.as_deref() != Some(caller) {
                warn!(
                    uri,
                    caller,
                    target = parsed.persona_id.as_deref().unwrap_or("?"),
                    "access denied: foreign persona memory"
                );
                return ResolvedContent::error(
                    uri,
                    "アクセス拒否: 他ペルソナの記憶は参照できません",
                    serde_json::json!({
                        "error": "access_denied",
                        "target_persona": parsed.persona_id,
                    }),
                );
            }
        }

        match parsed.scheme.as_str() {
            "messagelog" => self.resolve_messagelog(&parsed).await,
            "memopedia" => self.resolve_memopedia(&parsed).await,
            "chronicle" => self.resolve_chronicle(&parsed).await,
            scheme if GLOBAL_SCHEMES.contains(&scheme) => match &self.global {
                Some(global) => global.resolve(&parsed).await,
                None => ResolvedContent::error(
                    uri,
                    format!("no resolver available for scheme: {scheme}"),
                    serde_json::json!({"error": format!("unhandled scheme: {scheme}")}),
                ),
            },
            other => ResolvedContent::error(
                uri,
                format!("unsupported URI scheme: {other}"),
                serde_json::json!({"error": format!("unknown scheme: {other}")}),
            ),
        }
    }

    /// Resolve several URIs and trim the total content size.
    ///
    /// `priority = "first"` keeps earlier items whole until the budget runs
    /// out; `"balanced"` gives every item an equal share.
    pub async fn resolve_many(
        &self,
        uris: &[String],
        persona_id: Option<&str>,
        max_total_chars: usize,
        priority: &str,
    ) -> Vec<ResolvedContent> {
        let mut results = Vec::with_capacity(uris.len());
        for uri in uris {
            results.push(self.resolve(uri, persona_id).await);
        }

        let total: usize = results.iter().map(|r| r.char_count).sum();
        if total <= max_total_chars {
            return results;
        }

        if priority == "balanced" {
            let per_item = max_total_chars / results.len().max(1);
            for result in &mut results {
                if result.char_count > per_item {
                    let kept: String = result.content.chars().take(per_item).collect();
                    result.set_content(format!("{kept}\n... (truncated)"));
                }
            }
        } else {
            let mut remaining = max_total_chars;
            for result in &mut results {
                if remaining == 0 {
                    result.set_content("(skipped due to char limit)".to_string());
                } else if result.char_count > remaining {
                    let kept: String = result.content.chars().take(remaining).collect();
                    result.set_content(format!("{kept}\n... (truncated)"));
                    remaining = 0;
                } else {
                    remaining -= result.char_count;
                }
            }
        }
        results
    }

    async fn pool_or_error(&self, parsed: &ParsedUri) -> std::result::Result<Arc<DatabasePool>, ResolvedContent> {
        let persona_id = parsed.persona_id.as_deref().unwrap_or_default();
        match self.directory.pool_for(persona_id).await {
            Some(pool) => Ok(pool),
            None => Err(ResolvedContent::error(
                &parsed.raw,
                format!("memory not available for {persona_id}"),
                serde_json::json!({"error": "persona_unavailable"}),
            )),
        }
    }

    async fn active_thread_id(&self, parsed: &ParsedUri) -> String {
        let persona_id = parsed.persona_id.clone().unwrap_or_default();
        let suffix = self
            .directory
            .active_thread_suffix(&persona_id)
            .await
            .unwrap_or_else(|| crate::messages::PERSONA_THREAD_SUFFIX.to_string());
        format!("{persona_id}:{suffix}")
    }

    // ----- messagelog -----

    async fn resolve_messagelog(&self, parsed: &ParsedUri) -> ResolvedContent {
        let pool = match self.pool_or_error(parsed).await {
            Ok(pool) => pool,
            Err(err) => return err,
        };
        let path: Vec<&str> = parsed.path_parts.iter().map(String::as_str).collect();

        let outcome: Result<ResolvedContent> = match path.as_slice() {
            ["msg", "recent", ..] => {
                let depth = parsed.param_usize("depth", 5);
                let thread_id = self.active_thread_id(parsed).await;
                let msgs = pool
                    .interact(move |conn| messages::get_messages_last_sync(conn, &thread_id, depth))
                    .await
                    .map_err(WeaveError::from);
                msgs.map(|msgs| {
                    let count = msgs.len();
                    ResolvedContent::new(
                        &parsed.raw,
                        if msgs.is_empty() { "(no recent messages)".to_string() } else { format_messages(&msgs, None) },
                        "message_log",
                        serde_json::json!({"depth": depth, "count": count}),
                    )
                })
            }
            ["msg"] if parsed.params.contains_key("contain") => {
                let needle = parsed.params["contain"].clone();
                let window = parsed.param_usize("window", 0);
                let thread_id = self.active_thread_id(parsed).await;
                self.message_with_window(parsed, &pool, window, move |conn| {
                    messages::find_message_containing_sync(conn, &thread_id, &needle)
                })
                .await
            }
            ["msg", id, ..] => {
                let id = id.to_string();
                let window = parsed.param_usize("window", 0);
                self.message_with_window(parsed, &pool, window, move |conn| {
                    messages::get_message_sync(conn, &id)
                })
                .await
            }
            ["thread", suffix, ..] => {
                let thread_id = format!(
                    "{}:{suffix}",
                    parsed.persona_id.as_deref().unwrap_or_default()
                );
                let last = parsed.param_usize("last", 20);
                let thread_for_meta = thread_id.clone();
                let msgs = pool
                    .interact(move |conn| messages::get_messages_last_sync(conn, &thread_id, last))
                    .await
                    .map_err(WeaveError::from);
                msgs.map(|msgs| {
                    let count = msgs.len();
                    ResolvedContent::new(
                        &parsed.raw,
                        if msgs.is_empty() { "(no messages in thread)".to_string() } else { format_messages(&msgs, None) },
                        "message_log",
                        serde_json::json!({"thread_id": thread_for_meta, "count": count}),
                    )
                })
            }
            [] | ["range", ..] if parsed.params.contains_key("from") => {
                let from = parsed.param_i64("from").unwrap_or(0);
                let to = parsed.param_i64("to").unwrap_or(i64::MAX);
                let msgs = pool
                    .interact(move |conn| messages::get_messages_in_range_sync(conn, from, to, 100))
                    .await
                    .map_err(WeaveError::from);
                msgs.map(|msgs| {
                    let count = msgs.len();
                    ResolvedContent::new(
                        &parsed.raw,
                        if msgs.is_empty() { "(no messages in range)".to_string() } else { format_messages(&msgs, None) },
                        "message_log",
                        serde_json::json!({"from": from, "to": to, "count": count}),
                    )
                })
            }
            other => Err(WeaveError::NotFound(format!(
                "unknown messagelog path: {}",
                other.join("/")
            ))),
        };

        outcome.unwrap_or_else(|e| {
            ResolvedContent::error(&parsed.raw, format!("URI解決エラー: {e}"), serde_json::json!({"error": e.to_string()}))
        })
    }

    async fn message_with_window<F>(
        &self,
        parsed: &ParsedUri,
        pool: &Arc<DatabasePool>,
        window: usize,
        lookup: F,
    ) -> Result<ResolvedContent>
    where
        F: FnOnce(&rusqlite::Connection) -> anyhow::Result<Option<Message>> + Send + 'static,
    {
        let found = pool
            .interact(move |conn| {
                let Some(msg) = lookup(conn)? else {
                    return Ok(None);
                };
                let neighborhood = if window > 0 {
                    let mut bundle = messages::get_messages_around_sync(conn, &msg, window, window)?;
                    bundle.push(msg.clone());
                    bundle.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
                    bundle
                } else {
                    vec![msg.clone()]
                };
                Ok(Some((msg, neighborhood)))
            })
            .await?;

        let Some((msg, bundle)) = found else {
            return Err(WeaveError::NotFound("message not found".into()));
        };
        let content_type = if window > 0 { "message_log" } else { "message" };
        Ok(ResolvedContent::new(
            &parsed.raw,
            format_messages(&bundle, Some(&msg.id)),
            content_type,
            serde_json::json!({
                "message_id": msg.id,
                "created_at": msg.created_at,
                "window": window,
            }),
        ))
    }

    // ----- memopedia -----

    async fn resolve_memopedia(&self, parsed: &ParsedUri) -> ResolvedContent {
        let pool = match self.pool_or_error(parsed).await {
            Ok(pool) => pool,
            Err(err) => return err,
        };
        let memopedia = Memopedia::new(pool);
        let path: Vec<&str> = parsed.path_parts.iter().map(String::as_str).collect();

        let outcome: Result<ResolvedContent> = match path.as_slice() {
            ["tree", ..] => memopedia
                .get_tree_markdown(None, false, false)
                .await
                .map(|content| ResolvedContent::new(&parsed.raw, content, "memopedia_tree", serde_json::Value::Null)),
            ["page", rest @ ..] => {
                let page_result = if let Some(id) = rest.first() {
                    memopedia.get_page(id).await
                } else if let Some(title) = parsed.params.get("title") {
                    memopedia.find_by_title(title, None).await
                } else {
                    Ok(None)
                };
                match page_result {
                    Ok(Some(page)) => Ok(ResolvedContent::new(
                        &parsed.raw,
                        format_memopedia_page(&page),
                        "memopedia_page",
                        serde_json::json!({
                            "page_id": page.id,
                            "title": page.title,
                            "category": page.category,
                        }),
                    )),
                    Ok(None) => Err(WeaveError::NotFound("memopedia page not found".into())),
                    Err(e) => Err(e.into()),
                }
            }
            other => Err(WeaveError::NotFound(format!(
                "unknown memopedia path: {}",
                other.join("/")
            ))),
        };

        outcome.unwrap_or_else(|e| {
            ResolvedContent::error(&parsed.raw, format!("URI解決エラー: {e}"), serde_json::json!({"error": e.to_string()}))
        })
    }

    // ----- chronicle -----

    async fn resolve_chronicle(&self, parsed: &ParsedUri) -> ResolvedContent {
        let pool = match self.pool_or_error(parsed).await {
            Ok(pool) => pool,
            Err(err) => return err,
        };
        let path: Vec<&str> = parsed.path_parts.iter().map(String::as_str).collect();

        let outcome: Result<ResolvedContent> = match path.as_slice() {
            ["entry"] if parsed.params.contains_key("contain") => {
                let needle = parsed.params["contain"].clone();
                let entries = pool
                    .interact(move |conn| chronicle::search_entries_sync(conn, &needle, 1))
                    .await;
                match entries {
                    Ok(entries) => match entries.into_iter().next() {
                        Some(entry) => Ok(entry_content(parsed, &entry)),
                        None => Err(WeaveError::NotFound("chronicle entry not found".into())),
                    },
                    Err(e) => Err(e.into()),
                }
            }
            ["entry", id, ..] => {
                let id = id.to_string();
                let entry = pool
                    .interact(move |conn| chronicle::get_entry_sync(conn, &id))
                    .await;
                match entry {
                    Ok(Some(entry)) => Ok(entry_content(parsed, &entry)),
                    Ok(None) => Err(WeaveError::NotFound("chronicle entry not found".into())),
                    Err(e) => Err(e.into()),
                }
            }
            ["recent", ..] => {
                let depth = parsed.param_usize("depth", 5);
                let entries = pool
                    .interact(move |conn| chronicle::get_all_entries_ordered_sync(conn, Some(depth)))
                    .await;
                match entries {
                    Ok(mut ordered) => {
                        ordered.reverse(); // oldest first
                        let count = ordered.len();
                        Ok(ResolvedContent::new(
                            &parsed.raw,
                            if ordered.is_empty() { "(no chronicle entries)".to_string() } else { format_entries(&ordered) },
                            "chronicle_log",
                            serde_json::json!({"depth": depth, "count": count}),
                        ))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            ["range", ..] if parsed.params.contains_key("from") => {
                let from = parsed.param_i64("from").unwrap_or(0);
                let to = parsed.param_i64("to").unwrap_or(i64::MAX);
                let entries = pool
                    .interact(move |conn| {
                        let all = chronicle::get_all_entries_ordered_sync(conn, None)?;
                        let mut hits: Vec<ChronicleEntry> = all
                            .into_iter()
                            .filter(|e| {
                                e.start_time.is_some_and(|s| s <= to)
                                    && e.end_time.is_some_and(|end| end >= from)
                            })
                            .take(20)
                            .collect();
                        hits.reverse();
                        Ok(hits)
                    })
                    .await;
                match entries {
                    Ok(entries) => {
                        let count = entries.len();
                        Ok(ResolvedContent::new(
                            &parsed.raw,
                            if entries.is_empty() { "(no entries in range)".to_string() } else { format_entries(&entries) },
                            "chronicle_log",
                            serde_json::json!({"from": from, "to": to, "count": count}),
                        ))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            other => Err(WeaveError::NotFound(format!(
                "unknown chronicle path: {}",
                other.join("/")
            ))),
        };

        outcome.unwrap_or_else(|e| {
            ResolvedContent::error(&parsed.raw, format!("URI解決エラー: {e}"), serde_json::json!({"error": e.to_string()}))
        })
    }
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn format_messages(msgs: &[Message], highlight_id: Option<&str>) -> String {
    msgs.iter()
        .map(|m| {
            let marker = if highlight_id == Some(m.id.as_str()) { ">> " } else { "" };
            format!(
                "{marker}[{}] {}: {}",
                format_timestamp(m.created_at),
                m.display_role(),
                m.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_memopedia_page(page: &crate::db::memopedia::Page) -> String {
    let mut lines = vec![format!("# {}", page.title)];
    if !page.summary.is_empty() {
        lines.push(format!("\n*{}*", page.summary));
    }
    if !page.content.is_empty() {
        lines.push(format!("\n{}", page.content));
    }
    if !page.keywords.is_empty() {
        lines.push(format!("\nキーワード: {}", page.keywords.join(", ")));
    }
    lines.join("\n")
}

fn format_entries(entries: &[ChronicleEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "【Lv{} {} ~ {}】\n{}",
                e.level,
                e.start_time.map(format_timestamp).unwrap_or_else(|| "?".into()),
                e.end_time.map(format_timestamp).unwrap_or_else(|| "?".into()),
                e.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn entry_content(parsed: &ParsedUri, entry: &ChronicleEntry) -> ResolvedContent {
    ResolvedContent::new(
        &parsed.raw,
        format_entries(std::slice::from_ref(entry)),
        "chronicle_entry",
        serde_json::json!({
            "entry_id": entry.id,
            "level": entry.level,
            "start_time": entry.start_time,
            "end_time": entry.end_time,
            "message_count": entry.message_count,
        }),
    )
}
