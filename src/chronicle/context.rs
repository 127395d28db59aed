// src/chronicle/context.rs
// Episode context assembly via reverse level promotion
//
// Walk backwards from the newest chronicle entry. The level may rise by at
// most one per step, so detail stays near the present and compression grows
// into the past. Taken entries and their recursive sources go into a
// read-set, which keeps any time range from being read twice.

use crate::db::chronicle::{self, ChronicleEntry};
use crate::db::pool::DatabasePool;
use crate::error::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A single entry in the assembled episode context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    /// 0 = raw message, 1+ = chronicle level.
    pub level: i64,
    pub content: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub message_count: i64,
    /// Message id for level 0, chronicle entry id otherwise.
    pub source_id: String,
}

fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Level label: あらすじ with one のあらすじ per extra level.
pub(crate) fn level_label(level: i64) -> String {
    let mut label = String::from("あらすじ");
    for _ in 1..level.max(1) {
        label.push_str("のあらすじ");
    }
    label
}

/// Collect an entry's id plus every id reachable through source_ids.
fn mark_read_recursive(
    entry: &ChronicleEntry,
    by_id: &HashMap<&str, &ChronicleEntry>,
    read_ids: &mut HashSet<String>,
) {
    read_ids.insert(entry.id.clone());
    let mut stack: Vec<&String> = entry.source_ids.iter().collect();
    while let Some(id) = stack.pop() {
        if !read_ids.insert(id.clone()) {
            continue;
        }
        if let Some(child) = by_id.get(id.as_str()) {
            stack.extend(child.source_ids.iter());
        }
    }
}

/// Newest entry at `level` ending at or before `position` and not yet read.
fn find_at_position<'a>(
    entries: &'a [ChronicleEntry],
    position: i64,
    level: i64,
    read_ids: &HashSet<String>,
) -> Option<&'a ChronicleEntry> {
    entries.iter().find(|e| {
        e.level == level
            && e.end_time.is_some_and(|end| end <= position)
            && !read_ids.contains(&e.id)
    })
}

/// Reverse-level-promotion walk over all chronicle entries.
///
/// Entries are returned oldest-first. Candidate choice at each step: among
/// the levels currently allowed (up to one above the previous pick), take the
/// most recent candidate, preferring the higher level on an end-time tie —
/// that tie is exactly the moment a consolidated block's children have been
/// consumed and the block itself should stand in for the rest. On the last
/// budget slot the highest allowed level wins outright, so a deep past
/// compresses into the final entry instead of being cut off.
pub fn assemble_episode_context(
    entries: &[ChronicleEntry],
    max_entries: usize,
) -> Vec<ContextEntry> {
    let mut result: Vec<ContextEntry> = Vec::new();
    if entries.is_empty() || max_entries == 0 {
        return result;
    }

    // Entries are expected newest-first; enforce it locally.
    let mut sorted: Vec<&ChronicleEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| std::cmp::Reverse(e.end_time.unwrap_or(0)));
    let owned: Vec<ChronicleEntry> = sorted.into_iter().cloned().collect();

    let by_id: HashMap<&str, &ChronicleEntry> =
        owned.iter().map(|e| (e.id.as_str(), e)).collect();

    let Some(latest_end) = owned.first().and_then(|e| e.end_time) else {
        return result;
    };

    let mut read_ids: HashSet<String> = HashSet::new();
    let mut current_level: i64 = 0;
    let mut position = latest_end;

    while result.len() < max_entries {
        let max_allowed = current_level + 1;
        let remaining = max_entries - result.len();

        let found: Option<&ChronicleEntry> = if remaining == 1 {
            // Final slot: highest allowed level first.
            (1..=max_allowed)
                .rev()
                .find_map(|lvl| find_at_position(&owned, position, lvl, &read_ids))
        } else {
            // Most recent candidate wins; higher level breaks end-time ties.
            let mut best: Option<&ChronicleEntry> = None;
            for lvl in 1..=max_allowed {
                if let Some(candidate) = find_at_position(&owned, position, lvl, &read_ids) {
                    best = match best {
                        None => Some(candidate),
                        Some(current_best) => {
                            let cand_end = candidate.end_time.unwrap_or(i64::MIN);
                            let best_end = current_best.end_time.unwrap_or(i64::MIN);
                            if (cand_end, candidate.level) > (best_end, current_best.level) {
                                Some(candidate)
                            } else {
                                Some(current_best)
                            }
                        }
                    };
                }
            }
            best
        };

        let Some(entry) = found else {
            break;
        };

        result.push(ContextEntry {
            level: entry.level,
            content: entry.content.clone(),
            start_time: entry.start_time,
            end_time: entry.end_time,
            message_count: entry.message_count,
            source_id: entry.id.clone(),
        });

        mark_read_recursive(entry, &by_id, &mut read_ids);
        current_level = entry.level;
        let Some(start) = entry.start_time else {
            break;
        };
        position = start - 1;
    }

    result.reverse();
    result
}

/// Load all entries and assemble the context (async entry point).
pub async fn get_episode_context(
    pool: &Arc<DatabasePool>,
    max_entries: usize,
) -> Result<Vec<ContextEntry>> {
    let entries = pool
        .interact(|conn| chronicle::get_all_entries_ordered_sync(conn, None))
        .await?;
    Ok(assemble_episode_context(&entries, max_entries))
}

/// Format assembled context for system-prompt injection.
pub fn format_episode_context(context: &[ContextEntry], include_level_info: bool) -> String {
    if context.is_empty() {
        return String::new();
    }

    let mut parts: Vec<String> = Vec::new();
    let mut prev_level: i64 = -1;

    for entry in context {
        if include_level_info && entry.level != prev_level {
            if entry.level == 0 {
                parts.push("\n### 最近の出来事".to_string());
            } else {
                parts.push(format!("\n### {}", level_label(entry.level)));
            }
            prev_level = entry.level;
        }

        if entry.level == 0 {
            parts.push(format!("- {}", entry.content));
        } else {
            parts.push(format!(
                "【{} ~ {}】",
                format_timestamp(entry.start_time),
                format_timestamp(entry.end_time)
            ));
            parts.push(entry.content.clone());
            parts.push(String::new());
        }
    }

    parts.join("\n")
}

/// Temporal-isolation context: up to `limit` entries ending at or before
/// `end_time`, formatted oldest-first. Regenerating an old entry never sees
/// the future.
pub fn episode_context_for_timerange_sync(
    conn: &rusqlite::Connection,
    _start_time: i64,
    end_time: i64,
    limit: usize,
) -> anyhow::Result<String> {
    let all = chronicle::get_all_entries_ordered_sync(conn, None)?;

    let mut relevant: Vec<&ChronicleEntry> = Vec::new();
    for entry in &all {
        let Some(end) = entry.end_time else { continue };
        if end <= end_time {
            relevant.push(entry);
        }
        if relevant.len() >= limit {
            break;
        }
    }

    if relevant.is_empty() {
        return Ok(String::new());
    }
    relevant.sort_by_key(|e| e.end_time.unwrap_or(0));

    let mut parts: Vec<String> = Vec::new();
    for entry in relevant {
        parts.push(format!(
            "【{}: {} ~ {}】",
            level_label(entry.level),
            format_timestamp(entry.start_time),
            format_timestamp(entry.end_time)
        ));
        parts.push(entry.content.clone());
        parts.push(String::new());
    }
    Ok(parts.join("\n"))
}

/// Aggregate statistics about the episode memory.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeStats {
    pub total_messages_covered: i64,
    pub max_level: i64,
    pub entries_by_level: Vec<(i64, i64)>,
    pub unconsolidated_by_level: Vec<(i64, i64)>,
}

pub async fn get_episode_stats(pool: &Arc<DatabasePool>) -> Result<EpisodeStats> {
    pool.interact(|conn| {
        Ok(EpisodeStats {
            total_messages_covered: chronicle::get_total_message_count_sync(conn)?,
            max_level: chronicle::get_max_level_sync(conn)?,
            entries_by_level: chronicle::count_entries_by_level_sync(conn)?,
            unconsolidated_by_level: chronicle::count_unconsolidated_by_level_sync(conn)?,
        })
    })
    .await
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        id: &str,
        level: i64,
        start: i64,
        end: i64,
        source_ids: Vec<&str>,
        consolidated: bool,
        parent: Option<&str>,
    ) -> ChronicleEntry {
        ChronicleEntry {
            id: id.to_string(),
            level,
            content: format!("content of {id}"),
            source_ids: source_ids.into_iter().map(str::to_string).collect(),
            start_time: Some(start),
            end_time: Some(end),
            source_count: 1,
            message_count: if level == 1 { 2 } else { 10 },
            parent_id: parent.map(str::to_string),
            is_consolidated: consolidated,
            created_at: 0,
        }
    }

    /// Ten level-1 entries L1..L10, consolidated into M1 (L1..L5) and
    /// M2 (L6..L10).
    fn two_block_hierarchy() -> Vec<ChronicleEntry> {
        let mut entries = Vec::new();
        for i in 1..=10i64 {
            let parent = if i <= 5 { "M1" } else { "M2" };
            entries.push(entry(
                &format!("L{i}"),
                1,
                i * 10,
                i * 10 + 5,
                vec![],
                true,
                Some(parent),
            ));
        }
        entries.push(entry("M1", 2, 10, 55, vec!["L1", "L2", "L3", "L4", "L5"], false, None));
        entries.push(entry("M2", 2, 60, 105, vec!["L6", "L7", "L8", "L9", "L10"], false, None));
        entries
    }

    fn ids(result: &[ContextEntry]) -> Vec<&str> {
        result.iter().map(|e| e.source_id.as_str()).collect()
    }

    #[test]
    fn budget_four_compresses_the_older_window() {
        let result = assemble_episode_context(&two_block_hierarchy(), 4);
        assert_eq!(ids(&result), vec!["M1", "L8", "L9", "L10"]);
        // Non-decreasing level walking newest -> oldest
        let levels: Vec<i64> = result.iter().rev().map(|e| e.level).collect();
        assert!(levels.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn large_budget_promotes_once_children_are_consumed() {
        let result = assemble_episode_context(&two_block_hierarchy(), 50);
        // L10..L6 in detail, then M1 stands in for L1..L5.
        assert_eq!(ids(&result), vec!["M1", "L6", "L7", "L8", "L9", "L10"]);
    }

    #[test]
    fn no_source_id_is_covered_twice() {
        let entries = two_block_hierarchy();
        for budget in 1..=12 {
            let result = assemble_episode_context(&entries, budget);
            assert!(result.len() <= budget);

            // Expand each returned entry to its recursive level-1 leaves and
            // assert disjointness.
            let by_id: HashMap<&str, &ChronicleEntry> =
                entries.iter().map(|e| (e.id.as_str(), e)).collect();
            let mut leaves: Vec<&str> = Vec::new();
            for ce in &result {
                let e = by_id[ce.source_id.as_str()];
                if e.level == 1 {
                    leaves.push(e.id.as_str());
                } else {
                    for sid in &e.source_ids {
                        leaves.push(sid.as_str());
                    }
                }
            }
            let unique: HashSet<&str> = leaves.iter().copied().collect();
            assert_eq!(unique.len(), leaves.len(), "budget {budget} produced overlap");
        }
    }

    #[test]
    fn level_can_rise_by_at_most_one_per_step() {
        // Three levels deep: a level-3 entry over two level-2 blocks.
        let mut entries = two_block_hierarchy();
        for e in &mut entries {
            if e.id == "M1" || e.id == "M2" {
                e.is_consolidated = true;
                e.parent_id = Some("T1".to_string());
            }
        }
        entries.push(entry("T1", 3, 10, 105, vec!["M1", "M2"], false, None));
        // A fresh unconsolidated tail after the big block.
        entries.push(entry("L11", 1, 110, 115, vec![], false, None));

        let result = assemble_episode_context(&entries, 10);
        // Walking newest -> oldest the levels may only step up by one.
        let levels: Vec<i64> = result.iter().rev().map(|e| e.level).collect();
        assert_eq!(levels.first(), Some(&1));
        for w in levels.windows(2) {
            assert!(w[1] <= w[0] + 1);
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn empty_input_and_zero_budget() {
        assert!(assemble_episode_context(&[], 5).is_empty());
        assert!(assemble_episode_context(&two_block_hierarchy(), 0).is_empty());
    }

    #[test]
    fn formatting_inserts_level_headers_on_change() {
        let result = assemble_episode_context(&two_block_hierarchy(), 4);
        let text = format_episode_context(&result, true);
        assert!(text.contains("### あらすじのあらすじ"));
        assert!(text.contains("### あらすじ"));
        assert!(text.contains("content of M1"));
        assert!(text.contains("content of L10"));
    }

    #[test]
    fn label_nesting() {
        assert_eq!(level_label(1), "あらすじ");
        assert_eq!(level_label(2), "あらすじのあらすじ");
        assert_eq!(level_label(3), "あらすじのあらすじのあらすじ");
    }
}
