// src/chronicle/generator.rs
// Chronicle generation: level-1 batch summaries, recursive consolidation,
// gap-fill integration with cascading parent regeneration
//
// The LLM is never called while a pool closure is live: each step reads what
// it needs, leaves the pool, calls the model, and re-enters for the write.
// DB persistence retries up to 3 times with 1/2/4-second backoff; LLM calls
// are not retried here (the client owns its retry budget).

use crate::db::chronicle::{self, ChronicleEntry};
use crate::db::messages::{self, Message};
use crate::db::pool::DatabasePool;
use crate::error::{BatchMeta, LlmError, Result, WeaveError};
use crate::llm::{ChatMessage, LlmClient};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::context::{episode_context_for_timerange_sync, level_label};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_CONSOLIDATION_SIZE: usize = 10;

/// Past-context caps for temporal-isolation prompts.
const LEVEL1_CONTEXT_ENTRIES: usize = 20;
const CONSOLIDATION_CONTEXT_ENTRIES: usize = 10;

const DB_RETRIES: usize = 3;

/// Hook invoked after each batch's chronicle work, used to interleave
/// Memopedia extraction with generation.
#[async_trait]
pub trait BatchHook: Send + Sync {
    async fn on_batch(&self, batch: &[Message]);
}

/// Callbacks threaded through a generation run.
#[derive(Default, Clone)]
pub struct RunHooks {
    pub progress: Option<Arc<dyn Fn(usize, usize) + Send + Sync>>,
    pub cancel: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    pub batch_hook: Option<Arc<dyn BatchHook>>,
}

impl RunHooks {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|f| f())
    }

    fn report(&self, processed: usize, total: usize) {
        if let Some(cb) = &self.progress {
            cb(processed, total);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChronicleConfig {
    pub batch_size: usize,
    pub consolidation_size: usize,
    pub include_timestamp: bool,
    pub max_messages: Option<usize>,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            consolidation_size: DEFAULT_CONSOLIDATION_SIZE,
            include_timestamp: true,
            max_messages: None,
        }
    }
}

/// Entries produced by one generation call.
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub level1: Vec<ChronicleEntry>,
    pub consolidated: Vec<ChronicleEntry>,
}

pub struct ChronicleGenerator {
    pool: Arc<DatabasePool>,
    llm: Arc<dyn LlmClient>,
    pub config: ChronicleConfig,
    /// Semantic-memory brief injected into level-1 prompts.
    pub memopedia_context: Option<String>,
}

fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn format_messages_for_prompt(window: &[Message], include_timestamp: bool) -> String {
    let mut lines: Vec<String> = Vec::new();
    for msg in window {
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }
        if include_timestamp {
            lines.push(format!(
                "[{}] [{}]: {content}",
                format_timestamp(Some(msg.created_at)),
                msg.display_role()
            ));
        } else {
            lines.push(format!("[{}]: {content}", msg.display_role()));
        }
    }
    lines.join("\n\n")
}

fn format_entries_for_prompt(entries: &[ChronicleEntry], include_timestamp: bool) -> String {
    let mut lines: Vec<String> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if include_timestamp {
            lines.push(format!(
                "### あらすじ {} ({} ~ {})",
                i + 1,
                format_timestamp(entry.start_time),
                format_timestamp(entry.end_time)
            ));
        } else {
            lines.push(format!("### あらすじ {}", i + 1));
        }
        lines.push(entry.content.clone());
        lines.push(String::new());
    }
    lines.join("\n")
}

fn time_range(window: &[Message]) -> (Option<i64>, Option<i64>) {
    let start = window.iter().map(|m| m.created_at).min();
    let end = window.iter().map(|m| m.created_at).max();
    (start, end)
}

fn entry_time_range(entries: &[ChronicleEntry]) -> (Option<i64>, Option<i64>) {
    let start = entries.iter().filter_map(|e| e.start_time).min();
    let end = entries.iter().filter_map(|e| e.end_time).max();
    (start, end)
}

impl ChronicleGenerator {
    pub fn new(pool: Arc<DatabasePool>, llm: Arc<dyn LlmClient>, config: ChronicleConfig) -> Self {
        Self {
            pool,
            llm,
            config,
            memopedia_context: None,
        }
    }

    pub fn with_memopedia_context(mut self, context: Option<String>) -> Self {
        self.memopedia_context = context;
        self
    }

    /// Main entry point: find unprocessed messages, group them into
    /// contiguous runs, and generate for each qualifying run.
    ///
    /// A run is a maximal stretch of unprocessed messages between processed
    /// ones. Runs shorter than batch_size are deferred: short dangling
    /// fragments summarize poorly and are nearly always transient.
    pub async fn generate_unprocessed(&self, hooks: &RunHooks) -> Result<GenerationOutcome> {
        let (all_messages, processed) = self
            .pool
            .interact(|conn| {
                let msgs = messages::get_all_messages_ordered_sync(conn)?;
                let processed = chronicle::get_processed_message_ids_sync(conn)?;
                Ok((msgs, processed))
            })
            .await?;

        let mut runs: Vec<Vec<Message>> = Vec::new();
        let mut current: Vec<Message> = Vec::new();
        for msg in all_messages {
            if processed.contains(&msg.id) {
                if !current.is_empty() {
                    runs.push(std::mem::take(&mut current));
                }
                continue;
            }
            current.push(msg);
        }
        if !current.is_empty() {
            runs.push(current);
        }

        let total_unprocessed: usize = runs.iter().map(Vec::len).sum();
        let mut qualifying: Vec<Vec<Message>> =
            runs.into_iter().filter(|r| r.len() >= self.config.batch_size).collect();
        let mut total_qualifying: usize = qualifying.iter().map(Vec::len).sum();
        info!(
            processed = processed.len(),
            unprocessed = total_unprocessed,
            qualifying_runs = qualifying.len(),
            qualifying_messages = total_qualifying,
            deferred = total_unprocessed - total_qualifying,
            "chronicle run scan"
        );

        if let Some(max) = self.config.max_messages
            && max > 0
        {
            let mut limited: Vec<Vec<Message>> = Vec::new();
            let mut remaining = max;
            for mut run in qualifying {
                if remaining == 0 {
                    break;
                }
                if run.len() > remaining {
                    run.truncate(remaining);
                }
                remaining -= run.len();
                limited.push(run);
            }
            qualifying = limited;
            total_qualifying = qualifying.iter().map(Vec::len).sum();
            info!(max_messages = max, capped_messages = total_qualifying, "max_messages applied");
        }

        if qualifying.is_empty() {
            return Ok(GenerationOutcome::default());
        }

        let mut outcome = GenerationOutcome::default();
        let mut global_offset = 0usize;
        for (run_idx, run) in qualifying.iter().enumerate() {
            if hooks.cancelled() {
                info!(runs_done = run_idx, "chronicle generation cancelled between runs");
                break;
            }
            info!(run = run_idx + 1, messages = run.len(), "processing run");

            let offset = global_offset;
            let run_hooks = RunHooks {
                progress: hooks.progress.as_ref().map(|cb| {
                    let cb = cb.clone();
                    Arc::new(move |processed: usize, _local_total: usize| {
                        cb(offset + processed, total_qualifying)
                    }) as Arc<dyn Fn(usize, usize) + Send + Sync>
                }),
                cancel: hooks.cancel.clone(),
                batch_hook: hooks.batch_hook.clone(),
            };

            let run_outcome = self.generate_from_messages(run, &run_hooks).await?;

            // Advisory bookmark: last message covered by a produced entry.
            if let Some(last) = run_outcome
                .level1
                .last()
                .and_then(|e| e.source_ids.last().cloned())
            {
                let _ = self
                    .pool
                    .interact(move |conn| chronicle::update_progress_sync(conn, &last))
                    .await;
            }

            outcome.level1.extend(run_outcome.level1);
            outcome.consolidated.extend(run_outcome.consolidated);
            global_offset += run.len();
        }

        hooks.report(global_offset.min(total_qualifying), total_qualifying);
        Ok(outcome)
    }

    /// Generate entries for one contiguous run, window by window.
    ///
    /// Windows are exactly batch_size messages; a trailing incomplete window
    /// is dropped and picked up by a later run.
    pub async fn generate_from_messages(
        &self,
        run: &[Message],
        hooks: &RunHooks,
    ) -> Result<GenerationOutcome> {
        let mut outcome = GenerationOutcome::default();
        // Level-2 entries created during THIS run are sequential consolidation
        // results, not gap-fill targets.
        let mut created_l2_ids: HashSet<String> = HashSet::new();

        let total = run.len();
        for (i, window) in run.chunks(self.config.batch_size).enumerate() {
            if hooks.cancelled() {
                info!("chronicle generation cancelled between batches");
                break;
            }
            if window.len() < self.config.batch_size {
                info!(len = window.len(), batch_size = self.config.batch_size, "skipping incomplete batch");
                continue;
            }

            let window_start = i * self.config.batch_size;
            hooks.report(window_start, total);
            info!(from = window_start + 1, to = window_start + window.len(), total, "processing batch");

            let entry = match self.generate_level1(window).await {
                Ok(entry) => entry,
                Err(WeaveError::Llm(mut llm_err)) => {
                    let (start, end) = time_range(window);
                    llm_err.user_message = format!(
                        "メッセージ {}〜{} の処理中: {}",
                        window_start + 1,
                        window_start + window.len(),
                        llm_err.user_message
                    );
                    llm_err.batch_meta = Some(BatchMeta {
                        message_ids: window.iter().map(|m| m.id.clone()).collect(),
                        start_time: start.unwrap_or(0),
                        end_time: end.unwrap_or(0),
                    });
                    return Err(WeaveError::Llm(llm_err));
                }
                Err(other) => return Err(other),
            };

            // Covering-entry check: a level-2 from a PREVIOUS run containing
            // this window's time range marks a gap-fill.
            let covering = match (entry.start_time, entry.end_time) {
                (Some(start), Some(end)) => {
                    self.pool
                        .interact(move |conn| chronicle::find_covering_entry_sync(conn, start, end, 2))
                        .await?
                }
                _ => None,
            };
            let covering = covering.filter(|c| {
                if created_l2_ids.contains(&c.id) {
                    info!(entry = %entry.id, covering = %c.id, "covering level-2 was created this run, not a gap-fill");
                    false
                } else {
                    true
                }
            });

            if let Some(covering) = covering {
                info!(
                    entry = %entry.id, covering = %covering.id,
                    "gap-fill detected, integrating into existing hierarchy"
                );
                let regenerated = self.integrate_gap_fill(&entry).await?;
                outcome.consolidated.extend(regenerated);
            } else {
                let consolidated = self.maybe_consolidate(1).await?;
                for c in &consolidated {
                    if c.level == 2 {
                        created_l2_ids.insert(c.id.clone());
                    }
                }
                outcome.consolidated.extend(consolidated);
            }

            outcome.level1.push(entry);

            if let Some(hook) = &hooks.batch_hook {
                hook.on_batch(window).await;
            }
        }

        hooks.report(total, total);
        Ok(outcome)
    }

    /// Generate and persist one level-1 entry from a message window.
    pub async fn generate_level1(&self, window: &[Message]) -> Result<ChronicleEntry> {
        if window.is_empty() {
            return Err(WeaveError::Invalid("empty message window".into()));
        }

        let (start_time, end_time) = time_range(window);

        // Temporal isolation: past entries only, never the future.
        let context = match (start_time, end_time) {
            (Some(start), Some(end)) => {
                self.pool
                    .interact(move |conn| {
                        episode_context_for_timerange_sync(conn, start, end, LEVEL1_CONTEXT_ENTRIES)
                    })
                    .await?
            }
            _ => String::new(),
        };

        let conversation = format_messages_for_prompt(window, self.config.include_timestamp);
        if conversation.trim().is_empty() {
            return Err(WeaveError::Invalid("window has no non-empty content".into()));
        }

        let mut prompt_parts: Vec<String> = vec![
            "あなたは記憶の記録者です。以下の会話から、出来事のあらすじを書いてください。".into(),
            String::new(),
        ];
        if !context.is_empty() {
            prompt_parts.extend(["## これまでの流れ（参考）".into(), context, String::new()]);
        }
        if let Some(brief) = &self.memopedia_context {
            prompt_parts.extend([
                "## 意味記憶（人物・用語の背景情報）".into(),
                brief.clone(),
                String::new(),
            ]);
        }
        prompt_parts.extend([
            "## 今回記録する会話".into(),
            conversation,
            String::new(),
            "## 指示".into(),
            "- 3〜5文程度で、何が起きたか、誰と何を話したかを要約".into(),
            "- 時系列の流れがわかるように書く".into(),
            "- 固有名詞や重要な詳細は保持する".into(),
            "- 感情や雰囲気も含める".into(),
            "- 「〜について話した」のような抽象的な記述は避け、具体的に書く".into(),
            "- **日時情報（【2025-01-07 23:56 ~】など）は書かないでください**（自動で付与されます）".into(),
            "- **「あらすじ」などの見出しは書かないでください**（本文のみ出力）".into(),
            String::new(),
            "あらすじを日本語で書いてください。".into(),
        ]);

        let response = self
            .llm
            .generate(vec![ChatMessage::user(prompt_parts.join("\n"))], None)
            .await?;
        let content = response.trim().to_string();
        if content.is_empty() {
            return Err(LlmError::empty("level-1 summary came back empty").into());
        }

        let source_ids: Vec<String> = window.iter().map(|m| m.id.clone()).collect();
        let count = window.len() as i64;
        let entry = self
            .persist_with_retry(move |conn| {
                chronicle::create_entry_sync(
                    conn, 1, &content, &source_ids, start_time, end_time, count, count,
                )
            })
            .await?;
        info!(entry = %entry.id, "created level-1 entry");
        Ok(entry)
    }

    fn consolidation_prompt(
        &self,
        sources: &[ChronicleEntry],
        target_level: i64,
        context: &str,
    ) -> String {
        let mut prompt_parts: Vec<String> = vec![
            format!(
                "以下の{}個のあらすじを統合し、「{}」としてまとめてください。",
                sources.len(),
                level_label(target_level)
            ),
            String::new(),
        ];
        if !context.is_empty() {
            prompt_parts.extend([
                "## さらに前の出来事（参考）".into(),
                context.to_string(),
                String::new(),
            ]);
        }
        prompt_parts.extend([
            "## 統合対象のあらすじ".into(),
            format_entries_for_prompt(sources, self.config.include_timestamp),
            String::new(),
            "## 指示".into(),
            "- 5〜8文程度で、全体の流れを俯瞰できるようにまとめる".into(),
            "- 重要な転換点や印象的なエピソードを保持する".into(),
            "- 個々の詳細より「どんな時期だったか」を重視する".into(),
            "- 時系列順に書く".into(),
            String::new(),
            "統合されたあらすじを日本語で書いてください。".into(),
        ]);
        prompt_parts.join("\n")
    }

    /// Synthesize a level-(L+1) entry from entries at level L and mark them
    /// consolidated under it.
    pub async fn generate_consolidated(
        &self,
        sources: &[ChronicleEntry],
        target_level: i64,
    ) -> Result<ChronicleEntry> {
        if sources.is_empty() {
            return Err(WeaveError::Invalid("no entries to consolidate".into()));
        }
        let expected = target_level - 1;
        if let Some(bad) = sources.iter().find(|e| e.level != expected) {
            return Err(WeaveError::Invalid(format!(
                "entry {} is at level {}, expected {expected}",
                bad.id, bad.level
            )));
        }

        let (start_time, end_time) = entry_time_range(sources);
        let context = match (start_time, end_time) {
            (Some(start), Some(end)) => {
                self.pool
                    .interact(move |conn| {
                        episode_context_for_timerange_sync(
                            conn,
                            start,
                            end,
                            CONSOLIDATION_CONTEXT_ENTRIES,
                        )
                    })
                    .await?
            }
            _ => String::new(),
        };

        let prompt = self.consolidation_prompt(sources, target_level, &context);
        let response = self.llm.generate(vec![ChatMessage::user(prompt)], None).await?;
        let content = response.trim().to_string();
        if content.is_empty() {
            return Err(LlmError::empty(format!(
                "level-{target_level} consolidation came back empty"
            ))
            .into());
        }

        let source_ids: Vec<String> = sources.iter().map(|e| e.id.clone()).collect();
        let total_messages: i64 = sources.iter().map(|e| e.message_count).sum();
        let source_count = sources.len() as i64;

        let entry = {
            let source_ids = source_ids.clone();
            self.persist_with_retry(move |conn| {
                chronicle::create_entry_sync(
                    conn,
                    target_level,
                    &content,
                    &source_ids,
                    start_time,
                    end_time,
                    source_count,
                    total_messages,
                )
            })
            .await?
        };

        let parent_id = entry.id.clone();
        self.persist_with_retry(move |conn| {
            chronicle::mark_consolidated_sync(conn, &source_ids, &parent_id)?;
            Ok(())
        })
        .await?;

        info!(entry = %entry.id, level = target_level, messages = total_messages, "created consolidated entry");
        Ok(entry)
    }

    /// Consolidate pending entries at `level` while enough exist, then climb.
    ///
    /// A consolidation failure logs and stops this pass; the pending entries
    /// are retried on the next generation.
    pub async fn maybe_consolidate(&self, level: i64) -> Result<Vec<ChronicleEntry>> {
        let mut created: Vec<ChronicleEntry> = Vec::new();
        let mut level = level;

        loop {
            let current_level = level;
            let mut pending = self
                .pool
                .interact(move |conn| chronicle::get_unconsolidated_entries_sync(conn, current_level))
                .await?;

            let mut made_any = false;
            while pending.len() >= self.config.consolidation_size {
                let batch: Vec<ChronicleEntry> =
                    pending.drain(..self.config.consolidation_size).collect();
                match self.generate_consolidated(&batch, level + 1).await {
                    Ok(entry) => {
                        created.push(entry);
                        made_any = true;
                    }
                    Err(e) => {
                        warn!(level = level + 1, "consolidation failed, will retry on next generation: {e}");
                        return Ok(created);
                    }
                }
            }

            if !made_any {
                break;
            }
            level += 1;
        }

        Ok(created)
    }

    /// Re-generate a consolidated entry's content in place from its current
    /// sources, preserving id, parent_id, and downstream references.
    ///
    /// This is the only spot that retries the LLM itself: a cascade losing
    /// one link corrupts every level above it.
    pub async fn regenerate_consolidated_content(&self, entry_id: &str) -> Result<ChronicleEntry> {
        let (entry, sources) = {
            let entry_id = entry_id.to_string();
            self.pool
                .interact(move |conn| {
                    let Some(entry) = chronicle::get_entry_sync(conn, &entry_id)? else {
                        anyhow::bail!("entry not found: {entry_id}");
                    };
                    let mut sources = Vec::new();
                    for sid in &entry.source_ids {
                        match chronicle::get_entry_sync(conn, sid)? {
                            Some(src) => sources.push(src),
                            None => warn!(parent = %entry.id, source = %sid, "source entry missing"),
                        }
                    }
                    Ok((entry, sources))
                })
                .await?
        };

        if entry.level < 2 {
            return Err(WeaveError::Invalid(format!(
                "cannot regenerate content of a level-{} entry in place",
                entry.level
            )));
        }
        if sources.is_empty() {
            return Err(WeaveError::Invalid(format!("no sources left for entry {entry_id}")));
        }

        let mut sources = sources;
        sources.sort_by_key(|e| e.start_time.unwrap_or(0));

        let (start_time, end_time) = entry_time_range(&sources);
        let total_messages: i64 = sources.iter().map(|e| e.message_count).sum();
        let source_count = sources.len() as i64;

        let context = match (start_time, end_time) {
            (Some(start), Some(end)) => {
                self.pool
                    .interact(move |conn| {
                        episode_context_for_timerange_sync(
                            conn,
                            start,
                            end,
                            CONSOLIDATION_CONTEXT_ENTRIES,
                        )
                    })
                    .await?
            }
            _ => String::new(),
        };
        let prompt = self.consolidation_prompt(&sources, entry.level, &context);

        let mut content: Option<String> = None;
        for attempt in 0..DB_RETRIES {
            match self.llm.generate(vec![ChatMessage::user(prompt.clone())], None).await {
                Ok(response) if !response.trim().is_empty() => {
                    content = Some(response.trim().to_string());
                    break;
                }
                Ok(_) => warn!(entry = %entry.id, attempt = attempt + 1, "empty regeneration response"),
                Err(e) => warn!(entry = %entry.id, attempt = attempt + 1, "regeneration LLM error: {e}"),
            }
            if attempt + 1 < DB_RETRIES {
                tokio::time::sleep(std::time::Duration::from_secs(1 << attempt)).await;
            }
        }
        let Some(content) = content else {
            return Err(LlmError::empty(format!(
                "failed to regenerate content for entry {entry_id}"
            ))
            .into());
        };

        let updated = {
            let entry_id = entry_id.to_string();
            self.persist_with_retry(move |conn| {
                chronicle::update_entry_content_sync(
                    conn,
                    &entry_id,
                    &content,
                    start_time,
                    end_time,
                    total_messages,
                    source_count,
                )?;
                chronicle::get_entry_sync(conn, &entry_id)?
                    .ok_or_else(|| anyhow::anyhow!("entry vanished during regeneration: {entry_id}"))
            })
            .await?
        };

        info!(entry = %updated.id, level = updated.level, messages = total_messages, "regenerated consolidated content");
        Ok(updated)
    }

    /// Integrate a gap-fill level-1 entry into the hierarchy: attach it to
    /// the covering level-2, regenerate that entry in place, and cascade the
    /// regeneration up to the root. A cascade failure stops propagation but
    /// does not roll back earlier regenerations.
    pub async fn integrate_gap_fill(&self, new_entry: &ChronicleEntry) -> Result<Vec<ChronicleEntry>> {
        let mut regenerated: Vec<ChronicleEntry> = Vec::new();

        let (Some(start), Some(end)) = (new_entry.start_time, new_entry.end_time) else {
            warn!(entry = %new_entry.id, "gap-fill entry has no time range, cannot integrate");
            return Ok(regenerated);
        };

        let covering = self
            .pool
            .interact(move |conn| chronicle::find_covering_entry_sync(conn, start, end, 2))
            .await?;
        let Some(covering) = covering else {
            info!(entry = %new_entry.id, "no covering level-2, falling back to normal consolidation");
            return Ok(regenerated);
        };

        let attached = {
            let entry_id = new_entry.id.clone();
            let parent_id = covering.id.clone();
            self.pool
                .interact(move |conn| chronicle::add_to_parent_source_ids_sync(conn, &entry_id, &parent_id))
                .await?
        };
        if !attached {
            warn!(entry = %new_entry.id, covering = %covering.id, "failed to attach gap-fill entry");
            return Ok(regenerated);
        }
        info!(entry = %new_entry.id, covering = %covering.id, "attached gap-fill entry to covering level-2");

        match self.regenerate_consolidated_content(&covering.id).await {
            Ok(regen) => {
                let mut current = regen.clone();
                regenerated.push(regen);

                while let Some(parent_id) = current.parent_id.clone() {
                    info!(parent = %parent_id, level = current.level + 1, "cascade: regenerating parent");
                    match self.regenerate_consolidated_content(&parent_id).await {
                        Ok(parent_regen) => {
                            regenerated.push(parent_regen.clone());
                            current = parent_regen;
                        }
                        Err(e) => {
                            warn!(parent = %parent_id, "cascade regeneration failed, stopping propagation: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(covering = %covering.id, "failed to regenerate covering level-2 after gap-fill: {e}");
            }
        }

        if !regenerated.is_empty() {
            info!(count = regenerated.len(), "gap-fill integration complete");
        }
        Ok(regenerated)
    }

    /// Regenerate a level-1 entry from its original messages, preserving its
    /// membership in the parent.
    pub async fn regenerate_entry(&self, entry_id: &str) -> Result<ChronicleEntry> {
        let entry = {
            let entry_id = entry_id.to_string();
            self.pool
                .interact(move |conn| chronicle::get_entry_sync(conn, &entry_id))
                .await?
        }
        .ok_or_else(|| WeaveError::NotFound(format!("entry not found: {entry_id}")))?;

        if entry.level != 1 {
            return Err(WeaveError::Invalid("only level-1 entries can be regenerated".into()));
        }

        let parent_id = entry.parent_id.clone();
        let source_ids = entry.source_ids.clone();

        let window = {
            let entry_id = entry_id.to_string();
            self.pool
                .interact(move |conn| {
                    chronicle::delete_entry_and_update_parent_sync(conn, &entry_id)?;
                    messages::get_messages_by_ids_sync(conn, &source_ids)
                })
                .await?
        };
        if window.is_empty() {
            return Err(WeaveError::NotFound(format!(
                "no source messages remain for entry {entry_id}"
            )));
        }

        let new_entry = self.generate_level1(&window).await?;

        if let Some(parent_id) = parent_id {
            let child_id = new_entry.id.clone();
            self.pool
                .interact(move |conn| chronicle::add_to_parent_source_ids_sync(conn, &child_id, &parent_id))
                .await?;
            // Re-read so the returned entry carries its parent link.
            let id = new_entry.id.clone();
            return Ok(self
                .pool
                .interact(move |conn| chronicle::get_entry_sync(conn, &id))
                .await?
                .unwrap_or(new_entry));
        }
        Ok(new_entry)
    }

    /// Run a DB write with up to 3 attempts and 1/2/4-second backoff.
    async fn persist_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: Fn(&rusqlite::Connection) -> anyhow::Result<R> + Send + Sync + Clone + 'static,
        R: Send + 'static,
    {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..DB_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(1 << (attempt - 1))).await;
            }
            let f = f.clone();
            match self.pool.interact(move |conn| f(conn)).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(attempt = attempt + 1, "chronicle persistence failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(WeaveError::Anyhow)
            .unwrap_or_else(|| WeaveError::Other("chronicle persistence failed".into())))
    }
}
