// src/chronicle/estimate.rs
// Read-only cost estimate for a chronicle generation run

use crate::db::chronicle;
use crate::db::messages;
use crate::db::pool::DatabasePool;
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;

use super::generator::ChronicleConfig;

/// Rough CJK/English character-per-token ratio. Tunable, not an invariant.
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Expected output tokens per summary call (a 3-5 sentence summary).
const DEFAULT_OUTPUT_TOKENS_PER_CALL: f64 = 400.0;

/// Fallback when no prior entries exist to average over.
const DEFAULT_ENTRY_TOKENS: f64 = 50.0;

/// USD per million tokens (input, output) for known models.
fn pricing_for(model: &str) -> (f64, f64) {
    let lower = model.to_lowercase();
    if lower.contains("gpt-5") {
        (1.25, 10.0)
    } else if lower.contains("gpt-4o-mini") {
        (0.15, 0.6)
    } else if lower.contains("gpt-4o") {
        (2.5, 10.0)
    } else if lower.contains("gemini") && lower.contains("flash") {
        (0.15, 0.6)
    } else if lower.contains("gemini") {
        (1.25, 10.0)
    } else if lower.contains("deepseek") {
        (0.27, 1.1)
    } else {
        // Local / unknown models cost nothing.
        (0.0, 0.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub unprocessed_messages: usize,
    /// Messages in runs long enough to process.
    pub qualifying_messages: usize,
    /// Deferred: stuck in runs shorter than batch_size.
    pub isolated_messages: usize,
    pub projected_level1_calls: usize,
    pub projected_consolidation_calls: usize,
    pub projected_llm_calls: usize,
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub model: String,
    pub chars_per_token: f64,
}

/// Estimate the work a `generate_unprocessed` run would do right now.
///
/// `memopedia_brief_chars` adds per-call prompt overhead when the brief is
/// injected. `chars_per_token` overrides the default ratio.
pub async fn estimate_generation_cost(
    pool: &Arc<DatabasePool>,
    config: &ChronicleConfig,
    model: &str,
    memopedia_brief_chars: usize,
    chars_per_token: Option<f64>,
) -> Result<CostEstimate> {
    let config = *config;
    let (run_lengths, run_chars, avg_entry_chars, pending_l1) = pool
        .interact(move |conn| {
            let all = messages::get_all_messages_ordered_sync(conn)?;
            let processed = chronicle::get_processed_message_ids_sync(conn)?;

            let mut run_lengths: Vec<usize> = Vec::new();
            let mut run_chars: Vec<usize> = Vec::new();
            let mut current_len = 0usize;
            let mut current_chars = 0usize;
            for msg in &all {
                if processed.contains(&msg.id) {
                    if current_len > 0 {
                        run_lengths.push(current_len);
                        run_chars.push(current_chars);
                        current_len = 0;
                        current_chars = 0;
                    }
                    continue;
                }
                current_len += 1;
                current_chars += msg.content.chars().count();
            }
            if current_len > 0 {
                run_lengths.push(current_len);
                run_chars.push(current_chars);
            }

            let level1 = chronicle::get_entries_by_level_sync(conn, 1)?;
            let avg_entry_chars = if level1.is_empty() {
                None
            } else {
                Some(
                    level1.iter().map(|e| e.content.chars().count()).sum::<usize>() as f64
                        / level1.len() as f64,
                )
            };
            let pending_l1 = chronicle::get_unconsolidated_entries_sync(conn, 1)?.len();

            Ok((run_lengths, run_chars, avg_entry_chars, pending_l1))
        })
        .await?;

    let ratio = chars_per_token.unwrap_or(CHARS_PER_TOKEN);
    let unprocessed: usize = run_lengths.iter().sum();

    let mut qualifying_messages = 0usize;
    let mut qualifying_chars = 0usize;
    let mut level1_calls = 0usize;
    for (len, chars) in run_lengths.iter().zip(&run_chars) {
        if *len >= config.batch_size {
            let full_windows = len / config.batch_size;
            level1_calls += full_windows;
            let covered = full_windows * config.batch_size;
            qualifying_messages += covered;
            // Trailing incomplete window is dropped; scale chars accordingly.
            qualifying_chars += (*chars as f64 * covered as f64 / *len as f64) as usize;
        }
    }

    // New level-1 entries join the pending pool; each consolidation batch at
    // any level removes `consolidation_size` entries and adds one above,
    // which sums to roughly n/(size-1) calls overall.
    let pool_size = pending_l1 + level1_calls;
    let projected_consolidation_calls = if config.consolidation_size > 1 {
        pool_size / (config.consolidation_size - 1)
    } else {
        0
    };

    let avg_entry_tokens = avg_entry_chars
        .map(|chars| chars / ratio)
        .unwrap_or(DEFAULT_ENTRY_TOKENS);

    // Level-1 input: the window text plus past-context and Memopedia brief.
    let context_tokens_per_call = 20.0 * avg_entry_tokens;
    let brief_tokens = memopedia_brief_chars as f64 / ratio;
    let level1_input = qualifying_chars as f64 / ratio
        + level1_calls as f64 * (context_tokens_per_call + brief_tokens);
    // Consolidation input: consolidation_size child summaries plus context.
    let consolidation_input = projected_consolidation_calls as f64
        * (config.consolidation_size as f64 * avg_entry_tokens + 10.0 * avg_entry_tokens);

    let total_calls = level1_calls + projected_consolidation_calls;
    let input_tokens = level1_input + consolidation_input;
    let output_tokens = total_calls as f64 * DEFAULT_OUTPUT_TOKENS_PER_CALL;

    let (input_price, output_price) = pricing_for(model);
    let cost = (input_tokens * input_price + output_tokens * output_price) / 1_000_000.0;

    Ok(CostEstimate {
        unprocessed_messages: unprocessed,
        qualifying_messages,
        isolated_messages: unprocessed - qualifying_messages,
        projected_level1_calls: level1_calls,
        projected_consolidation_calls,
        projected_llm_calls: total_calls,
        estimated_input_tokens: input_tokens.round() as u64,
        estimated_output_tokens: output_tokens.round() as u64,
        estimated_cost_usd: (cost * 1_000_000.0).round() / 1_000_000.0,
        model: model.to_string(),
        chars_per_token: ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::DatabasePool;

    #[tokio::test]
    async fn counts_runs_and_projects_calls() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        pool.interact(|conn| {
            messages::get_or_create_thread_sync(conn, "p:t", None)?;
            for i in 0..7 {
                messages::insert_message_sync(
                    conn,
                    &format!("m{i}"),
                    "p:t",
                    "user",
                    "hello world",
                    None,
                    i,
                    &serde_json::Value::Null,
                )?;
            }
            // m2 already processed: splits [m0,m1] and [m3..m6]
            chronicle::create_entry_sync(conn, 1, "done", &["m2".into()], Some(2), Some(2), 1, 1)?;
            Ok(())
        })
        .await
        .expect("seed");

        let config = ChronicleConfig {
            batch_size: 2,
            consolidation_size: 10,
            include_timestamp: true,
            max_messages: None,
        };
        let estimate = estimate_generation_cost(&pool, &config, "local-model", 0, None)
            .await
            .expect("estimate");

        assert_eq!(estimate.unprocessed_messages, 6);
        // run [m0,m1] -> 1 window; run [m3..m6] -> 2 windows
        assert_eq!(estimate.projected_level1_calls, 3);
        assert_eq!(estimate.qualifying_messages, 6);
        assert_eq!(estimate.isolated_messages, 0);
        assert_eq!(estimate.estimated_cost_usd, 0.0);
        assert!(estimate.estimated_input_tokens > 0);
    }

    #[tokio::test]
    async fn short_runs_are_isolated() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        pool.interact(|conn| {
            messages::get_or_create_thread_sync(conn, "p:t", None)?;
            for i in 0..3 {
                messages::insert_message_sync(
                    conn,
                    &format!("m{i}"),
                    "p:t",
                    "user",
                    "hi",
                    None,
                    i,
                    &serde_json::Value::Null,
                )?;
            }
            Ok(())
        })
        .await
        .expect("seed");

        let config = ChronicleConfig {
            batch_size: 20,
            ..Default::default()
        };
        let estimate = estimate_generation_cost(&pool, &config, "gpt-5", 0, None)
            .await
            .expect("estimate");

        assert_eq!(estimate.unprocessed_messages, 3);
        assert_eq!(estimate.qualifying_messages, 0);
        assert_eq!(estimate.isolated_messages, 3);
        assert_eq!(estimate.projected_llm_calls, 0);
    }

    #[test]
    fn unknown_models_are_free() {
        assert_eq!(pricing_for("llama3.3"), (0.0, 0.0));
        assert!(pricing_for("gpt-5").0 > 0.0);
    }
}
