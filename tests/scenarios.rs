// tests/scenarios.rs
// End-to-end scenarios over the full engine with fake capabilities

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use weave::WeaveError;
use weave::chronicle::{ChronicleConfig, RunHooks, assemble_episode_context};
use weave::config::Settings;
use weave::db::chronicle as chronicle_db;
use weave::embeddings::{Embedder, FakeEmbedder};
use weave::engine::PersonaMemory;
use weave::error::{LlmError, LlmErrorCode};
use weave::jobs::JobRegistry;
use weave::llm::{FakeLlm, LlmClient};
use weave::recall::RecallParams;

fn test_settings() -> Settings {
    let mut settings = Settings::from_env();
    settings.chunk_min_chars = 0;
    settings.chunk_max_chars = 480;
    settings
}

async fn persona_with(
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LlmClient>>,
) -> Arc<PersonaMemory> {
    PersonaMemory::open_in_memory(
        test_settings(),
        "p1",
        embedder,
        llm,
        Arc::new(JobRegistry::new()),
    )
    .await
    .expect("persona")
}

async fn append(persona: &PersonaMemory, thread: &str, role: &str, content: &str, at: i64) -> String {
    persona
        .messages
        .append_message(thread, role, content, Some("p1"), Some(at), None)
        .await
        .expect("append")
}

fn config(batch_size: usize, consolidation_size: usize) -> ChronicleConfig {
    ChronicleConfig {
        batch_size,
        consolidation_size,
        include_timestamp: true,
        max_messages: None,
    }
}

// ---------------------------------------------------------------------------
// Scenario 1 - basic ingest + recall
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_1_ingest_and_recall() {
    let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::with_concepts(vec![vec![
        "fruit", "apple", "orange", "purchase", "bought",
    ]]));
    let persona = persona_with(Some(embedder), None).await;

    let m1 = append(&persona, "p1:t", "user", "I bought apples at the market", 100).await;
    let m2 = append(&persona, "p1:t", "assistant", "How many?", 101).await;
    let m3 = append(&persona, "p1:t", "user", "Twelve, and some oranges too", 102).await;

    let params = RecallParams {
        thread_id: Some("p1:t".into()),
        topk: 2,
        range_before: 1,
        range_after: 1,
        scope: "thread".into(),
        ..Default::default()
    };
    let result = persona.recall("fruit purchase", &params).await.expect("recall");

    let ids: Vec<&str> = result.iter().map(|m| m.id.as_str()).collect();
    assert!(ids.contains(&m1.as_str()), "message 1 should be recalled");
    assert!(ids.contains(&m3.as_str()), "message 3 should be recalled");
    assert!(ids.contains(&m2.as_str()), "message 2 should be pulled in as a neighbor");

    // Chronological order, no duplicates.
    let times: Vec<i64> = result.iter().map(|m| m.created_at).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
}

// ---------------------------------------------------------------------------
// Scenario 2 - consolidation at the boundary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_2_consolidation_at_boundary() {
    let persona = persona_with(
        Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
        Some(Arc::new(FakeLlm::new()) as Arc<dyn LlmClient>),
    )
    .await;

    for (i, at) in [0i64, 1, 2, 3].iter().enumerate() {
        append(&persona, "p1:t", "user", &format!("event number {i}"), *at).await;
    }

    let outcome = persona.generate_chronicle(config(2, 2)).await.expect("generate");
    assert_eq!(outcome.level1.len(), 2);
    assert_eq!(outcome.consolidated.len(), 1);

    let e1 = &outcome.level1[0];
    let e2 = &outcome.level1[1];
    let e3 = &outcome.consolidated[0];

    assert_eq!(e3.level, 2);
    assert_eq!(e3.source_ids, vec![e1.id.clone(), e2.id.clone()]);
    assert_eq!(e3.message_count, 4);
    assert!(!e3.is_consolidated);

    // Children carry the parent link after the pass.
    let (e1_db, e2_db) = {
        let (a, b) = (e1.id.clone(), e2.id.clone());
        persona
            .pool()
            .interact(move |conn| {
                Ok((
                    chronicle_db::get_entry_sync(conn, &a)?.expect("e1"),
                    chronicle_db::get_entry_sync(conn, &b)?.expect("e2"),
                ))
            })
            .await
            .expect("entries")
    };
    assert!(e1_db.is_consolidated && e2_db.is_consolidated);
    assert_eq!(e1_db.parent_id.as_deref(), Some(e3.id.as_str()));
    assert_eq!(e2_db.parent_id.as_deref(), Some(e3.id.as_str()));
    assert_eq!(e1_db.start_time, Some(0));
    assert_eq!(e1_db.end_time, Some(1));

    // Re-running over already-processed messages creates nothing new.
    let rerun = persona.generate_chronicle(config(2, 2)).await.expect("rerun");
    assert!(rerun.level1.is_empty());
    assert!(rerun.consolidated.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 3 - gap-fill integration with cascade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_3_gap_fill_with_cascade() {
    let persona = persona_with(
        Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
        Some(Arc::new(FakeLlm::new()) as Arc<dyn LlmClient>),
    )
    .await;

    // Round 1: two level-2 blocks (0..30 and 60..90) plus a level-3 above.
    for at in [0i64, 10, 20, 30, 60, 70, 80, 90] {
        append(&persona, "p1:t", "user", &format!("original event at {at}"), at).await;
    }
    let round1 = persona.generate_chronicle(config(2, 2)).await.expect("round 1");
    assert_eq!(round1.level1.len(), 4);
    // Two level-2 consolidations and one level-3 above them.
    let level2: Vec<_> = round1.consolidated.iter().filter(|e| e.level == 2).collect();
    let level3: Vec<_> = round1.consolidated.iter().filter(|e| e.level == 3).collect();
    assert_eq!(level2.len(), 2);
    assert_eq!(level3.len(), 1);
    let e3_id = level2
        .iter()
        .find(|e| e.start_time == Some(0))
        .expect("first block")
        .id
        .clone();
    let top_id = level3[0].id.clone();

    // Round 2: a 2-message run in uncovered territory (40..45): no gap-fill,
    // and too few pending level-1 entries to consolidate.
    for at in [40i64, 45] {
        append(&persona, "p1:t", "user", &format!("later event at {at}"), at).await;
    }
    let round2 = persona.generate_chronicle(config(2, 2)).await.expect("round 2");
    assert_eq!(round2.level1.len(), 1);
    let e5 = &round2.level1[0];
    assert_eq!((e5.start_time, e5.end_time), (Some(40), Some(45)));
    assert!(round2.consolidated.is_empty());
    {
        let id = e5.id.clone();
        let entry = persona
            .pool()
            .interact(move |conn| chronicle_db::get_entry_sync(conn, &id))
            .await
            .expect("query")
            .expect("entry");
        assert!(!entry.is_consolidated);
    }

    // Round 3: messages inside the first block's range trigger gap-fill.
    let before_content = {
        let id = e3_id.clone();
        persona
            .pool()
            .interact(move |conn| chronicle_db::get_entry_sync(conn, &id))
            .await
            .expect("query")
            .expect("entry")
            .content
    };
    for at in [14i64, 16] {
        append(&persona, "p1:t", "user", &format!("forgotten event at {at}"), at).await;
    }
    let round3 = persona.generate_chronicle(config(2, 2)).await.expect("round 3");
    assert_eq!(round3.level1.len(), 1);
    let e6 = &round3.level1[0];
    assert_eq!((e6.start_time, e6.end_time), (Some(14), Some(16)));

    // The covering entry and its parent were regenerated in place.
    let regen_levels: Vec<i64> = round3.consolidated.iter().map(|e| e.level).collect();
    assert_eq!(regen_levels, vec![2, 3]);
    assert_eq!(round3.consolidated[0].id, e3_id, "covering id preserved");
    assert_eq!(round3.consolidated[1].id, top_id, "cascade reaches the root");

    let (e3_db, e6_db, top_db) = {
        let (a, b, c) = (e3_id.clone(), e6.id.clone(), top_id.clone());
        persona
            .pool()
            .interact(move |conn| {
                Ok((
                    chronicle_db::get_entry_sync(conn, &a)?.expect("e3"),
                    chronicle_db::get_entry_sync(conn, &b)?.expect("e6"),
                    chronicle_db::get_entry_sync(conn, &c)?.expect("top"),
                ))
            })
            .await
            .expect("entries")
    };
    assert!(e3_db.source_ids.contains(&e6.id));
    assert_eq!(e3_db.source_ids.len(), 3);
    assert!(e6_db.is_consolidated);
    assert_eq!(e6_db.parent_id.as_deref(), Some(e3_id.as_str()));
    assert_eq!(e3_db.message_count, 6, "two gap-fill messages were absorbed");
    assert_ne!(e3_db.content, before_content, "content regenerated in place");
    assert_eq!(top_db.message_count, 10, "aggregates cascade to the root");
    assert_eq!(
        top_db.message_count,
        e3_db.message_count + 4,
        "parent equals the sum of its children"
    );
}

// ---------------------------------------------------------------------------
// Scenario 4 - reverse-level-promotion context over a generated hierarchy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_4_episode_context_bounds() {
    let persona = persona_with(
        Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
        Some(Arc::new(FakeLlm::new()) as Arc<dyn LlmClient>),
    )
    .await;

    // Ten level-1 entries consolidated into two level-2 blocks.
    for i in 0..20i64 {
        append(&persona, "p1:t", "user", &format!("moment {i}"), i * 10).await;
    }
    let outcome = persona.generate_chronicle(config(2, 5)).await.expect("generate");
    assert_eq!(outcome.level1.len(), 10);
    assert_eq!(outcome.consolidated.len(), 2);

    let context = persona.episode_context(4).await.expect("context");
    assert_eq!(context.len(), 4, "budget is filled exactly");

    // Property F: level non-decreasing walking newest -> oldest.
    let levels: Vec<i64> = context.iter().rev().map(|e| e.level).collect();
    assert!(levels.windows(2).all(|w| w[1] >= w[0]), "levels: {levels:?}");
    // The oldest slot compresses (a level-2 block), the newest keep detail.
    assert_eq!(context[0].level, 2);
    assert_eq!(context[3].level, 1);

    // Property E: no underlying message id covered twice.
    let entries = persona
        .pool()
        .interact(|conn| chronicle_db::get_all_entries_ordered_sync(conn, None))
        .await
        .expect("entries");
    let by_id: std::collections::HashMap<String, _> =
        entries.iter().map(|e| (e.id.clone(), e)).collect();
    let mut covered: Vec<String> = Vec::new();
    for ce in &context {
        let mut stack = vec![ce.source_id.clone()];
        while let Some(id) = stack.pop() {
            match by_id.get(&id) {
                Some(entry) if entry.level == 1 => covered.extend(entry.source_ids.clone()),
                Some(entry) => stack.extend(entry.source_ids.clone()),
                None => covered.push(id),
            }
        }
    }
    let unique: HashSet<&String> = covered.iter().collect();
    assert_eq!(unique.len(), covered.len(), "message ids covered twice");

    // The pure-function variant agrees with the engine path.
    let direct = assemble_episode_context(&entries, 4);
    let direct_ids: Vec<&str> = direct.iter().map(|e| e.source_id.as_str()).collect();
    let engine_ids: Vec<&str> = context.iter().map(|e| e.source_id.as_str()).collect();
    assert_eq!(direct_ids, engine_ids);
}

// ---------------------------------------------------------------------------
// Cancellation and failure surfaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_keeps_partial_results() {
    let persona = persona_with(
        Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
        Some(Arc::new(FakeLlm::new()) as Arc<dyn LlmClient>),
    )
    .await;

    for at in 0..8i64 {
        append(&persona, "p1:t", "user", &format!("event {at}"), at).await;
    }

    let checks = Arc::new(AtomicUsize::new(0));
    let cancel_after = 2; // allow the run check + first batch check
    let hooks = RunHooks {
        cancel: Some({
            let checks = checks.clone();
            Arc::new(move || checks.fetch_add(1, Ordering::SeqCst) + 1 > cancel_after)
        }),
        ..Default::default()
    };

    let generator = persona.chronicle_generator(config(2, 10)).expect("generator");
    let outcome = generator.generate_unprocessed(&hooks).await.expect("generate");
    assert_eq!(outcome.level1.len(), 1, "one batch completed before cancel");

    // The persisted entry survives and is skipped by the next run.
    let rerun = persona.generate_chronicle(config(2, 10)).await.expect("rerun");
    assert_eq!(rerun.level1.len(), 3, "remaining batches are picked up later");
}

#[tokio::test]
async fn batch_hook_sees_every_full_window() {
    struct CountingHook {
        batches: AtomicUsize,
        messages: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl weave::chronicle::BatchHook for CountingHook {
        async fn on_batch(&self, batch: &[weave::db::messages::Message]) {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.messages.fetch_add(batch.len(), Ordering::SeqCst);
        }
    }

    let persona = persona_with(
        Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
        Some(Arc::new(FakeLlm::new()) as Arc<dyn LlmClient>),
    )
    .await;
    // Five messages: two full windows, one dangling message deferred.
    for at in 0..5i64 {
        append(&persona, "p1:t", "user", &format!("event {at}"), at).await;
    }

    let hook = Arc::new(CountingHook {
        batches: AtomicUsize::new(0),
        messages: AtomicUsize::new(0),
    });
    let hooks = RunHooks {
        batch_hook: Some(hook.clone()),
        ..Default::default()
    };
    let generator = persona.chronicle_generator(config(2, 10)).expect("generator");
    let outcome = generator.generate_unprocessed(&hooks).await.expect("generate");

    assert_eq!(outcome.level1.len(), 2);
    assert_eq!(hook.batches.load(Ordering::SeqCst), 2);
    assert_eq!(hook.messages.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn llm_failure_surfaces_batch_metadata() {
    let llm = Arc::new(FakeLlm::with_responses(vec![Err(LlmError::new(
        LlmErrorCode::Timeout,
        "model timed out",
    ))]));
    let persona = persona_with(
        Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
        Some(llm as Arc<dyn LlmClient>),
    )
    .await;

    let mut expected_ids = Vec::new();
    for at in [100i64, 110] {
        expected_ids.push(append(&persona, "p1:t", "user", &format!("event {at}"), at).await);
    }

    let err = persona
        .generate_chronicle(config(2, 10))
        .await
        .expect_err("LLM failure should surface");
    let WeaveError::Llm(llm_err) = err else {
        panic!("expected an LLM error, got {err}");
    };
    assert_eq!(llm_err.code, LlmErrorCode::Timeout);
    let meta = llm_err.batch_meta.expect("batch metadata attached");
    assert_eq!(meta.message_ids, expected_ids);
    assert_eq!((meta.start_time, meta.end_time), (100, 110));

    // Nothing was persisted for the failed batch.
    let processed = persona
        .pool()
        .interact(|conn| chronicle_db::get_processed_message_ids_sync(conn))
        .await
        .expect("processed");
    assert!(processed.is_empty());
}

// ---------------------------------------------------------------------------
// Update round-trip law
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_with_same_content_reembeds_at_full_dimension() {
    let embedder = Arc::new(FakeEmbedder::new(8));
    let persona = persona_with(Some(embedder.clone() as Arc<dyn Embedder>), None).await;

    let id = append(&persona, "p1:t", "user", "stable content", 1).await;
    persona
        .messages
        .update_message_content(&id, "stable content")
        .await
        .expect("no-op update");

    let msg = persona.messages.get_message(&id).await.expect("get").expect("exists");
    assert_eq!(msg.content, "stable content");

    let dims = {
        let id = id.clone();
        persona
            .pool()
            .interact(move |conn| weave::db::messages::get_embedding_dims_sync(conn, &id))
            .await
            .expect("dims")
    };
    assert_eq!(dims, vec![8], "re-embedding yields vectors of dimension D");
}
