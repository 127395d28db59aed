// src/memopedia/generator.rs
// On-demand page generation via a deep-research loop
//
// Iterate: recall relevant messages, expand context around the hits, extract
// knowledge with the LLM, check sufficiency, repeat with fresh queries until
// done. The accumulated notes are then composed into a page and persisted:
// appended to an existing page with the same title, or created under the
// matching category root.

use crate::db::memopedia::{Vividness, ROOT_TERMS};
use crate::db::messages::{self, Message};
use crate::db::pool::DatabasePool;
use crate::embeddings::Embedder;
use crate::error::{Result, WeaveError};
use crate::llm::{ChatMessage, LlmClient, strip_code_fence};
use crate::recall::{RecallParams, semantic_recall_groups};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::{EditRefs, Memopedia, PageUpdate};

const DEFAULT_MAX_LOOPS: usize = 5;
const DEFAULT_CONTEXT_WINDOW: usize = 5;
const RECALL_TOPK: usize = 5;
/// Hits expanded per loop; the rest wait for the next query.
const HITS_PER_LOOP: usize = 3;
/// The model answers this when no further query is worth trying.
const DONE_SENTINEL: &str = "完了";

#[derive(Debug, Clone, Serialize)]
pub struct PageGenerationReport {
    /// "created", "updated", or "error".
    pub action: String,
    pub page_id: Option<String>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub loops_completed: usize,
    pub queries_tried: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    /// Null or empty when the conversation had nothing relevant.
    extracted: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SufficiencyResponse {
    sufficient: bool,
}

#[derive(Debug, Deserialize)]
struct ComposedPage {
    category: String,
    title: String,
    #[serde(default)]
    summary: String,
    content: String,
    #[serde(default)]
    keywords: Vec<String>,
}

fn extract_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "extracted": {"type": ["string", "null"]}
        },
        "required": ["extracted"],
        "additionalProperties": false
    })
}

fn sufficiency_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "sufficient": {"type": "boolean"}
        },
        "required": ["sufficient"],
        "additionalProperties": false
    })
}

fn compose_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "category": {"type": "string", "enum": ["people", "terms", "plans"]},
            "title": {"type": "string"},
            "summary": {"type": "string"},
            "content": {"type": "string"},
            "keywords": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["category", "title", "summary", "content", "keywords"],
        "additionalProperties": false
    })
}

fn format_messages_for_extraction(msgs: &[Message]) -> String {
    msgs.iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("[{}]: {}", m.display_role(), m.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncated(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        text.chars().take(max_chars).collect()
    } else {
        text.to_string()
    }
}

pub struct MemopediaGenerator {
    pool: Arc<DatabasePool>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn Embedder>,
    pub max_loops: usize,
    pub context_window: usize,
    /// Tags a recalled message must carry to join the research corpus.
    pub required_tags: Vec<String>,
}

impl MemopediaGenerator {
    pub fn new(
        pool: Arc<DatabasePool>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            pool,
            llm,
            embedder,
            max_loops: DEFAULT_MAX_LOOPS,
            context_window: DEFAULT_CONTEXT_WINDOW,
            required_tags: Vec::new(),
        }
    }

    /// Research `keyword` and persist the resulting page.
    pub async fn generate_page(
        &self,
        memopedia: &Memopedia,
        keyword: &str,
        directions: Option<&str>,
        category: Option<&str>,
        with_chronicle: bool,
        progress: Option<&(dyn Fn(usize, usize, &str) + Send + Sync)>,
    ) -> Result<PageGenerationReport> {
        let chronicle_context = if with_chronicle {
            let entries = crate::chronicle::get_episode_context(&self.pool, 20).await?;
            truncated(&crate::chronicle::format_episode_context(&entries, true), 3000)
        } else {
            String::new()
        };

        let mut accumulated = String::new();
        let mut processed_ids: HashSet<String> = HashSet::new();
        let mut queries_tried: Vec<String> = Vec::new();
        let mut loops_completed = 0usize;

        for loop_idx in 0..self.max_loops {
            loops_completed = loop_idx + 1;
            if let Some(cb) = progress {
                cb(loops_completed, self.max_loops, "searching");
            }

            let query = if loop_idx == 0 {
                keyword.to_string()
            } else {
                match self.next_query(keyword, &accumulated, &queries_tried).await {
                    Some(q) if !queries_tried.contains(&q) => q,
                    _ => {
                        info!("no new query to try, stopping search");
                        break;
                    }
                }
            };
            queries_tried.push(query.clone());
            info!(loop_idx = loops_completed, query = %query, "memopedia research query");

            let params = RecallParams {
                thread_id: None,
                resource_id: None,
                topk: RECALL_TOPK,
                range_before: 0,
                range_after: 0,
                scope: "all".into(),
                required_tags: self.required_tags.clone(),
                exclude_message_ids: HashSet::new(),
            };
            let groups =
                semantic_recall_groups(&self.pool, &self.embedder, &query, &params).await?;
            let new_ids: Vec<String> = groups
                .iter()
                .map(|g| g.seed.id.clone())
                .filter(|id| !processed_ids.contains(id))
                .collect();
            if new_ids.is_empty() {
                info!("all recalled messages already processed");
                continue;
            }

            // Expand context around the first few fresh hits.
            let window = self.context_window;
            let ids_for_closure: Vec<String> = new_ids.iter().take(HITS_PER_LOOP).cloned().collect();
            let already: HashSet<String> = processed_ids.clone();
            let context_msgs = self
                .pool
                .interact(move |conn| {
                    let mut collected: Vec<Message> = Vec::new();
                    let mut seen = already;
                    for id in &ids_for_closure {
                        seen.insert(id.clone());
                        let Some(anchor) = messages::get_message_sync(conn, id)? else {
                            continue;
                        };
                        let mut bundle =
                            messages::get_messages_around_sync(conn, &anchor, window, window)?;
                        bundle.push(anchor);
                        for msg in bundle {
                            if seen.insert(msg.id.clone()) {
                                collected.push(msg);
                            }
                        }
                    }
                    collected.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
                    Ok(collected)
                })
                .await?;
            for id in new_ids.iter().take(HITS_PER_LOOP) {
                processed_ids.insert(id.clone());
            }
            for msg in &context_msgs {
                processed_ids.insert(msg.id.clone());
            }
            if context_msgs.is_empty() {
                continue;
            }

            let conversation = format_messages_for_extraction(&context_msgs);
            if let Some(extracted) = self
                .extract_knowledge(keyword, directions, &conversation, &accumulated, &chronicle_context)
                .await?
            {
                if accumulated.is_empty() {
                    accumulated = extracted;
                } else {
                    accumulated.push_str("\n\n---\n\n");
                    accumulated.push_str(&extracted);
                }
                info!(chars = accumulated.chars().count(), "accumulated research notes");
            }

            if self.check_sufficiency(keyword, &accumulated).await {
                info!("information sufficient, stopping search");
                break;
            }
        }

        if accumulated.is_empty() {
            return Ok(PageGenerationReport {
                action: "error".into(),
                page_id: None,
                title: None,
                category: None,
                loops_completed,
                queries_tried,
                error: Some("no_info_collected".into()),
            });
        }

        if let Some(cb) = progress {
            cb(self.max_loops, self.max_loops, "composing page");
        }

        let composed = self
            .compose_page(memopedia, keyword, directions, category, &accumulated, &chronicle_context)
            .await?;

        let existing = memopedia
            .find_by_title(&composed.title, Some(&composed.category))
            .await?;
        let report = match existing {
            Some(page) => {
                memopedia
                    .append_to_content(
                        &page.id,
                        &composed.content,
                        EditRefs { source: Some("ai_generation".into()), ..Default::default() },
                    )
                    .await?;
                memopedia
                    .update_page(
                        &page.id,
                        PageUpdate { summary: Some(composed.summary.clone()), ..Default::default() },
                        EditRefs { source: Some("ai_generation".into()), ..Default::default() },
                    )
                    .await?;
                info!(page = %page.id, title = %composed.title, "updated existing page");
                PageGenerationReport {
                    action: "updated".into(),
                    page_id: Some(page.id),
                    title: Some(composed.title),
                    category: Some(composed.category),
                    loops_completed,
                    queries_tried,
                    error: None,
                }
            }
            None => {
                let root = super::root_for_category(&composed.category).unwrap_or(ROOT_TERMS);
                let keywords = if composed.keywords.is_empty() {
                    vec![keyword.to_string()]
                } else {
                    composed.keywords.clone()
                };
                let page = memopedia
                    .create_page(
                        root,
                        &composed.title,
                        &composed.summary,
                        &composed.content,
                        keywords,
                        Vividness::Rough,
                        false,
                        EditRefs { source: Some("ai_generation".into()), ..Default::default() },
                    )
                    .await?;
                info!(page = %page.id, title = %composed.title, "created new page");
                PageGenerationReport {
                    action: "created".into(),
                    page_id: Some(page.id),
                    title: Some(composed.title),
                    category: Some(composed.category),
                    loops_completed,
                    queries_tried,
                    error: None,
                }
            }
        };
        Ok(report)
    }

    /// Ask for the next search query; None ends the loop.
    async fn next_query(
        &self,
        keyword: &str,
        accumulated: &str,
        queries_tried: &[String],
    ) -> Option<String> {
        let tried = if queries_tried.is_empty() {
            "(なし)".to_string()
        } else {
            queries_tried.iter().map(|q| format!("- {q}")).collect::<Vec<_>>().join("\n")
        };
        let prompt = format!(
            "トピック「{keyword}」について情報を集めています。\n\n\
             これまで試したクエリ:\n{tried}\n\n\
             収集済み情報:\n{}\n\n\
             上記を踏まえて、まだ足りない情報を探すための新しい検索クエリを1つ提案してください。\n\
             既に試したクエリと重複しないものにしてください。\n\
             これ以上探す必要がなければ「{DONE_SENTINEL}」と答えてください。\n\n\
             クエリのみを返してください（説明不要）。",
            if accumulated.is_empty() { "(まだなし)".to_string() } else { truncated(accumulated, 2000) },
        );

        match self.llm.generate(vec![ChatMessage::user(prompt)], None).await {
            Ok(response) => {
                let query = response.trim().trim_matches(['"', '\'']).to_string();
                if query.is_empty() || query == DONE_SENTINEL || query.chars().count() > 100 {
                    None
                } else {
                    Some(query)
                }
            }
            Err(e) => {
                warn!("failed to build next query: {e}");
                None
            }
        }
    }

    async fn extract_knowledge(
        &self,
        keyword: &str,
        directions: Option<&str>,
        conversation: &str,
        accumulated: &str,
        chronicle_context: &str,
    ) -> Result<Option<String>> {
        let directions_section = directions
            .map(|d| format!("\n=== 調査の方向性 ===\n{d}\n"))
            .unwrap_or_default();
        let chronicle_section = if chronicle_context.is_empty() {
            String::new()
        } else {
            format!("\n=== これまでの出来事の流れ（参考） ===\n{}\n", truncated(chronicle_context, 1500))
        };
        let prompt = format!(
            "以下の会話から「{keyword}」に関する情報を抽出してください。\n\
             {directions_section}{chronicle_section}\
             === 会話 ===\n{conversation}\n\n\
             === これまでに集めた情報 ===\n{}\n\n\
             【指示】\n\
             - 「{keyword}」に直接関連する情報のみを抽出\n\
             - 既に集めた情報と重複する内容は省略\n\
             - 事実、定義、特徴、関連する出来事などを箇条書きまたは短い段落で記述\n\
             - 関連情報がなければ extracted を null にする",
            if accumulated.is_empty() { "(なし)".to_string() } else { truncated(accumulated, 1500) },
        );

        let response = match self
            .llm
            .generate(vec![ChatMessage::user(prompt)], Some(extract_schema()))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("knowledge extraction failed: {e}");
                return Ok(None);
            }
        };
        let parsed: ExtractResponse = match serde_json::from_str(strip_code_fence(&response)) {
            Ok(p) => p,
            Err(e) => {
                warn!("unparseable extraction response: {e}");
                return Ok(None);
            }
        };
        Ok(parsed
            .extracted
            .filter(|text| !text.trim().is_empty() && text.trim().chars().count() >= 20))
    }

    async fn check_sufficiency(&self, keyword: &str, accumulated: &str) -> bool {
        if accumulated.chars().count() < 100 {
            return false;
        }
        let prompt = format!(
            "トピック「{keyword}」について以下の情報が集まっています。\n\n{accumulated}\n\n\
             この情報量で「{keyword}」についてのページを作成するのに十分ですか？"
        );
        match self
            .llm
            .generate(vec![ChatMessage::user(prompt)], Some(sufficiency_schema()))
            .await
        {
            Ok(response) => serde_json::from_str::<SufficiencyResponse>(strip_code_fence(&response))
                .map(|r| r.sufficient)
                .unwrap_or(false),
            // Fallback heuristic when the model is unavailable.
            Err(_) => accumulated.chars().count() > 500,
        }
    }

    async fn compose_page(
        &self,
        memopedia: &Memopedia,
        keyword: &str,
        directions: Option<&str>,
        category: Option<&str>,
        accumulated: &str,
        chronicle_context: &str,
    ) -> Result<ComposedPage> {
        let existing_pages = memopedia.get_tree_markdown(None, false, false).await?;
        let category_hint = match category {
            Some(cat) => format!("カテゴリは「{cat}」を使用してください。"),
            None => "適切なカテゴリ（people=人物、terms=用語・概念、plans=計画・予定）を選んでください。".to_string(),
        };
        let directions_section = directions
            .map(|d| format!("\n=== 調査の方向性・まとめ方 ===\n{d}\n"))
            .unwrap_or_default();
        let chronicle_section = if chronicle_context.is_empty() {
            String::new()
        } else {
            format!("\n=== 参考：これまでの出来事の流れ ===\n{}\n", truncated(chronicle_context, 1500))
        };

        let prompt = format!(
            "以下の情報を元に「{keyword}」についてのMemopediaページを作成してください。\n\
             {directions_section}{chronicle_section}\
             === 収集した情報 ===\n{accumulated}\n\n\
             === 既存ページ一覧 ===\n{}\n\n\
             【指示】\n\
             - {category_hint}\n\
             - タイトルは簡潔に（キーワードそのまま、または少し補足）\n\
             - 要約は1-2文で\n\
             - 本文は収集した情報を整理して読みやすく構成\n\
             - キーワード（検索用）を3-5個",
            if existing_pages.is_empty() { "(なし)".to_string() } else { truncated(&existing_pages, 2000) },
        );

        let response = self
            .llm
            .generate(vec![ChatMessage::user(prompt)], Some(compose_schema()))
            .await?;
        let mut composed: ComposedPage = serde_json::from_str(strip_code_fence(&response))
            .map_err(|e| WeaveError::Invalid(format!("unparseable page composition: {e}")))?;

        // A caller-pinned category overrides whatever the model chose.
        if let Some(cat) = category {
            composed.category = cat.to_string();
        }
        if super::root_for_category(&composed.category).is_none() {
            composed.category = "terms".to_string();
        }
        Ok(composed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::FakeEmbedder;
    use crate::llm::FakeLlm;
    use crate::messages::MessageStore;

    fn compose_json(title: &str, category: &str, content: &str) -> String {
        serde_json::json!({
            "category": category,
            "title": title,
            "summary": "short summary",
            "content": content,
            "keywords": ["k1", "k2"],
        })
        .to_string()
    }

    async fn research_world() -> (Arc<DatabasePool>, Memopedia, Arc<FakeEmbedder>) {
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let memopedia = Memopedia::new(pool.clone());
        let embedder = Arc::new(FakeEmbedder::with_concepts(vec![vec!["ramen", "noodle"]]));
        let store = MessageStore::new(
            pool.clone(),
            Some(embedder.clone() as Arc<dyn Embedder>),
            0,
            480,
        );
        store
            .append_message("p:t", "user", "we tried the new ramen shop", None, Some(10), None)
            .await
            .expect("m1");
        store
            .append_message("p:t", "assistant", "the noodle broth was rich", None, Some(11), None)
            .await
            .expect("m2");
        (pool, memopedia, embedder)
    }

    #[tokio::test]
    async fn creates_page_under_category_root() {
        let (pool, memopedia, embedder) = research_world().await;

        let llm = Arc::new(FakeLlm::with_responses(vec![
            // extract
            Ok(serde_json::json!({"extracted": "駅前に新しくできたラーメン屋を二人で訪れた。スープは豚骨ベースでとても濃厚、麺は細めの縮れ麺だったという感想が残っている。店内は狭いが活気があり、行列ができるほどの人気で、再訪したいという話になった。次回はつけ麺を試す予定。"}).to_string()),
            // sufficiency
            Ok(serde_json::json!({"sufficient": true}).to_string()),
            // compose
            Ok(compose_json("ラーメン屋", "terms", "新しいラーメン屋の記録")),
        ]));

        let generator = MemopediaGenerator::new(
            pool,
            llm.clone() as Arc<dyn LlmClient>,
            embedder as Arc<dyn Embedder>,
        );
        let report = generator
            .generate_page(&memopedia, "ramen", None, None, false, None)
            .await
            .expect("generate");

        assert_eq!(report.action, "created");
        let page = memopedia
            .find_by_title("ラーメン屋", Some("terms"))
            .await
            .expect("find")
            .expect("page");
        assert_eq!(page.parent_id.as_deref(), Some(ROOT_TERMS));
        assert_eq!(page.content, "新しいラーメン屋の記録");
        assert_eq!(report.queries_tried, vec!["ramen"]);
    }

    #[tokio::test]
    async fn appends_to_existing_page_with_same_title() {
        let (pool, memopedia, embedder) = research_world().await;
        memopedia
            .create_page(
                ROOT_TERMS,
                "ラーメン屋",
                "old summary",
                "最初の訪問。",
                vec![],
                Vividness::Rough,
                false,
                EditRefs::default(),
            )
            .await
            .expect("existing");

        let llm = Arc::new(FakeLlm::with_responses(vec![
            Ok(serde_json::json!({"extracted": "二度目の訪問ではつけ麺を注文し、前回のラーメンよりも気に入った様子だった。スープ割りまで頼んで完食し、店主と常連らしい会話も交わしていた。月に一度は通いたいという話になり、次回は友人も誘う計画を立てていた。"}).to_string()),
            Ok(serde_json::json!({"sufficient": true}).to_string()),
            Ok(compose_json("ラーメン屋", "terms", "二度目の訪問の記録")),
        ]));

        let generator = MemopediaGenerator::new(
            pool,
            llm as Arc<dyn LlmClient>,
            embedder as Arc<dyn Embedder>,
        );
        let report = generator
            .generate_page(&memopedia, "ramen", None, Some("terms"), false, None)
            .await
            .expect("generate");

        assert_eq!(report.action, "updated");
        let page = memopedia
            .find_by_title("ラーメン屋", Some("terms"))
            .await
            .expect("find")
            .expect("page");
        assert!(page.content.starts_with("最初の訪問。"));
        assert!(page.content.contains("二度目の訪問の記録"));
        assert_eq!(page.summary, "short summary");
    }

    #[tokio::test]
    async fn reports_error_when_nothing_is_collected() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let memopedia = Memopedia::new(pool.clone());
        let embedder = Arc::new(FakeEmbedder::new(8));
        // Extraction always comes back empty; next-query always says done.
        let llm = Arc::new(FakeLlm::with_responses(vec![
            Ok(serde_json::json!({"extracted": null}).to_string()),
            Ok(DONE_SENTINEL.to_string()),
        ]));

        let generator = MemopediaGenerator::new(
            pool,
            llm as Arc<dyn LlmClient>,
            embedder as Arc<dyn Embedder>,
        );
        let report = generator
            .generate_page(&memopedia, "nothing", None, None, false, None)
            .await
            .expect("generate");

        assert_eq!(report.action, "error");
        assert_eq!(report.error.as_deref(), Some("no_info_collected"));
    }
}
