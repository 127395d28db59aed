// src/engine.rs
// Per-persona engine facade and the process-wide engine root
//
// PersonaMemory wires one persona's pool, capabilities, and subsystem
// handles together. WeaveEngine owns the shared pieces (settings, embedder
// cache, job registry) and opens personas on demand; it also backs the URI
// resolver's persona directory.

use crate::backup::{BackupReport, BackupStrategy, run_backup};
use crate::chronicle::{
    ChronicleConfig, ChronicleGenerator, ContextEntry, CostEstimate, GenerationOutcome, RunHooks,
    estimate_generation_cost, get_episode_context,
};
use crate::chunker::chunk_text;
use crate::config::Settings;
use crate::db::messages as db_messages;
use crate::db::pool::DatabasePool;
use crate::embeddings::{Embedder, EmbedderCache};
use crate::error::{Result, WeaveError};
use crate::jobs::{JobKind, JobRegistry};
use crate::llm::LlmClient;
use crate::memopedia::{Memopedia, MemopediaGenerator};
use crate::messages::MessageStore;
use crate::recall::{RecallGroup, RecallParams, semantic_recall, semantic_recall_groups};
use crate::uri::PersonaDirectory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Authoritative active-thread selector stored next to the database.
#[derive(Debug, Serialize, Deserialize, Default)]
struct ActiveState {
    active_thread_id: Option<String>,
}

/// Outcome of a re-embed pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReembedReport {
    pub checked: usize,
    pub reembedded: usize,
    pub skipped_errors: usize,
}

/// One persona's memory engine.
pub struct PersonaMemory {
    pub persona_id: String,
    settings: Settings,
    pool: Arc<DatabasePool>,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LlmClient>>,
    pub messages: MessageStore,
    pub memopedia: Memopedia,
    jobs: Arc<JobRegistry>,
}

impl PersonaMemory {
    /// Open (or create) the persona's database and wire the subsystems.
    pub async fn open(
        settings: Settings,
        persona_id: &str,
        embedder: Option<Arc<dyn Embedder>>,
        llm: Option<Arc<dyn LlmClient>>,
        jobs: Arc<JobRegistry>,
    ) -> Result<Arc<Self>> {
        let db_path = settings.memory_db_path(persona_id);
        let pool = Arc::new(DatabasePool::open(&db_path).await?);
        Ok(Self::wire(settings, persona_id, pool, embedder, llm, jobs))
    }

    /// In-memory variant for tests.
    pub async fn open_in_memory(
        settings: Settings,
        persona_id: &str,
        embedder: Option<Arc<dyn Embedder>>,
        llm: Option<Arc<dyn LlmClient>>,
        jobs: Arc<JobRegistry>,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(DatabasePool::open_in_memory().await?);
        Ok(Self::wire(settings, persona_id, pool, embedder, llm, jobs))
    }

    fn wire(
        settings: Settings,
        persona_id: &str,
        pool: Arc<DatabasePool>,
        embedder: Option<Arc<dyn Embedder>>,
        llm: Option<Arc<dyn LlmClient>>,
        jobs: Arc<JobRegistry>,
    ) -> Arc<Self> {
        let messages = MessageStore::new(
            pool.clone(),
            embedder.clone(),
            settings.chunk_min_chars,
            settings.chunk_max_chars,
        );
        let memopedia = Memopedia::new(pool.clone());
        Arc::new(Self {
            persona_id: persona_id.to_string(),
            settings,
            pool,
            embedder,
            llm,
            messages,
            memopedia,
            jobs,
        })
    }

    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    fn embedder_or_err(&self) -> Result<Arc<dyn Embedder>> {
        self.embedder
            .clone()
            .ok_or_else(|| WeaveError::Config("no embedding model configured".into()))
    }

    fn llm_or_err(&self) -> Result<Arc<dyn LlmClient>> {
        self.llm
            .clone()
            .ok_or_else(|| WeaveError::Config("no LLM client configured".into()))
    }

    // ----- Active thread state -----

    fn active_state_path(&self) -> std::path::PathBuf {
        self.settings.persona_dir(&self.persona_id).join("active_state.json")
    }

    /// The active thread suffix from active_state.json, defaulting to the
    /// persona's private thread.
    pub fn active_thread_suffix(&self) -> String {
        let state: ActiveState = std::fs::read_to_string(self.active_state_path())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        state
            .active_thread_id
            .unwrap_or_else(|| crate::messages::PERSONA_THREAD_SUFFIX.to_string())
    }

    pub fn set_active_thread_suffix(&self, suffix: &str) -> Result<()> {
        let path = self.active_state_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = ActiveState {
            active_thread_id: Some(suffix.to_string()),
        };
        std::fs::write(path, serde_json::to_string_pretty(&state)?)?;
        Ok(())
    }

    /// Full thread id for a suffix (None = active thread).
    pub fn thread_id(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}:{suffix}", self.persona_id),
            None => format!("{}:{}", self.persona_id, self.active_thread_suffix()),
        }
    }

    /// Thread summaries with the active flag stamped from active_state.json.
    pub async fn thread_summaries(&self) -> Result<Vec<db_messages::ThreadSummary>> {
        let active = self.active_thread_suffix();
        let mut summaries = self.messages.list_thread_summaries(&self.persona_id).await?;
        for summary in &mut summaries {
            summary.is_active = summary.suffix == active;
        }
        Ok(summaries)
    }

    // ----- Recall -----

    pub async fn recall(&self, query: &str, params: &RecallParams) -> Result<Vec<db_messages::Message>> {
        let embedder = self.embedder_or_err()?;
        semantic_recall(&self.pool, &embedder, query, params).await
    }

    pub async fn recall_groups(&self, query: &str, params: &RecallParams) -> Result<Vec<RecallGroup>> {
        let embedder = self.embedder_or_err()?;
        semantic_recall_groups(&self.pool, &embedder, query, params).await
    }

    /// Recall defaults from settings, scoped to the active thread.
    pub fn default_recall_params(&self) -> RecallParams {
        RecallParams {
            thread_id: Some(self.thread_id(None)),
            resource_id: Some(self.persona_id.clone()),
            topk: self.settings.topk,
            range_before: self.settings.range_before,
            range_after: self.settings.range_after,
            scope: self.settings.scope.clone(),
            ..Default::default()
        }
    }

    // ----- Chronicle -----

    pub fn chronicle_generator(&self, config: ChronicleConfig) -> Result<ChronicleGenerator> {
        Ok(ChronicleGenerator::new(self.pool.clone(), self.llm_or_err()?, config))
    }

    pub async fn episode_context(&self, max_entries: usize) -> Result<Vec<ContextEntry>> {
        get_episode_context(&self.pool, max_entries).await
    }

    pub async fn chronicle_cost_estimate(
        &self,
        config: &ChronicleConfig,
        with_memopedia: bool,
    ) -> Result<CostEstimate> {
        let model = self
            .llm
            .as_ref()
            .map(|llm| llm.model_name())
            .unwrap_or_else(|| self.settings.llm_model.clone());
        let brief_chars = if with_memopedia {
            self.memopedia.brief(2000).await?.chars().count()
        } else {
            0
        };
        estimate_generation_cost(&self.pool, config, &model, brief_chars, None).await
    }

    /// Spawn a background chronicle generation job; returns its id.
    pub async fn start_chronicle_job(
        self: &Arc<Self>,
        config: ChronicleConfig,
        with_memopedia: bool,
    ) -> Result<String> {
        let llm = self.llm_or_err()?;
        let job_id = self.jobs.create(&self.persona_id, JobKind::ChronicleGen);
        let engine = self.clone();
        let job_for_task = job_id.clone();

        tokio::spawn(async move {
            let jobs = engine.jobs.clone();
            jobs.set_running(&job_for_task, "Loading database...");

            let memopedia_context = if with_memopedia {
                match engine.memopedia.brief(2000).await {
                    Ok(brief) if !brief.trim().is_empty() => Some(brief),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(job = %job_for_task, "memopedia brief failed: {e}");
                        None
                    }
                }
            } else {
                None
            };

            let generator = ChronicleGenerator::new(engine.pool.clone(), llm, config)
                .with_memopedia_context(memopedia_context);

            let hooks = RunHooks {
                progress: Some({
                    let jobs = jobs.clone();
                    let job_id = job_for_task.clone();
                    Arc::new(move |processed, total| jobs.set_progress(&job_id, processed, total))
                }),
                cancel: Some({
                    let jobs = jobs.clone();
                    let job_id = job_for_task.clone();
                    Arc::new(move || jobs.is_cancelling(&job_id))
                }),
                batch_hook: None,
            };

            match generator.generate_unprocessed(&hooks).await {
                Ok(outcome) => {
                    let created = outcome.level1.len() + outcome.consolidated.len();
                    if jobs.is_cancelling(&job_for_task) {
                        jobs.mark_cancelled(&job_for_task, created);
                    } else {
                        jobs.mark_completed(
                            &job_for_task,
                            created,
                            &format!(
                                "Created {} level-1 and {} consolidated entries",
                                outcome.level1.len(),
                                outcome.consolidated.len()
                            ),
                        );
                    }
                }
                Err(e) => jobs.mark_failed(&job_for_task, &e),
            }
        });

        Ok(job_id)
    }

    /// Run chronicle generation inline (CLI path).
    pub async fn generate_chronicle(&self, config: ChronicleConfig) -> Result<GenerationOutcome> {
        let generator = self.chronicle_generator(config)?;
        generator.generate_unprocessed(&RunHooks::default()).await
    }

    // ----- Memopedia generation -----

    pub async fn start_memopedia_job(
        self: &Arc<Self>,
        keyword: String,
        directions: Option<String>,
        category: Option<String>,
    ) -> Result<String> {
        let llm = self.llm_or_err()?;
        let embedder = self.embedder_or_err()?;
        let job_id = self.jobs.create(&self.persona_id, JobKind::MemopediaGen);
        let engine = self.clone();
        let job_for_task = job_id.clone();

        tokio::spawn(async move {
            let jobs = engine.jobs.clone();
            jobs.set_running(&job_for_task, &format!("Researching {keyword}..."));

            let generator = MemopediaGenerator::new(engine.pool.clone(), llm, embedder);
            let progress = {
                let jobs = jobs.clone();
                let job_id = job_for_task.clone();
                move |done: usize, total: usize, _label: &str| jobs.set_progress(&job_id, done, total)
            };
            match generator
                .generate_page(
                    &engine.memopedia,
                    &keyword,
                    directions.as_deref(),
                    category.as_deref(),
                    true,
                    Some(&progress),
                )
                .await
            {
                Ok(report) if report.action == "error" => {
                    jobs.update(&job_for_task, |job| {
                        job.status = crate::jobs::JobStatus::Failed;
                        job.error = report.error.clone();
                        job.error_code = report.error.clone();
                    });
                }
                Ok(report) => {
                    jobs.mark_completed(
                        &job_for_task,
                        1,
                        &format!("{} page {}", report.action, report.title.unwrap_or_default()),
                    );
                }
                Err(e) => jobs.mark_failed(&job_for_task, &e),
            }
        });

        Ok(job_id)
    }

    // ----- Re-embed -----

    /// Verify and repair message embeddings.
    ///
    /// A message needs re-embedding when its chunk count differs from what
    /// the chunker produces for its content, or any stored vector has the
    /// wrong dimension. One bad row never stops the pass.
    pub async fn reembed(&self, force: bool, cancel: Option<&(dyn Fn() -> bool + Sync)>) -> Result<ReembedReport> {
        let embedder = self.embedder_or_err()?;
        let dim = embedder.dim();
        let (chunk_min, chunk_max) =
            (self.settings.chunk_min_chars, self.settings.chunk_max_chars);

        let candidates = self
            .pool
            .interact(|conn| db_messages::get_all_messages_ordered_sync(conn))
            .await?;

        let mut report = ReembedReport::default();
        for msg in candidates {
            if cancel.is_some_and(|f| f()) {
                info!("re-embed cancelled");
                break;
            }
            if msg.content.trim().is_empty() || msg.embedding_disabled() {
                continue;
            }
            report.checked += 1;

            let chunks = chunk_text(&msg.content, chunk_min, chunk_max);
            let needs = if force {
                true
            } else {
                let msg_id = msg.id.clone();
                let dims = self
                    .pool
                    .interact(move |conn| db_messages::get_embedding_dims_sync(conn, &msg_id))
                    .await?;
                dims.len() != chunks.len() || dims.iter().any(|&d| d != dim)
            };
            if !needs {
                continue;
            }

            let vectors = match embedder.embed(&chunks, false).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(message_id = %msg.id, "re-embed failed for one message, continuing: {e}");
                    report.skipped_errors += 1;
                    continue;
                }
            };
            let msg_id = msg.id.clone();
            if let Err(e) = self
                .pool
                .interact(move |conn| {
                    db_messages::replace_message_embeddings_sync(conn, &msg_id, &vectors)
                })
                .await
            {
                warn!(message_id = %msg.id, "failed to store re-embedded chunks: {e}");
                report.skipped_errors += 1;
                continue;
            }
            report.reembedded += 1;
        }
        Ok(report)
    }

    pub async fn start_reembed_job(self: &Arc<Self>, force: bool) -> Result<String> {
        self.embedder_or_err()?;
        let job_id = self.jobs.create(&self.persona_id, JobKind::Reembed);
        let engine = self.clone();
        let job_for_task = job_id.clone();

        tokio::spawn(async move {
            let jobs = engine.jobs.clone();
            jobs.set_running(&job_for_task, "Re-embedding messages...");
            let cancel = {
                let jobs = jobs.clone();
                let job_id = job_for_task.clone();
                move || jobs.is_cancelling(&job_id)
            };
            match engine.reembed(force, Some(&cancel)).await {
                Ok(report) => {
                    if jobs.is_cancelling(&job_for_task) {
                        jobs.mark_cancelled(&job_for_task, report.reembedded);
                    } else {
                        jobs.mark_completed(
                            &job_for_task,
                            report.reembedded,
                            &format!(
                                "Checked {}, re-embedded {}, skipped {} errors",
                                report.checked, report.reembedded, report.skipped_errors
                            ),
                        );
                    }
                }
                Err(e) => jobs.mark_failed(&job_for_task, &e),
            }
        });

        Ok(job_id)
    }

    // ----- Backup -----

    pub async fn backup(&self, strategy: BackupStrategy) -> Result<BackupReport> {
        run_backup(&self.settings, &self.persona_id, &self.pool, strategy).await
    }
}

/// Process-wide engine root: shared capabilities plus the open personas.
pub struct WeaveEngine {
    pub settings: Settings,
    embedder_cache: EmbedderCache,
    llm: Option<Arc<dyn LlmClient>>,
    pub jobs: Arc<JobRegistry>,
    personas: Mutex<HashMap<String, Arc<PersonaMemory>>>,
}

impl WeaveEngine {
    pub fn new(settings: Settings, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            settings,
            embedder_cache: EmbedderCache::new(),
            llm,
            jobs: Arc::new(JobRegistry::new()),
            personas: Mutex::new(HashMap::new()),
        }
    }

    /// Open a persona engine, reusing an already-open one.
    pub async fn persona(&self, persona_id: &str) -> Result<Arc<PersonaMemory>> {
        {
            let personas = self.personas.lock().await;
            if let Some(existing) = personas.get(persona_id) {
                return Ok(existing.clone());
            }
        }

        let embedder = self
            .embedder_cache
            .get(&self.settings)
            .map(|client| client as Arc<dyn Embedder>);
        let persona = PersonaMemory::open(
            self.settings.clone(),
            persona_id,
            embedder,
            self.llm.clone(),
            self.jobs.clone(),
        )
        .await?;

        let mut personas = self.personas.lock().await;
        Ok(personas.entry(persona_id.to_string()).or_insert(persona).clone())
    }
}

#[async_trait]
impl PersonaDirectory for WeaveEngine {
    async fn pool_for(&self, persona_id: &str) -> Option<Arc<DatabasePool>> {
        match self.persona(persona_id).await {
            Ok(persona) => Some(persona.pool().clone()),
            Err(e) => {
                warn!(persona_id, "failed to open persona for URI resolution: {e}");
                None
            }
        }
    }

    async fn active_thread_suffix(&self, persona_id: &str) -> Option<String> {
        match self.persona(persona_id).await {
            Ok(persona) => Some(persona.active_thread_suffix()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::FakeEmbedder;
    use crate::jobs::JobStatus;
    use crate::llm::FakeLlm;

    async fn persona_with_fakes() -> Arc<PersonaMemory> {
        let mut settings = Settings::from_env();
        settings.chunk_min_chars = 0;
        settings.chunk_max_chars = 480;
        PersonaMemory::open_in_memory(
            settings,
            "p1",
            Some(Arc::new(FakeEmbedder::new(8)) as Arc<dyn Embedder>),
            Some(Arc::new(FakeLlm::new()) as Arc<dyn LlmClient>),
            Arc::new(JobRegistry::new()),
        )
        .await
        .expect("persona")
    }

    #[tokio::test]
    async fn reembed_repairs_wrong_dimension_rows() {
        let persona = persona_with_fakes().await;
        let id = persona
            .messages
            .append_message("p1:t", "user", "some content here", None, Some(1), None)
            .await
            .expect("append");

        // Corrupt the stored vector dimension.
        persona
            .messages
            .replace_message_embeddings(&id, vec![vec![0.5; 3]])
            .await
            .expect("corrupt");

        let report = persona.reembed(false, None).await.expect("reembed");
        assert_eq!(report.checked, 1);
        assert_eq!(report.reembedded, 1);
        assert_eq!(report.skipped_errors, 0);

        let dims = {
            let id = id.clone();
            persona
                .pool()
                .interact(move |conn| db_messages::get_embedding_dims_sync(conn, &id))
                .await
                .expect("dims")
        };
        assert_eq!(dims, vec![8]);

        // A healthy store is a no-op without force.
        let report = persona.reembed(false, None).await.expect("reembed");
        assert_eq!(report.reembedded, 0);
        let report = persona.reembed(true, None).await.expect("force");
        assert_eq!(report.reembedded, 1);
    }

    #[tokio::test]
    async fn reembed_job_completes_in_background() {
        let persona = persona_with_fakes().await;
        persona
            .messages
            .append_message("p1:t", "user", "job content", None, Some(1), None)
            .await
            .expect("append");

        let job_id = persona.start_reembed_job(true).await.expect("start");
        // Poll until the spawned task finishes.
        for _ in 0..100 {
            if let Some(job) = persona.jobs().get(&job_id)
                && matches!(job.status, JobStatus::Completed | JobStatus::Failed)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let job = persona.jobs().get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.entries_created, 1);
    }

    #[tokio::test]
    async fn default_recall_params_follow_settings() {
        let persona = persona_with_fakes().await;
        let params = persona.default_recall_params();
        assert_eq!(params.resource_id.as_deref(), Some("p1"));
        assert!(params.thread_id.as_deref().unwrap_or("").starts_with("p1:"));
    }
}
