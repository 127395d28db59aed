// src/config.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use tracing::warn;

fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    read_var(name).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn parse_int_env(name: &str, default: i64) -> i64 {
    read_var(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Engine settings, read once from the environment.
///
/// Chunk bounds are clamped on load: negative minimums go to zero,
/// non-positive maximums to one, and a minimum above the maximum is
/// pulled down to it.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory holding `personas/{persona_id}/memory.db` and backups.
    pub saiverse_home: PathBuf,

    // Embedding model
    pub embed_model: String,
    pub embed_base_url: Option<String>,
    pub embed_api_key: Option<String>,
    pub embed_dim: Option<usize>,

    // Chat model
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    // Recall defaults
    pub last_messages: usize,
    pub topk: usize,
    pub range_before: usize,
    pub range_after: usize,
    pub scope: String,

    // Chunking
    pub chunk_min_chars: usize,
    pub chunk_max_chars: usize,

    // Chronicle
    pub batch_size: usize,
    pub consolidation_size: usize,
    pub include_timestamp: bool,

    // Backup
    pub backup_keep: usize,
    pub backup_lock_wait_secs: u64,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Self {
        let saiverse_home = read_var("SAIVERSE_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".saiverse")))
            .unwrap_or_else(|| PathBuf::from(".saiverse"));

        let mut chunk_min_chars = parse_int_env("MEMORY_WEAVE_CHUNK_MIN_CHARS", 120).max(0) as usize;
        let chunk_max_chars = parse_int_env("MEMORY_WEAVE_CHUNK_MAX_CHARS", 480).max(1) as usize;
        if chunk_min_chars > chunk_max_chars {
            warn!(
                chunk_min_chars,
                chunk_max_chars, "chunk minimum above maximum, clamping"
            );
            chunk_min_chars = chunk_max_chars;
        }

        Self {
            saiverse_home,
            embed_model: read_var("MEMORY_WEAVE_EMBED_MODEL")
                .unwrap_or_else(|| "intfloat/multilingual-e5-small".to_string()),
            embed_base_url: read_var("MEMORY_WEAVE_EMBED_BASE_URL")
                .or_else(|| read_var("OLLAMA_HOST")),
            embed_api_key: read_var("OPENAI_API_KEY"),
            embed_dim: read_var("MEMORY_WEAVE_EMBED_DIM").and_then(|v| v.parse().ok()),
            llm_base_url: read_var("MEMORY_WEAVE_LLM_BASE_URL"),
            llm_api_key: read_var("MEMORY_WEAVE_LLM_API_KEY").or_else(|| read_var("OPENAI_API_KEY")),
            llm_model: read_var("MEMORY_WEAVE_MODEL").unwrap_or_else(|| "gpt-5".to_string()),
            last_messages: parse_int_env("MEMORY_WEAVE_LAST_MESSAGES", 8).max(0) as usize,
            topk: parse_int_env("MEMORY_WEAVE_TOPK", 5).max(0) as usize,
            range_before: parse_int_env("MEMORY_WEAVE_RANGE_BEFORE", 1).max(0) as usize,
            range_after: parse_int_env("MEMORY_WEAVE_RANGE_AFTER", 1).max(0) as usize,
            scope: read_var("MEMORY_WEAVE_SCOPE").unwrap_or_else(|| "resource".to_string()),
            chunk_min_chars,
            chunk_max_chars,
            batch_size: parse_int_env("MEMORY_WEAVE_BATCH_SIZE", 20).max(1) as usize,
            consolidation_size: parse_int_env("MEMORY_WEAVE_CONSOLIDATION_SIZE", 10).max(2) as usize,
            include_timestamp: parse_bool_env("MEMORY_WEAVE_INCLUDE_TIMESTAMP").unwrap_or(true),
            backup_keep: parse_int_env("MEMORY_WEAVE_BACKUP_KEEP", 10).max(1) as usize,
            backup_lock_wait_secs: parse_int_env("MEMORY_WEAVE_BACKUP_LOCK_WAIT_SEC", 10).max(0)
                as u64,
        }
    }

    /// Directory holding a persona's database and adjacent state files.
    pub fn persona_dir(&self, persona_id: &str) -> PathBuf {
        self.saiverse_home.join("personas").join(persona_id)
    }

    /// Path of a persona's memory database.
    pub fn memory_db_path(&self, persona_id: &str) -> PathBuf {
        self.persona_dir(persona_id).join("memory.db")
    }

    /// Root for simple timestamped backups.
    pub fn simple_backup_root(&self) -> PathBuf {
        self.saiverse_home.join("backups").join("saimemory_simple")
    }

    /// Root for the external incremental backup repositories.
    pub fn rdiff_backup_root(&self) -> PathBuf {
        self.saiverse_home.join("backups").join("saimemory_rdiff")
    }

    /// Global backup lock file path.
    pub fn backup_lock_path(&self) -> PathBuf {
        self.rdiff_backup_root().join("saimemory_backup.lock")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}
