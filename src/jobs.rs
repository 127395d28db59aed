// src/jobs.rs
// In-process registry of background generation jobs
//
// Jobs outlive the request that started them. The registry is process-wide,
// passed explicitly to whoever spawns work, and is the user-visible failure
// surface: background jobs never raise, they transition to `failed`.

use crate::error::WeaveError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ChronicleGen,
    MemopediaGen,
    Reembed,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub persona_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: usize,
    pub total: usize,
    pub message: String,
    pub entries_created: usize,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    /// Batch metadata attached to chronicle failures (message ids, range).
    pub error_meta: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Process-wide job table behind a mutex.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending job and return its id.
    pub fn create(&self, persona_id: &str, kind: JobKind) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let record = JobRecord {
            job_id: job_id.clone(),
            persona_id: persona_id.to_string(),
            kind,
            status: JobStatus::Pending,
            progress: 0,
            total: 0,
            message: String::new(),
            entries_created: 0,
            error: None,
            error_code: None,
            error_detail: None,
            error_meta: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job_id.clone(), record);
        }
        job_id
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.lock().ok()?.get(job_id).cloned()
    }

    pub fn list(&self, persona_id: Option<&str>) -> Vec<JobRecord> {
        let Ok(jobs) = self.jobs.lock() else {
            return Vec::new();
        };
        let mut records: Vec<JobRecord> = jobs
            .values()
            .filter(|job| persona_id.is_none_or(|pid| job.persona_id == pid))
            .cloned()
            .collect();
        records.sort_by_key(|job| std::cmp::Reverse(job.created_at));
        records
    }

    /// Apply a mutation to a job record, if it exists.
    pub fn update<F>(&self, job_id: &str, mutate: F)
    where
        F: FnOnce(&mut JobRecord),
    {
        if let Ok(mut jobs) = self.jobs.lock() {
            match jobs.get_mut(job_id) {
                Some(record) => mutate(record),
                None => warn!(job_id, "update for unknown job"),
            }
        }
    }

    pub fn set_running(&self, job_id: &str, message: &str) {
        let message = message.to_string();
        self.update(job_id, move |job| {
            job.status = JobStatus::Running;
            job.message = message;
        });
    }

    pub fn set_progress(&self, job_id: &str, progress: usize, total: usize) {
        self.update(job_id, move |job| {
            job.progress = progress;
            job.total = total;
            job.message = format!("Processing... {progress}/{total}");
        });
    }

    /// Request cooperative cancellation. Only pending/running jobs move to
    /// `cancelling`; returns whether the request took effect.
    pub fn request_cancel(&self, job_id: &str) -> bool {
        let Ok(mut jobs) = self.jobs.lock() else {
            return false;
        };
        match jobs.get_mut(job_id) {
            Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Running) => {
                job.status = JobStatus::Cancelling;
                job.message = "Cancelling...".to_string();
                true
            }
            _ => false,
        }
    }

    /// The generator's poll: true while a cancel request is pending.
    pub fn is_cancelling(&self, job_id: &str) -> bool {
        self.get(job_id).is_some_and(|job| job.status == JobStatus::Cancelling)
    }

    pub fn mark_cancelled(&self, job_id: &str, entries_created: usize) {
        self.update(job_id, move |job| {
            job.status = JobStatus::Cancelled;
            job.entries_created = entries_created;
            job.message = format!("Cancelled after {entries_created} entries");
        });
    }

    pub fn mark_completed(&self, job_id: &str, entries_created: usize, message: &str) {
        let message = message.to_string();
        self.update(job_id, move |job| {
            job.status = JobStatus::Completed;
            job.entries_created = entries_created;
            job.message = message;
        });
    }

    /// Record a failure. LLM errors carry their code and batch metadata into
    /// the record so the caller can surface the offending batch.
    pub fn mark_failed(&self, job_id: &str, error: &WeaveError) {
        let code = error.error_code().to_string();
        let text = error.to_string();
        let meta = match error {
            WeaveError::Llm(llm) => llm
                .batch_meta
                .as_ref()
                .and_then(|meta| serde_json::to_value(meta).ok()),
            _ => None,
        };
        let detail = match error {
            WeaveError::Llm(llm) => Some(llm.user_message.clone()),
            _ => None,
        };
        self.update(job_id, move |job| {
            job.status = JobStatus::Failed;
            job.error = Some(text);
            job.error_code = Some(code);
            job.error_detail = detail;
            job.error_meta = meta;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BatchMeta, LlmError, LlmErrorCode};

    #[test]
    fn lifecycle_pending_running_completed() {
        let registry = JobRegistry::new();
        let job_id = registry.create("p1", JobKind::ChronicleGen);

        let job = registry.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, JobKind::ChronicleGen);

        registry.set_running(&job_id, "Loading database...");
        registry.set_progress(&job_id, 3, 10);
        registry.mark_completed(&job_id, 5, "done");

        let job = registry.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 3);
        assert_eq!(job.entries_created, 5);
    }

    #[test]
    fn cancel_only_applies_to_live_jobs() {
        let registry = JobRegistry::new();
        let job_id = registry.create("p1", JobKind::Reembed);

        assert!(registry.request_cancel(&job_id));
        assert!(registry.is_cancelling(&job_id));

        registry.mark_cancelled(&job_id, 2);
        let job = registry.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);

        // A finished job cannot be re-cancelled.
        assert!(!registry.request_cancel(&job_id));
        assert!(!registry.is_cancelling(&job_id));
    }

    #[test]
    fn llm_failure_carries_code_and_batch_meta() {
        let registry = JobRegistry::new();
        let job_id = registry.create("p1", JobKind::ChronicleGen);

        let error: WeaveError = LlmError::new(LlmErrorCode::Timeout, "model timed out")
            .with_batch_meta(BatchMeta {
                message_ids: vec!["m1".into(), "m2".into()],
                start_time: 10,
                end_time: 20,
            })
            .into();
        registry.mark_failed(&job_id, &error);

        let job = registry.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("timeout"));
        let meta = job.error_meta.expect("meta");
        assert_eq!(
            meta.get("message_ids").and_then(|v| v.as_array()).map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn list_filters_by_persona_and_sorts_newest_first() {
        let registry = JobRegistry::new();
        registry.create("p1", JobKind::Import);
        registry.create("p2", JobKind::Reembed);
        registry.create("p1", JobKind::MemopediaGen);

        assert_eq!(registry.list(Some("p1")).len(), 2);
        assert_eq!(registry.list(None).len(), 3);
        assert_eq!(registry.list(Some("p3")).len(), 0);
    }
}
