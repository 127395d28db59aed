// src/backup.rs
// Persona database backups
//
// Both strategies share one snapshot step: an online-backup copy of the live
// database, checkpointed and switched to journal_mode=DELETE so it stands
// alone. The simple strategy keeps timestamped copies with SHA-256 dedup;
// the incremental strategy hands the snapshot to rdiff-backup. One on-disk
// PID lock serializes backups process-wide, with stale-lock recovery.

use crate::config::Settings;
use crate::db::pool::DatabasePool;
use crate::error::{Result, WeaveError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);
const RDIFF_API_VERSION: &str = "201";

/// How many archived repo rotations to keep for the incremental strategy.
const ARCHIVE_KEEP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStrategy {
    /// Incremental when rdiff-backup is on PATH, simple otherwise.
    Auto,
    Simple,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub strategy: &'static str,
    pub destination: PathBuf,
    /// True when a simple backup was skipped because the snapshot was
    /// identical to the latest archive.
    pub deduplicated: bool,
}

/// On-disk PID lock guarding concurrent backups.
struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    async fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let deadline = std::time::Instant::now() + wait;
        loop {
            Self::clear_stale(path);
            match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = write!(
                        file,
                        "pid={} ts={}",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    return Ok(Self { path: path.to_path_buf() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Err(WeaveError::Conflict(
                            "another backup appears to be running; timed out waiting for lock".into(),
                        ));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock file when its holder process is dead.
    fn clear_stale(path: &Path) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };
        for part in content.split_whitespace() {
            if let Some(pid_text) = part.strip_prefix("pid=")
                && let Ok(pid) = pid_text.parse::<i32>()
            {
                if !process_alive(pid) {
                    warn!(pid, path = %path.display(), "removing stale backup lock");
                    let _ = std::fs::remove_file(path);
                }
                return;
            }
        }
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    // No cheap probe available; treat the holder as alive and let the
    // timeout surface the conflict.
    true
}

fn which(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn sha256_of(path: &Path) -> Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    Ok(Sha256::digest(&bytes).into())
}

fn timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Run a backup of one persona's database.
pub async fn run_backup(
    settings: &Settings,
    persona_id: &str,
    pool: &Arc<DatabasePool>,
    strategy: BackupStrategy,
) -> Result<BackupReport> {
    let _lock = BackupLock::acquire(
        &settings.backup_lock_path(),
        Duration::from_secs(settings.backup_lock_wait_secs),
    )
    .await?;

    let strategy = match strategy {
        BackupStrategy::Auto => {
            if which("rdiff-backup").is_some() {
                BackupStrategy::Incremental
            } else {
                BackupStrategy::Simple
            }
        }
        other => other,
    };

    match strategy {
        BackupStrategy::Simple => simple_backup(settings, persona_id, pool).await,
        BackupStrategy::Incremental => incremental_backup(settings, persona_id, pool).await,
        BackupStrategy::Auto => unreachable!("auto resolved above"),
    }
}

/// Timestamped snapshot with SHA-256 dedup against the latest archive.
async fn simple_backup(
    settings: &Settings,
    persona_id: &str,
    pool: &Arc<DatabasePool>,
) -> Result<BackupReport> {
    let dest_dir = settings.simple_backup_root().join(persona_id);
    std::fs::create_dir_all(&dest_dir)?;

    let snapshot_path = dest_dir.join(format!("memory.db_backup_{}.bak.tmp", timestamp_suffix()));
    pool.snapshot_to(&snapshot_path).await?;

    // Skip when nothing changed since the newest archive.
    if let Some(latest) = latest_backup_file(&dest_dir)?
        && sha256_of(&latest)? == sha256_of(&snapshot_path)?
    {
        std::fs::remove_file(&snapshot_path)?;
        info!(persona_id, latest = %latest.display(), "snapshot identical to latest backup, skipping");
        return Ok(BackupReport {
            strategy: "simple",
            destination: latest,
            deduplicated: true,
        });
    }

    let final_path = snapshot_path.with_extension("");
    std::fs::rename(&snapshot_path, &final_path)?;
    prune_simple_backups(&dest_dir, settings.backup_keep)?;
    info!(persona_id, destination = %final_path.display(), "simple backup written");

    Ok(BackupReport {
        strategy: "simple",
        destination: final_path,
        deduplicated: false,
    })
}

fn latest_backup_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "bak")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("memory.db_backup_"))
        })
        .collect();
    backups.sort();
    Ok(backups.pop())
}

fn prune_simple_backups(dir: &Path, keep: usize) -> Result<()> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "bak"))
        .collect();
    backups.sort();
    while backups.len() > keep {
        let victim = backups.remove(0);
        if let Err(e) = std::fs::remove_file(&victim) {
            warn!(path = %victim.display(), "failed to prune old backup: {e}");
        }
    }
    Ok(())
}

/// Snapshot into a temp dir and push it through rdiff-backup.
///
/// A repo the tool reports as corrupt is rotated aside and the push retried
/// once against a fresh repo; old rotations are pruned.
async fn incremental_backup(
    settings: &Settings,
    persona_id: &str,
    pool: &Arc<DatabasePool>,
) -> Result<BackupReport> {
    let rdiff = which("rdiff-backup").ok_or_else(|| {
        WeaveError::Config("rdiff-backup not found on PATH; install it or use the simple strategy".into())
    })?;

    let repo_dir = settings.rdiff_backup_root().join(persona_id);
    std::fs::create_dir_all(&repo_dir)?;

    let snapshot_dir = tempfile_dir(&settings.rdiff_backup_root())?;
    let snapshot_path = snapshot_dir.join("memory.db");
    pool.snapshot_to(&snapshot_path).await?;

    let result = (|| -> Result<()> {
        let (code, output) = run_rdiff(&rdiff, &snapshot_dir, &repo_dir)?;
        if code == 0 {
            return Ok(());
        }
        if looks_corrupt(&output) {
            warn!(persona_id, "backup repo looks corrupt, rotating and retrying");
            rotate_repo(&repo_dir)?;
            prune_archives(&repo_dir, ARCHIVE_KEEP);
            let (retry_code, retry_output) = run_rdiff(&rdiff, &snapshot_dir, &repo_dir)?;
            if retry_code == 0 {
                return Ok(());
            }
            return Err(WeaveError::Other(format!(
                "rdiff-backup failed after repo rotation: {retry_output}"
            )));
        }
        Err(WeaveError::Other(format!("rdiff-backup failed: {output}")))
    })();

    let _ = std::fs::remove_dir_all(&snapshot_dir);
    result?;

    info!(persona_id, repo = %repo_dir.display(), "incremental backup pushed");
    Ok(BackupReport {
        strategy: "incremental",
        destination: repo_dir,
        deduplicated: false,
    })
}

fn tempfile_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join(format!("snapshot_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn run_rdiff(rdiff: &Path, snapshot_dir: &Path, repo_dir: &Path) -> Result<(i32, String)> {
    let output = Command::new(rdiff)
        .args(["--api-version", RDIFF_API_VERSION, "backup", "--preserve-numerical-ids"])
        .arg(snapshot_dir)
        .arg(repo_dir)
        .output()?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok((output.status.code().unwrap_or(-1), text))
}

fn looks_corrupt(output: &str) -> bool {
    let lower = output.to_lowercase();
    ["current mirror", "current_mirror", "previous backup seems to have failed", "not in the past"]
        .iter()
        .any(|signal| lower.contains(signal))
}

/// Archive an existing repo to `{name}.archived.{ts}` and recreate it empty.
fn rotate_repo(repo_dir: &Path) -> Result<PathBuf> {
    let archived = repo_dir.with_file_name(format!(
        "{}.archived.{}",
        repo_dir.file_name().and_then(|n| n.to_str()).unwrap_or("repo"),
        timestamp_suffix()
    ));
    if archived.exists() {
        std::fs::remove_dir_all(&archived)?;
    }
    if repo_dir.exists() {
        std::fs::rename(repo_dir, &archived)?;
    }
    std::fs::create_dir_all(repo_dir)?;
    Ok(archived)
}

fn prune_archives(repo_dir: &Path, keep: usize) {
    let Some(parent) = repo_dir.parent() else { return };
    let stem = format!(
        "{}.archived.",
        repo_dir.file_name().and_then(|n| n.to_str()).unwrap_or("repo")
    );
    let Ok(entries) = std::fs::read_dir(parent) else { return };
    let mut archives: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&stem))
        })
        .collect();
    archives.sort();
    while archives.len() > keep {
        let victim = archives.remove(0);
        if let Err(e) = std::fs::remove_dir_all(&victim) {
            warn!(path = %victim.display(), "failed to prune archive: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(home: &Path) -> Settings {
        let mut settings = Settings::from_env();
        settings.saiverse_home = home.to_path_buf();
        settings.backup_keep = 2;
        settings.backup_lock_wait_secs = 1;
        settings
    }

    async fn seeded_pool(dir: &Path) -> Arc<DatabasePool> {
        let pool = Arc::new(DatabasePool::open(&dir.join("memory.db")).await.expect("pool"));
        pool.interact(|conn| {
            conn.execute("INSERT INTO threads (id, resource_id) VALUES ('p:t', 'p')", [])?;
            Ok(())
        })
        .await
        .expect("seed");
        pool
    }

    #[tokio::test]
    async fn simple_backup_dedups_identical_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = test_settings(dir.path());
        let pool = seeded_pool(dir.path()).await;

        let first = run_backup(&settings, "p1", &pool, BackupStrategy::Simple)
            .await
            .expect("first backup");
        assert!(!first.deduplicated);
        assert!(first.destination.exists());

        let second = run_backup(&settings, "p1", &pool, BackupStrategy::Simple)
            .await
            .expect("second backup");
        assert!(second.deduplicated);
        assert_eq!(second.destination, first.destination);

        // A change produces a fresh archive.
        pool.interact(|conn| {
            conn.execute("INSERT INTO threads (id, resource_id) VALUES ('p:t2', 'p')", [])?;
            Ok(())
        })
        .await
        .expect("mutate");
        let third = run_backup(&settings, "p1", &pool, BackupStrategy::Simple)
            .await
            .expect("third backup");
        assert!(!third.deduplicated);
        assert_ne!(third.destination, first.destination);
    }

    #[tokio::test]
    async fn simple_backup_prunes_old_archives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = test_settings(dir.path());
        let pool = seeded_pool(dir.path()).await;

        for i in 0..4 {
            pool.interact(move |conn| {
                conn.execute(
                    "INSERT INTO threads (id, resource_id) VALUES (?, 'p')",
                    [format!("p:extra{i}")],
                )?;
                Ok(())
            })
            .await
            .expect("mutate");
            run_backup(&settings, "p1", &pool, BackupStrategy::Simple)
                .await
                .expect("backup");
            // Timestamp suffixes have second resolution.
            tokio::time::sleep(Duration::from_millis(1100)).await;
        }

        let backups = std::fs::read_dir(settings.simple_backup_root().join("p1"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "bak"))
            .count();
        assert_eq!(backups, 2);
    }

    #[tokio::test]
    async fn backup_lock_blocks_and_recovers_from_stale_holders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = test_settings(dir.path());
        let lock_path = settings.backup_lock_path();

        // A lock held by a live process (us) forces a timeout.
        std::fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&lock_path, format!("pid={} ts=now", std::process::id())).expect("lock");
        let pool = seeded_pool(dir.path()).await;
        let err = run_backup(&settings, "p1", &pool, BackupStrategy::Simple)
            .await
            .expect_err("locked");
        assert!(matches!(err, WeaveError::Conflict(_)));

        // A lock whose holder is dead is cleared and the backup proceeds.
        std::fs::write(&lock_path, "pid=999999999 ts=old").expect("stale lock");
        run_backup(&settings, "p1", &pool, BackupStrategy::Simple)
            .await
            .expect("recovered");
        assert!(!lock_path.exists());
    }

    #[test]
    fn corrupt_repo_detection() {
        assert!(looks_corrupt("Fatal: Previous backup seems to have failed"));
        assert!(looks_corrupt("found current_mirror marker"));
        assert!(!looks_corrupt("backup completed successfully"));
    }
}
