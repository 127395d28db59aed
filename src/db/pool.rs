// src/db/pool.rs
// Pooled access to one persona's memory database.
//
// SQL runs on deadpool's blocking threads via `interact`; generation code
// never holds a connection across an LLM or embedding call. Every fresh
// connection gets its session pragmas (WAL journaling on disk, foreign-key
// enforcement, a 5-second busy timeout) before joining the pool.

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, HookError, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const POOL_SIZE: usize = 8;

/// Session pragmas for file-backed databases. WAL and relaxed fsync only
/// make sense on disk.
const FILE_PRAGMAS: &str = "\
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;";

/// Session pragmas for shared-cache in-memory databases.
const MEMORY_PRAGMAS: &str = "\
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;";

/// Attempts for writes that still see SQLITE_BUSY after the in-database
/// wait. The delay doubles per attempt, starting here.
const WRITE_ATTEMPTS: u32 = 4;
const WRITE_BACKOFF: Duration = Duration::from_millis(150);

/// True when the error chain bottoms out in SQLITE_BUSY or SQLITE_LOCKED.
///
/// String-only errors never count: only a real sqlite error code can ask
/// for a retry.
fn is_contention(err: &anyhow::Error) -> bool {
    use rusqlite::ffi::ErrorCode;
    let sqlite_err = err.downcast_ref::<rusqlite::Error>().or_else(|| {
        match err.downcast_ref::<crate::error::WeaveError>() {
            Some(crate::error::WeaveError::Db(db)) => Some(db),
            _ => None,
        }
    });
    matches!(
        sqlite_err.and_then(rusqlite::Error::sqlite_error_code),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Pooled access to one persona's memory database.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
}

impl DatabasePool {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating database directory {}", dir.display()))?;
        }

        let pool = build_pool(&path.to_string_lossy(), FILE_PRAGMAS)?;
        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        db.migrate().await?;
        db.restrict_permissions();
        Ok(db)
    }

    /// Open a throwaway in-memory database (tests).
    ///
    /// A shared-cache URI keeps every pool connection on the same database;
    /// a plain `:memory:` open would hand each connection its own.
    pub async fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:weave-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let pool = build_pool(&uri, MEMORY_PRAGMAS)?;
        let db = Self { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        self.interact(|conn| super::schema::run_migrations(conn)).await
    }

    /// Owner-only access on the database file and its directory.
    /// Best-effort: a failure is logged, never fatal.
    fn restrict_permissions(&self) {
        #[cfg(unix)]
        if let Some(db_file) = &self.path {
            use std::os::unix::fs::PermissionsExt;
            let mut targets = vec![(db_file.clone(), 0o600)];
            if let Some(dir) = db_file.parent() {
                targets.push((dir.to_path_buf(), 0o700));
            }
            for (target, mode) in targets {
                let tightened = std::fs::metadata(&target).and_then(|meta| {
                    let mut perms = meta.permissions();
                    perms.set_mode(mode);
                    std::fs::set_permissions(&target, perms)
                });
                if let Err(e) = tightened {
                    tracing::warn!("could not tighten permissions on {}: {e}", target.display());
                }
            }
        }
    }

    /// Run a closure on a pooled connection.
    ///
    /// This is the primary database entry point: the closure executes on a
    /// blocking thread, so SQL never stalls the async runtime.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await.context("sqlite pool unavailable")?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("blocking database task failed: {e}"))?
    }

    /// Like [`interact`](Self::interact), retrying writes that lose the
    /// busy-timeout race. Anything other than SQLITE_BUSY/LOCKED fails
    /// immediately. The closure must be `Clone` so attempts can repeat it.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        let mut delay = WRITE_BACKOFF;
        for attempt in 1..WRITE_ATTEMPTS {
            match self.interact(f.clone()).await {
                Err(e) if is_contention(&e) => {
                    tracing::warn!(attempt, "database busy, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
        self.interact(f).await
    }

    /// Copy the live database into `dest` with SQLite's online-backup API.
    ///
    /// The destination is checkpointed (`wal_checkpoint(TRUNCATE)`) and
    /// switched to `journal_mode=DELETE` so the archived file stands alone
    /// without -wal/-shm companions.
    pub async fn snapshot_to(&self, dest: &Path) -> Result<()> {
        let dest = dest.to_path_buf();
        self.interact(move |conn| {
            let mut dst = Connection::open(&dest)
                .with_context(|| format!("opening snapshot target {}", dest.display()))?;
            {
                let backup = rusqlite::backup::Backup::new(conn, &mut dst)?;
                backup.run_to_completion(64, Duration::from_millis(50), None)?;
            }
            dst.execute_batch(
                "PRAGMA wal_checkpoint(TRUNCATE); \
                 PRAGMA journal_mode=DELETE;",
            )?;
            Ok(())
        })
        .await
    }
}

fn build_pool(conn_str: &str, pragmas: &'static str) -> Result<Pool> {
    Config::new(conn_str)
        .builder(Runtime::Tokio1)
        .context("configuring sqlite pool")?
        .max_size(POOL_SIZE)
        .post_create(session_pragmas_hook(pragmas))
        .build()
        .context("building sqlite pool")
}

fn session_pragmas_hook(pragmas: &'static str) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            match conn.interact(|conn| conn.execute_batch(pragmas)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HookError::Message(format!("session pragmas failed: {e}").into())),
                Err(e) => Err(HookError::Message(format!("pragma task failed: {e}").into())),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open in-memory pool");

        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO threads (id, resource_id) VALUES (?, ?)",
                rusqlite::params!["p1:t", "p1"],
            )?;
            Ok(())
        })
        .await
        .expect("Failed to insert");

        // Verify from another connection in the pool (tests shared cache)
        let resource: String = pool
            .interact(|conn| {
                conn.query_row(
                    "SELECT resource_id FROM threads WHERE id = ?",
                    ["p1:t"],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
            .expect("Failed to query");

        assert_eq!(resource, "p1");
    }

    #[tokio::test]
    async fn test_concurrent_writes() {
        let pool = std::sync::Arc::new(
            DatabasePool::open_in_memory()
                .await
                .expect("Failed to open pool"),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact_with_retry(move |conn| {
                    conn.execute(
                        "INSERT INTO threads (id, resource_id) VALUES (?, ?)",
                        rusqlite::params![format!("p1:t{i}"), "p1"],
                    )?;
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().expect("Concurrent write failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .expect("Count failed");

        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_non_busy_error_fails_fast() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open pool");

        let result = pool
            .interact_with_retry(|conn| {
                conn.execute("INSERT INTO nonexistent_table VALUES (?)", [1])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_contention_detection_by_error_code() {
        fn sqlite_failure(code: rusqlite::ffi::ErrorCode, extended: i32) -> rusqlite::Error {
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code,
                    extended_code: extended,
                },
                None,
            )
        }

        let busy: anyhow::Error =
            sqlite_failure(rusqlite::ffi::ErrorCode::DatabaseBusy, 5).into();
        assert!(is_contention(&busy));

        // A WeaveError-wrapped sqlite failure is still retryable.
        let wrapped: anyhow::Error = anyhow::Error::from(crate::error::WeaveError::Db(
            sqlite_failure(rusqlite::ffi::ErrorCode::DatabaseLocked, 6),
        ));
        assert!(is_contention(&wrapped));

        let constraint: anyhow::Error =
            sqlite_failure(rusqlite::ffi::ErrorCode::ConstraintViolation, 19).into();
        assert!(!is_contention(&constraint));

        // String-only errors must not trigger retries.
        assert!(!is_contention(&anyhow::anyhow!("database is locked")));
    }

    #[tokio::test]
    async fn test_snapshot_to_produces_standalone_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("memory.db");
        let snapshot_path = dir.path().join("snapshot.db");

        let pool = DatabasePool::open(&db_path).await.expect("open");
        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO threads (id, resource_id) VALUES ('p:t', 'p')",
                [],
            )?;
            Ok(())
        })
        .await
        .expect("insert");

        pool.snapshot_to(&snapshot_path).await.expect("snapshot");

        let conn = Connection::open(&snapshot_path).expect("open snapshot");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("journal mode");
        assert_eq!(mode.to_lowercase(), "delete");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }
}
