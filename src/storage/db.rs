use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::StoreError;
use crate::models::*;

/// Async-safe handle to the bughunt database.
///
/// Wraps `BugHuntDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BugHuntDb>>,
}

impl DbHandle {
    pub fn new(db: BugHuntDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        Ok(Self::new(BugHuntDb::open(path, busy_timeout)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(BugHuntDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&BugHuntDb) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")
        .map_err(E::from)?
    }
}

pub struct BugHuntDb {
    pub(super) conn: Connection,
}

impl BugHuntDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    ///
    /// Several processes may share one file: the database runs in WAL mode and
    /// writers wait up to `busy_timeout` for each other.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repos (
                    repo_id TEXT PRIMARY KEY,
                    repo_git_url TEXT NOT NULL,
                    repo_git_branch TEXT NOT NULL,
                    repo_last_git_commit_hash TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS linters (
                    linter_id TEXT PRIMARY KEY,
                    linter_git_url TEXT NOT NULL,
                    linter_git_branch TEXT NOT NULL,
                    linter_last_docker_image TEXT,
                    linter_last_docker_sha_hash TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lint_tasks (
                    lint_id TEXT PRIMARY KEY,
                    linter_id TEXT NOT NULL,
                    linter_docker_image TEXT NOT NULL,
                    linter_docker_sha_hash TEXT NOT NULL,
                    repo_id TEXT NOT NULL,
                    repo_git_url TEXT NOT NULL,
                    repo_git_commit_hash TEXT NOT NULL,
                    lint_status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (lint_status IN ('pending', 'succeeded', 'failed', 'skipped')),
                    lint_status_comment TEXT,
                    lint_duration_ms INTEGER,
                    created_at INTEGER NOT NULL,
                    locked_at INTEGER,
                    linted_at INTEGER,
                    UNIQUE (repo_git_commit_hash, linter_id, linter_docker_sha_hash)
                );

                CREATE TABLE IF NOT EXISTS lint_highlights (
                    lint_id TEXT NOT NULL REFERENCES lint_tasks(lint_id) ON DELETE CASCADE,
                    path TEXT NOT NULL,
                    start_line INTEGER NOT NULL,
                    end_line INTEGER NOT NULL,
                    explanation TEXT NOT NULL,
                    snippet_start_line INTEGER NOT NULL,
                    snippet_end_line INTEGER NOT NULL,
                    snippet_code TEXT NOT NULL,
                    moderation_status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (moderation_status IN ('rejected', 'pending', 'accepted')),
                    moderator TEXT,
                    moderation_comment TEXT,
                    moderated_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_lint_tasks_claim ON lint_tasks(lint_status, created_at);
                CREATE INDEX IF NOT EXISTS idx_lint_tasks_repo ON lint_tasks(repo_id);
                CREATE INDEX IF NOT EXISTS idx_lint_highlights_task ON lint_highlights(lint_id);
                CREATE INDEX IF NOT EXISTS idx_lint_highlights_location ON lint_highlights(path, start_line, end_line);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    // ── Repos ────────────────────────────────────────────────────────

    pub fn list_repos(&self) -> Result<Vec<Repo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT repo_id, repo_git_url, repo_git_branch, repo_last_git_commit_hash
                 FROM repos ORDER BY repo_id",
            )
            .context("Failed to prepare list_repos")?;
        let rows = stmt
            .query_map([], repo_from_row)
            .context("Failed to query repos")?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repo row")?);
        }
        Ok(repos)
    }

    pub fn get_repo(&self, id: &str) -> Result<Option<Repo>> {
        self.conn
            .query_row(
                "SELECT repo_id, repo_git_url, repo_git_branch, repo_last_git_commit_hash
                 FROM repos WHERE repo_id = ?1",
                params![id],
                repo_from_row,
            )
            .optional()
            .context("Failed to get repo")
    }

    /// Insert or update a repo by id.
    ///
    /// A `MetaOnly` update keeps the last resolved commit as long as the url
    /// and branch are unchanged; moving the repo elsewhere forgets it.
    pub fn add_or_update_repo(&self, repo: &Repo, updated_at: DateTime<Utc>) -> Result<()> {
        let meta = repo.meta();
        let commit_hash = repo.instance().map(|i| i.git_commit_hash.as_str());
        self.conn
            .execute(
                "INSERT INTO repos (repo_id, repo_git_url, repo_git_branch, repo_last_git_commit_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (repo_id) DO UPDATE SET
                     repo_last_git_commit_hash = CASE
                         WHEN excluded.repo_last_git_commit_hash IS NOT NULL
                             THEN excluded.repo_last_git_commit_hash
                         WHEN repos.repo_git_url = excluded.repo_git_url
                              AND repos.repo_git_branch = excluded.repo_git_branch
                             THEN repos.repo_last_git_commit_hash
                         ELSE NULL
                     END,
                     repo_git_url = excluded.repo_git_url,
                     repo_git_branch = excluded.repo_git_branch,
                     updated_at = excluded.updated_at",
                params![
                    meta.id,
                    meta.git_url,
                    meta.git_branch,
                    commit_hash,
                    to_millis(updated_at)
                ],
            )
            .context("Failed to upsert repo")?;
        Ok(())
    }

    /// Returns whether a repo with this id existed.
    pub fn delete_repo(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM repos WHERE repo_id = ?1", params![id])
            .context("Failed to delete repo")?;
        Ok(deleted > 0)
    }

    // ── Linters ──────────────────────────────────────────────────────

    pub fn list_linters(&self) -> Result<Vec<Linter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT linter_id, linter_git_url, linter_git_branch, linter_last_docker_image, linter_last_docker_sha_hash
                 FROM linters ORDER BY linter_id",
            )
            .context("Failed to prepare list_linters")?;
        let rows = stmt
            .query_map([], linter_from_row)
            .context("Failed to query linters")?;
        let mut linters = Vec::new();
        for row in rows {
            linters.push(row.context("Failed to read linter row")?);
        }
        Ok(linters)
    }

    pub fn get_linter(&self, id: &str) -> Result<Option<Linter>> {
        self.conn
            .query_row(
                "SELECT linter_id, linter_git_url, linter_git_branch, linter_last_docker_image, linter_last_docker_sha_hash
                 FROM linters WHERE linter_id = ?1",
                params![id],
                linter_from_row,
            )
            .optional()
            .context("Failed to get linter")
    }

    /// Insert or update a linter by id. A `MetaOnly` update never forgets a
    /// published image.
    pub fn add_or_update_linter(&self, linter: &Linter, updated_at: DateTime<Utc>) -> Result<()> {
        let meta = linter.meta();
        let instance = linter.instance();
        self.conn
            .execute(
                "INSERT INTO linters (linter_id, linter_git_url, linter_git_branch, linter_last_docker_image, linter_last_docker_sha_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (linter_id) DO UPDATE SET
                     linter_git_url = excluded.linter_git_url,
                     linter_git_branch = excluded.linter_git_branch,
                     linter_last_docker_image = COALESCE(excluded.linter_last_docker_image, linters.linter_last_docker_image),
                     linter_last_docker_sha_hash = COALESCE(excluded.linter_last_docker_sha_hash, linters.linter_last_docker_sha_hash),
                     updated_at = excluded.updated_at",
                params![
                    meta.id,
                    meta.git_url,
                    meta.git_branch,
                    instance.map(|i| i.docker_image.as_str()),
                    instance.map(|i| i.docker_image_sha_hash.as_str()),
                    to_millis(updated_at)
                ],
            )
            .context("Failed to upsert linter")?;
        Ok(())
    }

    /// Returns whether a linter with this id existed.
    pub fn delete_linter(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM linters WHERE linter_id = ?1", params![id])
            .context("Failed to delete linter")?;
        Ok(deleted > 0)
    }

    // ── Lint tasks ───────────────────────────────────────────────────

    /// Enqueue a pending task created at `now` unless its fingerprint is
    /// already known.
    pub fn try_add(&self, task: &LintTask, now: DateTime<Utc>) -> Result<(), StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO lint_tasks (lint_id, linter_id, linter_docker_image, linter_docker_sha_hash,
                                     repo_id, repo_git_url, repo_git_commit_hash, lint_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                task.id,
                task.linter.id,
                task.linter.docker_image,
                task.linter.docker_image_sha_hash,
                task.repo.id,
                task.repo.git_url,
                task.repo.git_commit_hash,
                to_millis(now)
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateTask {
                fingerprint: task.fingerprint(),
            }),
            Err(e) => Err(anyhow::Error::new(e)
                .context("Failed to insert lint task")
                .into()),
        }
    }

    /// Lease the oldest pending task whose lock is absent or at or before
    /// `lease_horizon`, stamping it with `now`.
    ///
    /// The select and the lock happen in one statement, so two callers can
    /// never lease the same task for the same horizon.
    pub fn try_take(
        &self,
        lease_horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LintTask, StoreError> {
        let sql = format!(
            "UPDATE lint_tasks SET locked_at = ?1
             WHERE lint_id = (SELECT lint_id FROM lint_tasks
                              WHERE lint_status = 'pending'
                                AND (locked_at IS NULL OR locked_at <= ?2)
                              ORDER BY created_at, lint_id
                              LIMIT 1)
             RETURNING {}",
            TASK_COLUMNS
        );
        self.conn
            .query_row(
                &sql,
                params![to_millis(now), to_millis(lease_horizon)],
                task_from_row,
            )
            .optional()
            .context("Failed to lease lint task")?
            .ok_or(StoreError::NoTasksAvailable)
    }

    /// Write the outcome of a leased task: its status and all highlights, or
    /// nothing at all.
    ///
    /// Only the holder of the lease `task.locked_at` may write. A `Pending`
    /// result records the attempt and keeps the lock, so the task is retried
    /// once the lease expires.
    pub fn set(
        &self,
        task: &LintTask,
        result: &LintResult,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if result.status == LintStatus::Pending && !result.highlights.is_empty() {
            return Err(anyhow::anyhow!(
                "Pending result for task {} cannot carry highlights",
                task.id
            )
            .into());
        }
        let comment = match result.status {
            LintStatus::Failed | LintStatus::Pending => result.status_comment.as_deref(),
            _ => None,
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let updated = tx
            .execute(
                "UPDATE lint_tasks
                 SET lint_status = ?2, lint_status_comment = ?3, lint_duration_ms = ?4, linted_at = ?5
                 WHERE lint_id = ?1 AND lint_status = 'pending' AND locked_at = ?6",
                params![
                    task.id,
                    result.status.as_str(),
                    comment,
                    duration_to_millis(result.duration),
                    to_millis(completed_at),
                    task.locked_at.map(to_millis)
                ],
            )
            .context("Failed to update lint task")?;
        if updated == 0 {
            let status: Option<String> = tx
                .query_row(
                    "SELECT lint_status FROM lint_tasks WHERE lint_id = ?1",
                    params![task.id],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to read lint task status")?;
            // Dropping the transaction rolls it back.
            return Err(match status.as_deref() {
                Some("pending") => StoreError::LeaseLost {
                    task_id: task.id.clone(),
                },
                _ => StoreError::NotPending {
                    task_id: task.id.clone(),
                },
            });
        }

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO lint_highlights (lint_id, path, start_line, end_line, explanation,
                                                  snippet_start_line, snippet_end_line, snippet_code)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .context("Failed to prepare highlight insert")?;
            for item in &result.highlights {
                stmt.execute(params![
                    task.id,
                    item.highlight.path,
                    item.highlight.start_line as i64,
                    item.highlight.end_line as i64,
                    item.highlight.explanation,
                    item.snippet.start_line as i64,
                    item.snippet.end_line as i64,
                    item.snippet.code
                ])
                .context("Failed to insert lint highlight")?;
            }
        }

        tx.commit().context("Failed to commit lint result")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<LintTask>> {
        let sql = format!("SELECT {} FROM lint_tasks WHERE lint_id = ?1", TASK_COLUMNS);
        self.conn
            .query_row(&sql, params![id], task_from_row)
            .optional()
            .context("Failed to get lint task")
    }

    /// Most recent tasks first, optionally restricted to one status.
    pub fn list_tasks(&self, status: Option<LintStatus>, limit: usize) -> Result<Vec<LintTask>> {
        let sql = format!(
            "SELECT {} FROM lint_tasks
             WHERE (?1 IS NULL OR lint_status = ?1)
             ORDER BY created_at DESC, lint_id
             LIMIT ?2",
            TASK_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                task_from_row,
            )
            .context("Failed to query lint tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read lint task row")?);
        }
        Ok(tasks)
    }
}

const TASK_COLUMNS: &str = "lint_id, linter_id, linter_docker_image, linter_docker_sha_hash, \
     repo_id, repo_git_url, repo_git_commit_hash, \
     lint_status, lint_status_comment, lint_duration_ms, created_at, locked_at, linted_at";

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repo> {
    let meta = RepoMeta {
        id: row.get(0)?,
        git_url: row.get(1)?,
        git_branch: row.get(2)?,
    };
    let commit_hash: Option<String> = row.get(3)?;
    Ok(match commit_hash {
        Some(hash) => Repo::MetaOnly(meta).resolve(&hash),
        None => Repo::MetaOnly(meta),
    })
}

fn linter_from_row(row: &Row<'_>) -> rusqlite::Result<Linter> {
    let meta = LinterMeta {
        id: row.get(0)?,
        git_url: row.get(1)?,
        git_branch: row.get(2)?,
    };
    let image: Option<String> = row.get(3)?;
    let digest: Option<String> = row.get(4)?;
    Ok(match (image, digest) {
        (Some(docker_image), Some(docker_image_sha_hash)) => Linter::Resolved {
            instance: LinterInstance {
                id: meta.id.clone(),
                docker_image,
                docker_image_sha_hash,
            },
            meta,
        },
        _ => Linter::MetaOnly(meta),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<LintTask> {
    let status: String = row.get(7)?;
    Ok(LintTask {
        id: row.get(0)?,
        linter: LinterInstance {
            id: row.get(1)?,
            docker_image: row.get(2)?,
            docker_image_sha_hash: row.get(3)?,
        },
        repo: RepoInstance {
            id: row.get(4)?,
            git_url: row.get(5)?,
            git_commit_hash: row.get(6)?,
        },
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        status_comment: row.get(8)?,
        duration: row.get::<_, Option<i64>>(9)?.map(duration_from_millis),
        created_at: from_millis(row.get(10)?),
        locked_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        linted_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
    })
}

pub(super) fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn duration_from_millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    pub(crate) fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    pub(crate) fn repo_instance(commit: &str) -> RepoInstance {
        RepoInstance {
            id: "gin".to_string(),
            git_url: "https://github.com/gin-gonic/gin".to_string(),
            git_commit_hash: commit.to_string(),
        }
    }

    pub(crate) fn linter_instance(digest: &str) -> LinterInstance {
        LinterInstance {
            id: "govanish".to_string(),
            docker_image: "docker.io/sivukhin/govanish:8.0.0".to_string(),
            docker_image_sha_hash: digest.to_string(),
        }
    }

    pub(crate) fn highlight(path: &str, start: usize, end: usize) -> LintHighlightSnippet {
        LintHighlightSnippet {
            highlight: LintHighlight {
                path: path.to_string(),
                start_line: start,
                end_line: end,
                explanation: "compiler vanished the code".to_string(),
            },
            snippet: HighlightSnippet {
                start_line: start.saturating_sub(2).max(1),
                end_line: end + 2,
                code: "if err != nil {\n\treturn err\n}".to_string(),
            },
        }
    }

    fn succeeded(highlights: Vec<LintHighlightSnippet>) -> LintResult {
        LintResult {
            status: LintStatus::Succeeded,
            status_comment: None,
            duration: Duration::from_millis(1500),
            highlights,
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('repos', 'linters', 'lint_tasks', 'lint_highlights')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 4, "Expected 4 tables to exist");

        // Re-running migrations is a no-op
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_status_check_rejects_unknown_values() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(1_000));
        db.try_add(&task, task.created_at)?;

        let updated = db.conn.execute(
            "UPDATE lint_tasks SET lint_status = 'locked' WHERE lint_id = ?1",
            params![task.id],
        );
        assert!(updated.is_err());
        Ok(())
    }

    #[test]
    fn test_try_add_is_idempotent_per_fingerprint() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let first = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(1_000));
        db.try_add(&first, first.created_at)?;

        // Same fingerprint, fresh id
        let again = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(2_000));
        match db.try_add(&again, again.created_at) {
            Err(StoreError::DuplicateTask { fingerprint }) => {
                assert_eq!(fingerprint, first.fingerprint());
            }
            other => panic!("Expected DuplicateTask, got {:?}", other),
        }

        // A new image digest is a new task
        let rebuilt = LintTask::pending(linter_instance("d2"), repo_instance("c1"), at(3_000));
        db.try_add(&rebuilt, rebuilt.created_at)?;

        assert_eq!(db.list_tasks(None, 10)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_try_take_on_empty_queue() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        assert!(matches!(
            db.try_take(at(0), at(1_000)),
            Err(StoreError::NoTasksAvailable)
        ));
        Ok(())
    }

    #[test]
    fn test_try_take_prefers_oldest_task() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let newer = LintTask::pending(linter_instance("d1"), repo_instance("c2"), at(2_000));
        let older = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(1_000));
        db.try_add(&newer, newer.created_at)?;
        db.try_add(&older, older.created_at)?;

        let taken = db.try_take(at(0), at(5_000))?;
        assert_eq!(taken.id, older.id);
        assert_eq!(taken.locked_at, Some(at(5_000)));
        assert_eq!(taken.status, LintStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_lease_expires_exactly_at_horizon() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let lease = 60_000;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        db.try_add(&task, task.created_at)?;

        let t = 10_000;
        let taken = db.try_take(at(t - lease), at(t))?;
        assert_eq!(taken.id, task.id);

        // One millisecond before the lease runs out the task stays invisible
        let now = t + lease - 1;
        assert!(matches!(
            db.try_take(at(now - lease), at(now)),
            Err(StoreError::NoTasksAvailable)
        ));

        // At exactly T + D it is claimable again
        let now = t + lease;
        let retaken = db.try_take(at(now - lease), at(now))?;
        assert_eq!(retaken.id, task.id);
        assert_eq!(retaken.locked_at, Some(at(now)));
        Ok(())
    }

    #[test]
    fn test_set_writes_status_and_highlights() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        db.try_add(&task, task.created_at)?;
        let taken = db.try_take(at(0), at(100))?;

        let result = succeeded(vec![highlight("a.go", 3, 3), highlight("b.go", 10, 12)]);
        db.set(&taken, &result, at(2_000))?;

        let stored = db.get_task(&task.id)?.expect("task should exist");
        assert_eq!(stored.status, LintStatus::Succeeded);
        assert_eq!(stored.status_comment, None);
        assert_eq!(stored.duration, Some(Duration::from_millis(1500)));
        assert_eq!(stored.linted_at, Some(at(2_000)));

        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM lint_highlights WHERE lint_id = ?1",
            params![task.id],
            |row| row.get(0),
        )?;
        assert_eq!(count, 2);

        // Finalised tasks are never leased again
        assert!(matches!(
            db.try_take(at(10_000), at(10_000)),
            Err(StoreError::NoTasksAvailable)
        ));
        Ok(())
    }

    #[test]
    fn test_set_records_comment_only_on_failure() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let failed = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        let skipped = LintTask::pending(linter_instance("d1"), repo_instance("c2"), at(1));
        db.try_add(&failed, failed.created_at)?;
        db.try_add(&skipped, skipped.created_at)?;
        let failed = db.try_take(at(0), at(5))?;
        let skipped = db.try_take(at(0), at(5))?;
        assert_eq!(failed.repo.git_commit_hash, "c1");

        db.set(
            &failed,
            &LintResult {
                status: LintStatus::Failed,
                status_comment: Some("exit code 2".to_string()),
                duration: Duration::from_secs(1),
                highlights: vec![],
            },
            at(10),
        )?;
        db.set(
            &skipped,
            &LintResult {
                status: LintStatus::Skipped,
                status_comment: Some("ignored".to_string()),
                duration: Duration::from_secs(1),
                highlights: vec![],
            },
            at(10),
        )?;

        let failed = db.get_task(&failed.id)?.unwrap();
        assert_eq!(failed.status, LintStatus::Failed);
        assert_eq!(failed.status_comment.as_deref(), Some("exit code 2"));
        let skipped = db.get_task(&skipped.id)?.unwrap();
        assert_eq!(skipped.status, LintStatus::Skipped);
        assert_eq!(skipped.status_comment, None);
        Ok(())
    }

    #[test]
    fn test_set_twice_is_rejected_without_side_effects() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        db.try_add(&task, task.created_at)?;
        let task = db.try_take(at(0), at(5))?;
        db.set(&task, &succeeded(vec![highlight("a.go", 1, 1)]), at(10))?;

        let result = db.set(&task, &succeeded(vec![highlight("z.go", 5, 5)]), at(20));
        assert!(matches!(result, Err(StoreError::NotPending { .. })));

        let paths: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT path FROM lint_highlights WHERE lint_id = ?1")?;
            stmt.query_map(params![task.id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        assert_eq!(paths, vec!["a.go".to_string()]);
        assert_eq!(db.get_task(&task.id)?.unwrap().linted_at, Some(at(10)));
        Ok(())
    }

    #[test]
    fn test_pending_result_records_attempt_and_keeps_lease() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let lease = 60_000;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        db.try_add(&task, task.created_at)?;
        let taken = db.try_take(at(100 - lease), at(100))?;

        let retry = LintResult {
            status: LintStatus::Pending,
            status_comment: Some("clone failed".to_string()),
            duration: Duration::from_millis(700),
            highlights: vec![],
        };
        db.set(&taken, &retry, at(800))?;

        let stored = db.get_task(&task.id)?.unwrap();
        assert_eq!(stored.status, LintStatus::Pending);
        assert_eq!(stored.status_comment.as_deref(), Some("clone failed"));
        assert_eq!(stored.duration, Some(Duration::from_millis(700)));
        assert_eq!(stored.linted_at, Some(at(800)));
        assert_eq!(stored.locked_at, Some(at(100)));

        // The retry waits for the lease to run out
        assert!(matches!(
            db.try_take(at(1_000 - lease), at(1_000)),
            Err(StoreError::NoTasksAvailable)
        ));
        let retried = db.try_take(at(100), at(100 + lease))?;
        assert_eq!(retried.id, task.id);

        // A retry outcome never carries findings
        let with_highlights = LintResult {
            highlights: vec![highlight("a.go", 1, 1)],
            ..retry
        };
        assert!(matches!(
            db.set(&retried, &with_highlights, at(200_000)),
            Err(StoreError::Database(_))
        ));
        Ok(())
    }

    #[test]
    fn test_expired_lease_holder_cannot_write() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let lease = 60_000;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        db.try_add(&task, task.created_at)?;

        let t = 10_000;
        let first = db.try_take(at(t - lease), at(t))?;
        let second = db.try_take(at(t), at(t + lease))?;
        assert_eq!(first.id, second.id);

        assert!(matches!(
            db.set(&first, &succeeded(vec![highlight("stale.go", 1, 1)]), at(t + lease + 1)),
            Err(StoreError::LeaseLost { .. })
        ));
        db.set(&second, &succeeded(vec![highlight("a.go", 1, 1)]), at(t + lease + 2))?;

        let stored = db.get_task(&task.id)?.unwrap();
        assert_eq!(stored.status, LintStatus::Succeeded);
        assert_eq!(stored.linted_at, Some(at(t + lease + 2)));
        let paths: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT path FROM lint_highlights WHERE lint_id = ?1")?;
            stmt.query_map(params![task.id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        assert_eq!(paths, vec!["a.go".to_string()]);
        Ok(())
    }

    #[test]
    fn test_set_without_lease_is_rejected() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let task = LintTask::pending(linter_instance("d1"), repo_instance("c1"), at(0));
        db.try_add(&task, task.created_at)?;
        assert!(matches!(
            db.set(&task, &succeeded(vec![]), at(1)),
            Err(StoreError::LeaseLost { .. })
        ));
        assert_eq!(db.get_task(&task.id)?.unwrap().status, LintStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_repo_upsert_keeps_resolved_commit() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let meta = RepoMeta {
            id: "gin".to_string(),
            git_url: "https://github.com/gin-gonic/gin".to_string(),
            git_branch: "master".to_string(),
        };
        db.add_or_update_repo(&Repo::MetaOnly(meta.clone()), at(0))?;
        assert_eq!(db.get_repo("gin")?, Some(Repo::MetaOnly(meta.clone())));

        let resolved = Repo::MetaOnly(meta.clone()).resolve("bb3519d2");
        db.add_or_update_repo(&resolved, at(1))?;

        // Re-registering the same meta does not lose the commit
        db.add_or_update_repo(&Repo::MetaOnly(meta.clone()), at(2))?;
        assert_eq!(db.get_repo("gin")?, Some(resolved));

        // Pointing the repo at another branch does
        let moved = RepoMeta {
            git_branch: "develop".to_string(),
            ..meta
        };
        db.add_or_update_repo(&Repo::MetaOnly(moved.clone()), at(3))?;
        assert_eq!(db.get_repo("gin")?, Some(Repo::MetaOnly(moved)));

        assert!(db.delete_repo("gin")?);
        assert!(!db.delete_repo("gin")?);
        assert!(db.list_repos()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_linter_upsert_and_list() -> Result<()> {
        let db = BugHuntDb::new_in_memory()?;
        let meta = LinterMeta {
            id: "govanish".to_string(),
            git_url: "https://github.com/sivukhin/govanish".to_string(),
            git_branch: "main".to_string(),
        };
        db.add_or_update_linter(&Linter::MetaOnly(meta.clone()), at(0))?;
        assert_eq!(db.list_linters()?, vec![Linter::MetaOnly(meta.clone())]);

        let resolved = Linter::Resolved {
            meta: meta.clone(),
            instance: linter_instance("4257681a"),
        };
        db.add_or_update_linter(&resolved, at(1))?;
        db.add_or_update_linter(&Linter::MetaOnly(meta), at(2))?;
        assert_eq!(db.get_linter("govanish")?, Some(resolved));
        assert!(db.delete_linter("govanish")?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_leases_are_exclusive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bughunt.db");
        let seed = BugHuntDb::open(&path, Duration::from_secs(5))?;
        for i in 0..8 {
            let task = LintTask::pending(
                linter_instance("d1"),
                repo_instance(&format!("c{}", i)),
                at(i),
            );
            seed.try_add(&task, task.created_at)?;
        }

        // Independent connections, as separate worker processes would have
        let mut handles = Vec::new();
        for _ in 0..4 {
            let db = Arc::new(DbHandle::open(&path, Duration::from_secs(5))?);
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                loop {
                    let result = db
                        .call(|db| db.try_take(at(0), at(1_000)))
                        .await;
                    match result {
                        Ok(task) => taken.push(task.id),
                        Err(StoreError::NoTasksAvailable) => break,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                taken
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await?);
        }
        ids.sort();
        let total = ids.len();
        ids.dedup();
        assert_eq!(total, 8, "every task leased exactly once");
        assert_eq!(ids.len(), 8);
        Ok(())
    }
}
