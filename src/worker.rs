//! The lint worker: reclaims sandbox headroom, leases one task, runs it and
//! writes the outcome back.
//!
//! ```text
//! periodic ──▶ cleanup ──▶ take ──▶ lint ──▶ persist ──▶ drain
//! ```
//!
//! Any number of workers may share one queue; the lease taken by `take` is the
//! only coordination between them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::errors::{LintError, StoreError};
use crate::git::GitFetcher;
use crate::lint::Linting;
use crate::models::{LintHighlightSnippet, LintResult, LintStatus, LintTask};
use crate::pipeline::{self, Producer, Scope, Stage, Triggers, drain, periodic, stage};
use crate::sandbox::Sandbox;
use crate::storage::TaskQueue;

/// A finished lint run on its way to the queue.
#[derive(Debug)]
pub struct LintOutcome {
    pub task: LintTask,
    pub result: Result<Vec<LintHighlightSnippet>, LintError>,
    pub duration: Duration,
}

impl LintOutcome {
    /// The result to store. A temporary failure stays `pending` with its
    /// duration recorded, and is retried once the lease expires.
    pub fn to_result(&self) -> LintResult {
        let (status, status_comment, highlights) = match &self.result {
            Ok(highlights) => (LintStatus::Succeeded, None, highlights.clone()),
            Err(LintError::Skipped) => (LintStatus::Skipped, None, Vec::new()),
            Err(e @ LintError::Fatal(_)) => (LintStatus::Failed, Some(e.to_string()), Vec::new()),
            Err(e @ LintError::Temporary(_)) => {
                (LintStatus::Pending, Some(e.to_string()), Vec::new())
            }
        };
        LintResult {
            status,
            status_comment,
            duration: self.duration,
            highlights,
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    sandbox: Arc<dyn Sandbox>,
    linting: Arc<Linting>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        sandbox: Arc<dyn Sandbox>,
        git: Arc<dyn GitFetcher>,
        config: WorkerConfig,
    ) -> Self {
        let linting = Linting::new(
            git,
            sandbox.clone(),
            config.scratch_dir(),
            config.mount_path.clone(),
        );
        Self {
            queue,
            sandbox,
            linting: Arc::new(linting),
            config,
        }
    }

    fn chain(&self, root: Triggers<()>) -> Triggers<()> {
        let cleaned = stage(
            "cleanup",
            root,
            self.config.cleanup_timeout(),
            Cleanup {
                sandbox: self.sandbox.clone(),
            },
        );
        let taken = stage(
            "take",
            cleaned,
            self.config.take_timeout(),
            Take {
                queue: self.queue.clone(),
                lock_duration: self.config.lock_duration(),
            },
        );
        let linted = stage(
            "lint",
            taken,
            self.config.lint_timeout(),
            Lint {
                linting: self.linting.clone(),
            },
        );
        stage(
            "persist",
            linted,
            self.config.update_timeout(),
            Persist {
                queue: self.queue.clone(),
            },
        )
    }

    /// Run until `token` is cancelled.
    pub async fn run_forever(&self, token: CancellationToken) {
        info!(
            fail_delay = ?self.config.fail_delay(),
            success_delay = ?self.config.success_delay(),
            cleanup_timeout = ?self.config.cleanup_timeout(),
            take_timeout = ?self.config.take_timeout(),
            lint_timeout = ?self.config.lint_timeout(),
            update_timeout = ?self.config.update_timeout(),
            lock_duration = ?self.config.lock_duration(),
            "Worker started"
        );
        let root = periodic(token, self.config.fail_delay(), self.config.success_delay());
        drain(self.chain(root)).await;
        info!("Worker stopped");
    }

    /// A single cleanup, take, lint and persist iteration.
    pub async fn run_once(&self, token: CancellationToken) -> Result<()> {
        let (source, root) = pipeline::channel();
        let sink = tokio::spawn(drain(self.chain(root)));
        let result = source.emit(Scope::root(token), ()).await;
        drop(source);
        sink.await.context("Worker sink panicked")?;
        result
    }
}

struct Cleanup {
    sandbox: Arc<dyn Sandbox>,
}

#[async_trait]
impl Stage<(), ()> for Cleanup {
    async fn run(&self, scope: &Scope, _item: (), out: &Producer<()>) -> Result<()> {
        let report = self
            .sandbox
            .cleanup(scope)
            .await
            .context("Sandbox cleanup failed")?;
        info!(reclaimed = report.total(), failed_steps = ?report.failed_steps, "Sandbox cleaned up");
        out.produce(());
        Ok(())
    }
}

struct Take {
    queue: Arc<dyn TaskQueue>,
    lock_duration: Duration,
}

#[async_trait]
impl Stage<(), LintTask> for Take {
    async fn run(&self, scope: &Scope, _item: (), out: &Producer<LintTask>) -> Result<()> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lock_duration)
            .context("Lock duration out of range")?;
        match scope.run(self.queue.try_take(now - lease, now)).await? {
            Ok(task) => {
                info!(task_id = %task.id, repo = %task.repo, linter = %task.linter, "Took lint task");
                out.produce(task);
                Ok(())
            }
            Err(StoreError::NoTasksAvailable) => {
                info!("No lint tasks available");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to take lint task"),
        }
    }
}

struct Lint {
    linting: Arc<Linting>,
}

#[async_trait]
impl Stage<LintTask, LintOutcome> for Lint {
    async fn run(&self, scope: &Scope, task: LintTask, out: &Producer<LintOutcome>) -> Result<()> {
        let started = Instant::now();
        let result = self.linting.run(scope, &task.repo, &task.linter).await;
        out.produce(LintOutcome {
            task,
            result,
            duration: started.elapsed(),
        });
        Ok(())
    }
}

struct Persist {
    queue: Arc<dyn TaskQueue>,
}

#[async_trait]
impl Stage<LintOutcome, ()> for Persist {
    async fn run(&self, scope: &Scope, outcome: LintOutcome, _out: &Producer<()>) -> Result<()> {
        let task_id = outcome.task.id.clone();
        let result = outcome.to_result();

        scope
            .run(self.queue.set(&outcome.task, &result, Utc::now()))
            .await?
            .with_context(|| format!("Failed to store result of lint task {}", task_id))?;
        info!(
            task_id = %task_id,
            status = result.status.as_str(),
            highlights = result.highlights.len(),
            duration = ?result.duration,
            "Stored lint result"
        );

        match outcome.result {
            Err(e @ LintError::Fatal(_)) => {
                Err(anyhow!(e).context(format!("Lint task {} failed", task_id)))
            }
            Err(e @ LintError::Temporary(_)) => {
                warn!(task_id = %task_id, "Lint failed temporarily, retry after lease expiry");
                Err(anyhow!(e).context(format!("Lint task {} will be retried", task_id)))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SandboxError;
    use crate::lint::fakes::{FakeGit, FakeOutcome, FakeSandbox};
    use crate::models::{LinterInstance, RepoInstance};
    use crate::sandbox::CleanupReport;
    use crate::storage::DbHandle;
    use std::path::Path;

    fn task() -> LintTask {
        LintTask::pending(
            LinterInstance {
                id: "govanish".to_string(),
                docker_image: "docker.io/sivukhin/govanish:8.0.0".to_string(),
                docker_image_sha_hash: "4257681a".to_string(),
            },
            RepoInstance {
                id: "gin".to_string(),
                git_url: "https://github.com/gin-gonic/gin".to_string(),
                git_commit_hash: "bb3519d2".to_string(),
            },
            Utc::now(),
        )
    }

    fn outcome(result: Result<Vec<LintHighlightSnippet>, LintError>) -> LintOutcome {
        LintOutcome {
            task: task(),
            result,
            duration: Duration::from_millis(1234),
        }
    }

    #[test]
    fn test_outcome_mapping() {
        let ok = outcome(Ok(vec![])).to_result();
        assert_eq!(ok.status, LintStatus::Succeeded);
        assert_eq!(ok.duration, Duration::from_millis(1234));

        let skipped = outcome(Err(LintError::Skipped)).to_result();
        assert_eq!(skipped.status, LintStatus::Skipped);
        assert!(skipped.status_comment.is_none());

        let failed = outcome(Err(LintError::Fatal(anyhow!("exit code 2")))).to_result();
        assert_eq!(failed.status, LintStatus::Failed);
        assert!(failed.status_comment.unwrap().contains("exit code 2"));

        let retry = outcome(Err(LintError::Temporary(anyhow!("clone failed")))).to_result();
        assert_eq!(retry.status, LintStatus::Pending);
        assert_eq!(retry.duration, Duration::from_millis(1234));
        assert!(retry.status_comment.unwrap().contains("clone failed"));
        assert!(retry.highlights.is_empty());
    }

    struct NoDaemon;

    #[async_trait]
    impl Sandbox for NoDaemon {
        async fn exec(
            &self,
            _scope: &Scope,
            _image: &str,
            _mount_path: &str,
            _host_dir: &Path,
        ) -> Result<Vec<String>, SandboxError> {
            panic!("exec must not run without cleanup");
        }

        async fn cleanup(&self, _scope: &Scope) -> Result<CleanupReport, SandboxError> {
            Err(SandboxError::Cancelled)
        }
    }

    fn worker(db: &DbHandle, sandbox: Arc<dyn Sandbox>, git: Arc<FakeGit>) -> (Worker, tempfile::TempDir) {
        let scratch = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..Default::default()
        };
        (Worker::new(Arc::new(db.clone()), sandbox, git, config), scratch)
    }

    async fn tasks(db: &DbHandle) -> Vec<LintTask> {
        db.call(|db| db.list_tasks(None, 10).map_err(StoreError::from))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_cleanup_skips_claim() {
        let db = DbHandle::in_memory().unwrap();
        db.try_add(&task(), Utc::now()).await.unwrap();
        let (worker, _scratch) = worker(&db, Arc::new(NoDaemon), Arc::new(FakeGit::with_files(&[])));

        assert!(worker.run_once(CancellationToken::new()).await.is_err());
        assert!(tasks(&db).await[0].locked_at.is_none());
    }

    #[tokio::test]
    async fn test_idle_queue_is_success() {
        let db = DbHandle::in_memory().unwrap();
        let sandbox = Arc::new(FakeSandbox::lines(&[]));
        let (worker, _scratch) = worker(&db, sandbox.clone(), Arc::new(FakeGit::with_files(&[])));
        worker.run_once(CancellationToken::new()).await.unwrap();
        assert!(sandbox.images.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_iteration_stores_highlights() {
        let db = DbHandle::in_memory().unwrap();
        db.try_add(&task(), Utc::now()).await.unwrap();
        let git = Arc::new(FakeGit::with_files(&[("main.go", "package main\n\nfunc main() {}\n")]));
        let sandbox = Arc::new(FakeSandbox::lines(&["::warning file=main.go,line=3::vanished"]));
        let (worker, _scratch) = worker(&db, sandbox, git);

        worker.run_once(CancellationToken::new()).await.unwrap();

        let stored = tasks(&db).await;
        assert_eq!(stored[0].status, LintStatus::Succeeded);
        assert!(stored[0].duration.is_some());
        assert!(stored[0].linted_at.is_some());
        let highlights = db
            .call(|db| {
                db.list_highlights(&Default::default())
                    .map_err(StoreError::from)
            })
            .await
            .unwrap();
        assert_eq!(highlights.len(), 1);
        assert_eq!(highlights[0].highlight.highlight.explanation, "vanished");
    }

    #[tokio::test]
    async fn test_tool_failure_is_recorded() {
        let db = DbHandle::in_memory().unwrap();
        db.try_add(&task(), Utc::now()).await.unwrap();
        let sandbox = Arc::new(FakeSandbox::new(FakeOutcome::ExitCode(2)));
        let (worker, _scratch) = worker(&db, sandbox, Arc::new(FakeGit::with_files(&[])));

        assert!(worker.run_once(CancellationToken::new()).await.is_err());

        let stored = tasks(&db).await;
        assert_eq!(stored[0].status, LintStatus::Failed);
        assert!(
            stored[0]
                .status_comment
                .as_deref()
                .unwrap()
                .contains("non-zero code 2")
        );
    }

    #[tokio::test]
    async fn test_temporary_failure_keeps_task_pending() {
        let db = DbHandle::in_memory().unwrap();
        db.try_add(&task(), Utc::now()).await.unwrap();
        let mut git = FakeGit::with_files(&[]);
        git.fail = true;
        let sandbox = Arc::new(FakeSandbox::lines(&[]));
        let (worker, _scratch) = worker(&db, sandbox, Arc::new(git));

        assert!(worker.run_once(CancellationToken::new()).await.is_err());

        let stored = tasks(&db).await;
        assert_eq!(stored[0].status, LintStatus::Pending);
        assert!(stored[0].locked_at.is_some());
        assert!(stored[0].duration.is_some());
        assert!(stored[0].linted_at.is_some());
        assert!(
            stored[0]
                .status_comment
                .as_deref()
                .unwrap()
                .contains("network unreachable")
        );

        // Still leased, so an immediate second iteration finds nothing to do
        worker.run_once(CancellationToken::new()).await.unwrap();
        assert_eq!(tasks(&db).await[0].duration, stored[0].duration);
    }

    #[tokio::test]
    async fn test_skipped_run_is_recorded() {
        let db = DbHandle::in_memory().unwrap();
        db.try_add(&task(), Utc::now()).await.unwrap();
        let sandbox = Arc::new(FakeSandbox::lines(&["::skip"]));
        let (worker, _scratch) = worker(&db, sandbox, Arc::new(FakeGit::with_files(&[])));

        worker.run_once(CancellationToken::new()).await.unwrap();
        assert_eq!(tasks(&db).await[0].status, LintStatus::Skipped);
    }
}
