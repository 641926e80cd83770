//! The repo scheduler: keeps tracked repositories pinned to their branch head
//! and enqueues one lint task per (repository, linter) pair.
//!
//! ```text
//! periodic ──▶ list-repos ──▶ refresh-repo ──▶ schedule ──▶ drain
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::errors::StoreError;
use crate::git::GitFetcher;
use crate::models::{GitRef, LintTask, LinterInstance, Repo, RepoInstance, resolved_linters};
use crate::pipeline::{self, Producer, Scope, Stage, Triggers, drain, periodic, stage};
use crate::storage::{LinterStore, RepoStore, TaskQueue};

/// Outcome of scheduling one (repository, linter) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Added { task_id: String },
    Duplicate,
}

/// Enqueue a fresh task for `repo` × `linter`. An existing task with the same
/// fingerprint is a normal outcome, not an error.
pub async fn manage_once(
    queue: &dyn TaskQueue,
    repo: &RepoInstance,
    linter: &LinterInstance,
    now: DateTime<Utc>,
) -> Result<ScheduleOutcome, StoreError> {
    let task = LintTask::pending(linter.clone(), repo.clone(), now);
    match queue.try_add(&task, now).await {
        Ok(()) => {
            info!(task_id = %task.id, repo = %repo, linter = %linter, "Added lint task");
            Ok(ScheduleOutcome::Added { task_id: task.id })
        }
        Err(StoreError::DuplicateTask { fingerprint }) => {
            info!(fingerprint = %fingerprint, "Lint task already scheduled");
            Ok(ScheduleOutcome::Duplicate)
        }
        Err(e) => Err(e),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    repos: Arc<dyn RepoStore>,
    linters: Arc<dyn LinterStore>,
    queue: Arc<dyn TaskQueue>,
    git: Arc<dyn GitFetcher>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        repos: Arc<dyn RepoStore>,
        linters: Arc<dyn LinterStore>,
        queue: Arc<dyn TaskQueue>,
        git: Arc<dyn GitFetcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repos,
            linters,
            queue,
            git,
            config,
        }
    }

    fn chain(&self, root: Triggers<()>) -> Triggers<()> {
        let repos = stage(
            "list-repos",
            root,
            self.config.fetch_timeout(),
            ListRepos {
                repos: self.repos.clone(),
            },
        );
        let refreshed = stage(
            "refresh-repo",
            repos,
            self.config.refresh_timeout(),
            RefreshRepo {
                repos: self.repos.clone(),
                git: self.git.clone(),
                scratch_dir: self.config.scratch_dir(),
            },
        );
        stage(
            "schedule",
            refreshed,
            self.config.schedule_timeout(),
            ScheduleRepo {
                linters: self.linters.clone(),
                queue: self.queue.clone(),
            },
        )
    }

    /// Run until `token` is cancelled.
    pub async fn run_forever(&self, token: CancellationToken) {
        info!(
            fail_delay = ?self.config.fail_delay(),
            success_delay = ?self.config.success_delay(),
            fetch_timeout = ?self.config.fetch_timeout(),
            refresh_timeout = ?self.config.refresh_timeout(),
            schedule_timeout = ?self.config.schedule_timeout(),
            "Scheduler started"
        );
        let root = periodic(token, self.config.fail_delay(), self.config.success_delay());
        drain(self.chain(root)).await;
        info!("Scheduler stopped");
    }

    /// A single pass over every repository.
    pub async fn run_once(&self, token: CancellationToken) -> Result<()> {
        let (source, root) = pipeline::channel();
        let sink = tokio::spawn(drain(self.chain(root)));
        let result = source.emit(Scope::root(token), ()).await;
        drop(source);
        sink.await.context("Scheduler sink panicked")?;
        result
    }
}

struct ListRepos {
    repos: Arc<dyn RepoStore>,
}

#[async_trait]
impl Stage<(), Repo> for ListRepos {
    async fn run(&self, scope: &Scope, _item: (), out: &Producer<Repo>) -> Result<()> {
        let repos = scope
            .run(self.repos.list_repos())
            .await?
            .context("Failed to list repos")?;
        info!(count = repos.len(), "Listed repos");
        for repo in repos {
            out.produce(repo);
        }
        Ok(())
    }
}

struct RefreshRepo {
    repos: Arc<dyn RepoStore>,
    git: Arc<dyn GitFetcher>,
    scratch_dir: PathBuf,
}

impl RefreshRepo {
    async fn refresh(&self, scope: &Scope, repo: &Repo) -> Result<Repo> {
        let meta = repo.meta();
        std::fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("Failed to create {}", self.scratch_dir.display()))?;
        let checkout = tempfile::Builder::new()
            .prefix("repo_clone_")
            .tempdir_in(&self.scratch_dir)
            .context("Failed to create checkout directory")?;

        let head = self
            .git
            .fetch(
                scope,
                &meta.git_url,
                &GitRef::Branch(meta.git_branch.clone()),
                checkout.path(),
            )
            .await
            .with_context(|| format!("Failed to fetch repo {}", meta.id))?;
        if let Err(e) = checkout.close() {
            warn!(repo = %meta.id, error = %e, "Failed to remove checkout");
        }

        let updated = repo.resolve(&head);
        scope
            .run(self.repos.add_or_update_repo(&updated, Utc::now()))
            .await?
            .with_context(|| format!("Failed to store repo {}", meta.id))?;
        Ok(updated)
    }
}

#[async_trait]
impl Stage<Repo, Repo> for RefreshRepo {
    async fn run(&self, scope: &Scope, repo: Repo, out: &Producer<Repo>) -> Result<()> {
        info!(repo = %repo.meta().id, branch = %repo.meta().git_branch, "Refreshing repo");
        let updated = self
            .refresh(scope, &repo)
            .await
            .with_context(|| format!("Refresh of repo {} failed", repo.meta().id))?;
        if let Some(instance) = updated.instance() {
            info!(repo = %instance, "Refreshed repo");
        }
        out.produce(updated);
        Ok(())
    }
}

struct ScheduleRepo {
    linters: Arc<dyn LinterStore>,
    queue: Arc<dyn TaskQueue>,
}

#[async_trait]
impl Stage<Repo, ()> for ScheduleRepo {
    async fn run(&self, scope: &Scope, repo: Repo, _out: &Producer<()>) -> Result<()> {
        let Some(instance) = repo.instance() else {
            warn!(repo = %repo.meta().id, "Repo has no resolved commit, nothing to schedule");
            return Ok(());
        };
        let all = scope
            .run(self.linters.list_linters())
            .await?
            .context("Failed to list linters")?;
        let linters = resolved_linters(&all);
        info!(total = all.len(), resolved = linters.len(), repo = %instance.id, "Scheduling linters");

        for linter in &linters {
            let outcome = scope
                .run(manage_once(self.queue.as_ref(), instance, linter, Utc::now()))
                .await?;
            if let Err(e) = outcome {
                error!(repo = %instance, linter = %linter, error = %e, "Failed to schedule lint task");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitError;
    use crate::models::{LintResult, Linter, LinterMeta, LintStatus, RepoMeta};
    use crate::storage::DbHandle;
    use std::path::Path;
    use std::sync::Mutex;

    struct BranchHeads {
        head: String,
        fetched: Mutex<Vec<(String, GitRef, bool)>>,
    }

    #[async_trait]
    impl GitFetcher for BranchHeads {
        async fn fetch(
            &self,
            _scope: &Scope,
            url: &str,
            git_ref: &GitRef,
            target: &Path,
        ) -> Result<String, GitError> {
            self.fetched
                .lock()
                .unwrap()
                .push((url.to_string(), git_ref.clone(), target.exists()));
            if url.contains("broken") {
                return Err(GitError::FetchBranch {
                    url: url.to_string(),
                    branch: git_ref.name().to_string(),
                    message: "not found".to_string(),
                });
            }
            Ok(self.head.clone())
        }
    }

    fn repo(id: &str, url: &str) -> Repo {
        Repo::MetaOnly(RepoMeta {
            id: id.to_string(),
            git_url: url.to_string(),
            git_branch: "master".to_string(),
        })
    }

    fn linter(id: &str, digest: Option<&str>) -> Linter {
        let meta = LinterMeta {
            id: id.to_string(),
            git_url: format!("https://github.com/example/{}", id),
            git_branch: "main".to_string(),
        };
        match digest {
            None => Linter::MetaOnly(meta),
            Some(digest) => Linter::Resolved {
                instance: LinterInstance {
                    id: id.to_string(),
                    docker_image: format!("docker.io/example/{}:1", id),
                    docker_image_sha_hash: digest.to_string(),
                },
                meta,
            },
        }
    }

    fn scheduler(db: &DbHandle, git: Arc<BranchHeads>, scratch: &Path) -> Scheduler {
        let config = SchedulerConfig {
            scratch_dir: Some(scratch.to_path_buf()),
            ..Default::default()
        };
        let store = Arc::new(db.clone());
        Scheduler::new(store.clone(), store.clone(), store, git, config)
    }

    fn git(head: &str) -> Arc<BranchHeads> {
        Arc::new(BranchHeads {
            head: head.to_string(),
            fetched: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_manage_once_is_idempotent() {
        let db = DbHandle::in_memory().unwrap();
        let repo = repo("gin", "https://github.com/gin-gonic/gin")
            .resolve("c1")
            .instance()
            .cloned()
            .unwrap();
        let linter = linter("govanish", Some("d1")).instance().cloned().unwrap();

        let first = manage_once(&db, &repo, &linter, Utc::now()).await.unwrap();
        assert!(matches!(first, ScheduleOutcome::Added { .. }));
        let second = manage_once(&db, &repo, &linter, Utc::now()).await.unwrap();
        assert_eq!(second, ScheduleOutcome::Duplicate);

        let tasks = db
            .call(|db| db.list_tasks(None, 10).map_err(StoreError::from))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, LintStatus::Pending);
    }

    #[tokio::test]
    async fn test_pass_refreshes_and_schedules_resolved_linters() {
        let db = DbHandle::in_memory().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        db.call(|db| -> Result<(), StoreError> {
            db.add_or_update_repo(&repo("gin", "https://github.com/gin-gonic/gin"), Utc::now())?;
            db.add_or_update_linter(&linter("govanish", Some("d1")), Utc::now())?;
            db.add_or_update_linter(&linter("unbuilt", None), Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();

        let git = git("c0ffee");
        let scheduler = scheduler(&db, git.clone(), scratch.path());
        scheduler.run_once(CancellationToken::new()).await.unwrap();

        let repos = db.list_repos().await.unwrap();
        assert_eq!(repos[0].instance().unwrap().git_commit_hash, "c0ffee");

        let fetched = git.fetched.lock().unwrap().clone();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].1, GitRef::Branch("master".to_string()));
        assert!(fetched[0].2, "checkout directory exists during fetch");
        // Scratch checkouts are removed
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

        let tasks = db
            .call(|db| db.list_tasks(None, 10).map_err(StoreError::from))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].linter.id, "govanish");
        assert_eq!(tasks[0].repo.git_commit_hash, "c0ffee");

        // Same head and image: nothing new
        scheduler.run_once(CancellationToken::new()).await.unwrap();
        let tasks = db
            .call(|db| db.list_tasks(None, 10).map_err(StoreError::from))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_block_other_repos() {
        let db = DbHandle::in_memory().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        db.call(|db| -> Result<(), StoreError> {
            db.add_or_update_repo(&repo("broken", "https://example.com/broken"), Utc::now())?;
            db.add_or_update_repo(&repo("gin", "https://github.com/gin-gonic/gin"), Utc::now())?;
            db.add_or_update_linter(&linter("govanish", Some("d1")), Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();

        let scheduler = scheduler(&db, git("c0ffee"), scratch.path());
        let err = scheduler
            .run_once(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));

        let tasks = db
            .call(|db| db.list_tasks(None, 10).map_err(StoreError::from))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].repo.id, "gin");
    }

    /// Fails every insert for one linter and passes the rest through.
    struct FailingQueue {
        inner: DbHandle,
        failing_linter: String,
    }

    #[async_trait]
    impl TaskQueue for FailingQueue {
        async fn try_add(&self, task: &LintTask, now: DateTime<Utc>) -> Result<(), StoreError> {
            if task.linter.id == self.failing_linter {
                return Err(StoreError::Database(anyhow::anyhow!("disk I/O error")));
            }
            self.inner.try_add(task, now).await
        }

        async fn try_take(
            &self,
            lease_horizon: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<LintTask, StoreError> {
            self.inner.try_take(lease_horizon, now).await
        }

        async fn set(
            &self,
            task: &LintTask,
            result: &LintResult,
            completed_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.set(task, result, completed_at).await
        }
    }

    #[tokio::test]
    async fn test_failed_pair_does_not_abort_remaining_linters() {
        let db = DbHandle::in_memory().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        db.call(|db| -> Result<(), StoreError> {
            db.add_or_update_repo(&repo("gin", "https://github.com/gin-gonic/gin"), Utc::now())?;
            db.add_or_update_linter(&linter("alpha", Some("d1")), Utc::now())?;
            db.add_or_update_linter(&linter("flaky", Some("d2")), Utc::now())?;
            db.add_or_update_linter(&linter("omega", Some("d3")), Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();

        let config = SchedulerConfig {
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..Default::default()
        };
        let store = Arc::new(db.clone());
        let queue = Arc::new(FailingQueue {
            inner: db.clone(),
            failing_linter: "flaky".to_string(),
        });
        let scheduler = Scheduler::new(store.clone(), store, queue, git("c0ffee"), config);
        scheduler.run_once(CancellationToken::new()).await.unwrap();

        let tasks = db
            .call(|db| db.list_tasks(None, 10).map_err(StoreError::from))
            .await
            .unwrap();
        let mut linters: Vec<_> = tasks.iter().map(|t| t.linter.id.clone()).collect();
        linters.sort();
        assert_eq!(linters, vec!["alpha", "omega"]);
    }
}
