//! Persistence seams used by the scheduler and the worker, and their SQLite
//! implementation.
//!
//! The traits are what the pipelines depend on; [`DbHandle`] implements all of
//! them over one shared SQLite file, so any number of scheduler and worker
//! processes can cooperate through it.

mod db;
mod highlights;

pub use db::{BugHuntDb, DbHandle};
pub use highlights::{HighlightFilter, LinterStats, moderation_now};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::models::{LintResult, LintTask, Linter, Repo};

/// The durable lint task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `task` as created at `now`; fails with `DuplicateTask` if its
    /// fingerprint exists in any status.
    async fn try_add(&self, task: &LintTask, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Lease one pending task whose lock is absent or not newer than
    /// `lease_horizon`; fails with `NoTasksAvailable` otherwise.
    async fn try_take(
        &self,
        lease_horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LintTask, StoreError>;

    /// Atomically write the outcome and highlights of the leased `task`.
    /// Fails with `LeaseLost` once another worker holds the lease.
    async fn set(
        &self,
        task: &LintTask,
        result: &LintResult,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn list_repos(&self) -> Result<Vec<Repo>, StoreError>;
    async fn add_or_update_repo(&self, repo: &Repo, updated_at: DateTime<Utc>)
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait LinterStore: Send + Sync {
    async fn list_linters(&self) -> Result<Vec<Linter>, StoreError>;
}

#[async_trait]
impl TaskQueue for DbHandle {
    async fn try_add(&self, task: &LintTask, now: DateTime<Utc>) -> Result<(), StoreError> {
        let task = task.clone();
        self.call(move |db| db.try_add(&task, now)).await
    }

    async fn try_take(
        &self,
        lease_horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LintTask, StoreError> {
        self.call(move |db| db.try_take(lease_horizon, now)).await
    }

    async fn set(
        &self,
        task: &LintTask,
        result: &LintResult,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let task = task.clone();
        let result = result.clone();
        self.call(move |db| db.set(&task, &result, completed_at))
            .await
    }
}

#[async_trait]
impl RepoStore for DbHandle {
    async fn list_repos(&self) -> Result<Vec<Repo>, StoreError> {
        self.call(|db| db.list_repos().map_err(StoreError::from))
            .await
    }

    async fn add_or_update_repo(
        &self,
        repo: &Repo,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let repo = repo.clone();
        self.call(move |db| {
            db.add_or_update_repo(&repo, updated_at)
                .map_err(StoreError::from)
        })
        .await
    }
}

#[async_trait]
impl LinterStore for DbHandle {
    async fn list_linters(&self) -> Result<Vec<Linter>, StoreError> {
        self.call(|db| db.list_linters().map_err(StoreError::from))
            .await
    }
}
