//! Domain types shared by the scheduler, the worker and the storage layer.
//!
//! Tracked entities come in two flavours: a stable *meta* identity created by
//! configuration, and an optional resolved *instance* (a concrete commit for a
//! repo, a concrete image digest for a linter). The "not yet resolved" state is
//! a variant of its own rather than a nullable field.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a tracked repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMeta {
    pub id: String,
    pub git_url: String,
    pub git_branch: String,
}

/// A resolved repository snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInstance {
    pub id: String,
    pub git_url: String,
    pub git_commit_hash: String,
}

impl fmt::Display for RepoInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]({}, {})", self.id, self.git_url, self.git_commit_hash)
    }
}

/// A tracked repository, resolved once the first fetch has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Repo {
    MetaOnly(RepoMeta),
    Resolved { meta: RepoMeta, instance: RepoInstance },
}

impl Repo {
    pub fn meta(&self) -> &RepoMeta {
        match self {
            Self::MetaOnly(meta) | Self::Resolved { meta, .. } => meta,
        }
    }

    pub fn instance(&self) -> Option<&RepoInstance> {
        match self {
            Self::MetaOnly(_) => None,
            Self::Resolved { instance, .. } => Some(instance),
        }
    }

    /// Pin this repository to `commit_hash`, replacing any previous instance.
    pub fn resolve(&self, commit_hash: &str) -> Self {
        let meta = self.meta().clone();
        let instance = RepoInstance {
            id: meta.id.clone(),
            git_url: meta.git_url.clone(),
            git_commit_hash: commit_hash.to_string(),
        };
        Self::Resolved { meta, instance }
    }
}

/// Stable identity of a linter (the location of its own source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinterMeta {
    pub id: String,
    pub git_url: String,
    pub git_branch: String,
}

/// A runnable linter snapshot: a published image and its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinterInstance {
    pub id: String,
    pub docker_image: String,
    pub docker_image_sha_hash: String,
}

impl LinterInstance {
    /// Image reference pinned to the fingerprinted digest.
    ///
    /// Images that already carry a digest (`name@sha256:...`) are returned
    /// unchanged; bare hex digests get the `sha256:` algorithm prefix.
    pub fn image_reference(&self) -> String {
        if self.docker_image.contains('@') || self.docker_image_sha_hash.is_empty() {
            return self.docker_image.clone();
        }
        if self.docker_image_sha_hash.contains(':') {
            format!("{}@{}", self.docker_image, self.docker_image_sha_hash)
        } else {
            format!("{}@sha256:{}", self.docker_image, self.docker_image_sha_hash)
        }
    }
}

impl fmt::Display for LinterInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]({})", self.id, self.image_reference())
    }
}

/// A linter, resolved once an image and digest have been published for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Linter {
    MetaOnly(LinterMeta),
    Resolved {
        meta: LinterMeta,
        instance: LinterInstance,
    },
}

impl Linter {
    pub fn meta(&self) -> &LinterMeta {
        match self {
            Self::MetaOnly(meta) | Self::Resolved { meta, .. } => meta,
        }
    }

    pub fn instance(&self) -> Option<&LinterInstance> {
        match self {
            Self::MetaOnly(_) => None,
            Self::Resolved { instance, .. } => Some(instance),
        }
    }
}

/// Keep only the linters that have a runnable image.
pub fn resolved_linters(linters: &[Linter]) -> Vec<LinterInstance> {
    linters
        .iter()
        .filter_map(|linter| linter.instance().cloned())
        .collect()
}

/// A git reference to fetch: exactly one of a branch name or a commit hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Branch(String),
    Commit(String),
}

impl GitRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Branch(name) | Self::Commit(name) => name,
        }
    }
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(branch) => write!(f, "branch:{}", branch),
            Self::Commit(hash) => write!(f, "commit:{}", hash),
        }
    }
}

/// Persisted status of a lint task. Leasing is tracked by `locked_at`, not by
/// a status of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LintStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl LintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for LintStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid lint status: {}", s)),
        }
    }
}

/// One unit of work: a linter instance run against a repo instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintTask {
    pub id: String,
    pub linter: LinterInstance,
    pub repo: RepoInstance,
    pub status: LintStatus,
    pub status_comment: Option<String>,
    pub duration: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub linted_at: Option<DateTime<Utc>>,
}

impl LintTask {
    /// A freshly scheduled task with a random id.
    pub fn pending(linter: LinterInstance, repo: RepoInstance, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            linter,
            repo,
            status: LintStatus::Pending,
            status_comment: None,
            duration: None,
            created_at,
            locked_at: None,
            linted_at: None,
        }
    }

    /// The dedup identity: (commit hash, linter id, image digest).
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            commit_hash: self.repo.git_commit_hash.clone(),
            linter_id: self.linter.id.clone(),
            image_digest: self.linter.docker_image_sha_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub commit_hash: String,
    pub linter_id: String,
    pub image_digest: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.commit_hash, self.linter_id, self.image_digest)
    }
}

/// A located finding decoded from tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintHighlight {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub explanation: String,
}

/// Code surrounding a highlight, with common indentation stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightSnippet {
    pub start_line: usize,
    pub end_line: usize,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintHighlightSnippet {
    pub highlight: LintHighlight,
    pub snippet: HighlightSnippet,
}

/// Terminal outcome of a lint run, written back by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintResult {
    pub status: LintStatus,
    pub status_comment: Option<String>,
    pub duration: Duration,
    pub highlights: Vec<LintHighlightSnippet>,
}

/// Human moderation verdict. Variant order is the display precedence:
/// when the same location is reported by several runs, the maximum wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Rejected,
    Pending,
    Accepted,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }
}

impl FromStr for ModerationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rejected" => Ok(Self::Rejected),
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            _ => Err(format!("Invalid moderation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub status: ModerationStatus,
    pub moderator: Option<String>,
    pub moderated_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl Default for ModerationRecord {
    fn default() -> Self {
        Self {
            status: ModerationStatus::Pending,
            moderator: None,
            moderated_at: None,
            comment: None,
        }
    }
}

/// A persisted highlight as shown to moderators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHighlight {
    pub task_id: String,
    pub repo_id: String,
    pub linter_id: String,
    pub commit_hash: String,
    pub highlight: LintHighlightSnippet,
    pub moderation: ModerationRecord,
}
