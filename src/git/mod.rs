//! Materialise a git working tree at a branch head or an exact commit.
//!
//! [`GitCli`] shells out to `git` for the network-facing steps (init, remote,
//! fetch, checkout/reset) and reads the resolved `HEAD` back with `git2`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use git2::Repository;
use tokio::process::Command;
use tracing::debug;

use crate::errors::GitError;
use crate::models::GitRef;
use crate::pipeline::Scope;

#[async_trait]
pub trait GitFetcher: Send + Sync {
    /// Fetch `git_ref` of `url` into the existing, empty directory `target`
    /// and return the commit hash `HEAD` ends up at.
    async fn fetch(
        &self,
        scope: &Scope,
        url: &str,
        git_ref: &GitRef,
        target: &Path,
    ) -> Result<String, GitError>;
}

/// [`GitFetcher`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

enum Failure {
    Cancelled,
    Failed(String),
}

impl Failure {
    fn into_git_error(self, step: impl FnOnce(String) -> GitError) -> GitError {
        match self {
            Self::Cancelled => GitError::Cancelled,
            Self::Failed(message) => step(message),
        }
    }
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn git(&self, scope: &Scope, dir: &Path, args: &[&str]) -> Result<(), Failure> {
        debug!(dir = %dir.display(), "git {}", args.join(" "));
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = scope
            .run(command.output())
            .await
            .map_err(|_| Failure::Cancelled)?
            .map_err(|e| Failure::Failed(format!("failed to spawn git: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Failure::Failed(format!(
            "command [git {}] failed: {} ({})",
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}

/// Commit hash `HEAD` of the repository at `dir` points to.
pub async fn resolve_head(dir: &Path) -> Result<String, GitError> {
    let dir = dir.to_path_buf();
    let resolved = {
        let dir = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<String, git2::Error> {
            let repo = Repository::open(&dir)?;
            let commit = repo.head()?.peel_to_commit()?;
            Ok(commit.id().to_string())
        })
        .await
    };
    match resolved {
        Ok(result) => result.map_err(|source| GitError::ResolveHead { dir, source }),
        Err(e) => Err(GitError::ResolveHead {
            dir,
            source: git2::Error::from_str(&e.to_string()),
        }),
    }
}

#[async_trait]
impl GitFetcher for GitCli {
    async fn fetch(
        &self,
        scope: &Scope,
        url: &str,
        git_ref: &GitRef,
        target: &Path,
    ) -> Result<String, GitError> {
        if git_ref.name().trim().is_empty() {
            return Err(GitError::EmptyRef {
                url: url.to_string(),
            });
        }

        self.git(scope, target, &["init", "-q"])
            .await
            .map_err(|f| {
                f.into_git_error(|message| GitError::Init {
                    dir: target.to_path_buf(),
                    message,
                })
            })?;
        self.git(scope, target, &["remote", "add", "origin", url])
            .await
            .map_err(|f| {
                f.into_git_error(|message| GitError::AddRemote {
                    url: url.to_string(),
                    message,
                })
            })?;

        match git_ref {
            GitRef::Branch(branch) => {
                self.git(scope, target, &["fetch", "-q", "origin", branch])
                    .await
                    .map_err(|f| {
                        f.into_git_error(|message| GitError::FetchBranch {
                            url: url.to_string(),
                            branch: branch.clone(),
                            message,
                        })
                    })?;
                self.git(
                    scope,
                    target,
                    &["checkout", "-q", "--force", "-B", branch, "FETCH_HEAD"],
                )
                .await
                .map_err(|f| {
                    f.into_git_error(|message| GitError::Checkout {
                        url: url.to_string(),
                        branch: branch.clone(),
                        message,
                    })
                })?;
            }
            GitRef::Commit(commit) => {
                self.git(scope, target, &["fetch", "-q", "origin", commit])
                    .await
                    .map_err(|f| {
                        f.into_git_error(|message| GitError::FetchCommit {
                            url: url.to_string(),
                            commit: commit.clone(),
                            message,
                        })
                    })?;
                self.git(scope, target, &["reset", "-q", "--hard", commit])
                    .await
                    .map_err(|f| {
                        f.into_git_error(|message| GitError::Reset {
                            url: url.to_string(),
                            commit: commit.clone(),
                            message,
                        })
                    })?;
            }
        }

        let head = resolve_head(target).await?;
        debug!(url, git_ref = %git_ref, head = %head, "Fetched working tree");
        Ok(head)
    }
}
