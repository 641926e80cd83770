use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use super::annotations::{Extraction, extract_highlights};
use super::snippet::extract_highlight_snippets;
use crate::errors::{GitError, LintError, SandboxError};
use crate::git::GitFetcher;
use crate::models::{GitRef, LintHighlightSnippet, LinterInstance, RepoInstance};
use crate::pipeline::Scope;
use crate::sandbox::Sandbox;

/// Runs one linter instance against one repository snapshot.
pub struct Linting {
    git: Arc<dyn GitFetcher>,
    sandbox: Arc<dyn Sandbox>,
    scratch_dir: PathBuf,
    mount_path: String,
}

impl Linting {
    pub fn new(
        git: Arc<dyn GitFetcher>,
        sandbox: Arc<dyn Sandbox>,
        scratch_dir: PathBuf,
        mount_path: impl Into<String>,
    ) -> Self {
        Self {
            git,
            sandbox,
            scratch_dir,
            mount_path: mount_path.into(),
        }
    }

    /// Check out `repo` into a fresh scratch directory, run `linter` on it and
    /// decode its findings. The checkout is removed on every exit path.
    pub async fn run(
        &self,
        scope: &Scope,
        repo: &RepoInstance,
        linter: &LinterInstance,
    ) -> Result<Vec<LintHighlightSnippet>, LintError> {
        info!(repo = %repo, linter = %linter, "Start linting");
        let started = Instant::now();

        std::fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("Failed to create {}", self.scratch_dir.display()))
            .map_err(LintError::Temporary)?;
        let checkout = tempfile::Builder::new()
            .prefix("repo_clone_")
            .tempdir_in(&self.scratch_dir)
            .context("Failed to create checkout directory")
            .map_err(LintError::Temporary)?;
        let target = std::path::absolute(checkout.path())
            .with_context(|| format!("No absolute path for {}", checkout.path().display()))
            .map_err(LintError::Temporary)?;

        let clone_started = Instant::now();
        let git_ref = GitRef::Commit(repo.git_commit_hash.clone());
        if let Err(e) = self.git.fetch(scope, &repo.git_url, &git_ref, &target).await {
            warn!(repo = %repo, error = %e, elapsed = ?clone_started.elapsed(), "Clone failed");
            let e = anyhow!(e).context(format!("Clone of repo {} failed", repo));
            return Err(match e.downcast_ref::<GitError>() {
                Some(GitError::EmptyRef { .. }) => LintError::Fatal(e),
                _ => LintError::Temporary(e),
            });
        }
        info!(repo = %repo, elapsed = ?clone_started.elapsed(), "Clone succeeded");

        let exec_started = Instant::now();
        let image = linter.image_reference();
        let lines = match self
            .sandbox
            .exec(scope, &image, &self.mount_path, &target)
            .await
        {
            Ok(lines) => lines,
            Err(SandboxError::NonZeroExitCode(code)) => {
                warn!(linter = %linter, repo = %repo, code, "Linter exited with non-zero code");
                return Err(LintError::Fatal(
                    anyhow!(SandboxError::NonZeroExitCode(code))
                        .context(format!("Linter {} failed", linter)),
                ));
            }
            Err(e @ SandboxError::OutputRejected { .. }) => {
                warn!(linter = %linter, repo = %repo, error = %e, "Linter output rejected");
                return Err(LintError::Fatal(
                    anyhow!(e).context(format!("Linter {} failed", linter)),
                ));
            }
            Err(e) => {
                warn!(linter = %linter, repo = %repo, error = %e, elapsed = ?exec_started.elapsed(), "Exec failed");
                return Err(LintError::Temporary(
                    anyhow!(e).context(format!("Exec of linter {} failed", linter)),
                ));
            }
        };
        info!(linter = %linter, repo = %repo, lines = lines.len(), elapsed = ?exec_started.elapsed(), "Exec succeeded");

        let highlights = match extract_highlights(&lines) {
            Extraction::Skipped => {
                info!(linter = %linter, repo = %repo, "Linter skipped repository");
                return Err(LintError::Skipped);
            }
            Extraction::Highlights(highlights) => highlights,
        };

        let snippets = {
            let target = target.clone();
            tokio::task::spawn_blocking(move || extract_highlight_snippets(&target, &highlights))
                .await
                .context("Snippet extraction panicked")
                .map_err(LintError::Temporary)?
                .context("Failed to extract snippets")
                .map_err(LintError::Fatal)?
        };

        if let Err(e) = checkout.close() {
            warn!(dir = %target.display(), error = %e, "Failed to remove checkout");
        }
        info!(
            repo = %repo,
            linter = %linter,
            highlights = snippets.len(),
            elapsed = ?started.elapsed(),
            "Linting succeeded"
        );
        Ok(snippets)
    }
}
