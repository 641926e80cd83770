//! Typed error hierarchy for bughunt.
//!
//! One enum per subsystem:
//! - `StoreError` — task queue and repo/linter store failures
//! - `SandboxError` — container execution failures
//! - `GitError` — working tree fetch failures
//! - `SnippetError` — code snippet extraction failures
//! - `LintError` — classified outcome of a single lint run
//! - `PipelineError` — dropped triggers and joined stage failures

use std::path::PathBuf;

use thiserror::Error;

use crate::models::Fingerprint;

/// Errors from the task queue and the repo/linter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Lint task {fingerprint} already exists")]
    DuplicateTask { fingerprint: Fingerprint },

    #[error("No lint tasks available")]
    NoTasksAvailable,

    #[error("Lint task {task_id} is not pending")]
    NotPending { task_id: String },

    #[error("Lease on lint task {task_id} is held by another worker")]
    LeaseLost { task_id: String },

    #[error("Database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl StoreError {
    /// Duplicate adds and empty claims drive normal control flow.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::DuplicateTask { .. } | Self::NoTasksAvailable)
    }
}

/// Errors from running a container in the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to connect to Docker at {socket}: {source}")]
    Connect {
        socket: PathBuf,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("Failed to pull image {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("Failed to create container for image {image}: {source}")]
    Create {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("Failed to attach to container {container}: {source}")]
    Attach {
        container: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start container {container}: {source}")]
    Start {
        container: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("Failed to wait for container {container}: {message}")]
    Wait { container: String, message: String },

    #[error("Failed to read output of container {container}: {source}")]
    Stream {
        container: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Rejected output of container {container}: {source}")]
    OutputRejected {
        container: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Container exited with non-zero code {0}")]
    NonZeroExitCode(i64),

    #[error("Container run cancelled")]
    Cancelled,
}

/// Errors from materialising a git working tree.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Empty git reference for repo {url}")]
    EmptyRef { url: String },

    #[error("Unable to init git in {dir}: {message}")]
    Init { dir: PathBuf, message: String },

    #[error("Unable to add origin remote {url}: {message}")]
    AddRemote { url: String, message: String },

    #[error("Unable to fetch branch {branch} from {url}: {message}")]
    FetchBranch {
        url: String,
        branch: String,
        message: String,
    },

    #[error("Unable to checkout branch {branch} from {url}: {message}")]
    Checkout {
        url: String,
        branch: String,
        message: String,
    },

    #[error("Unable to fetch revision {commit} from {url}: {message}")]
    FetchCommit {
        url: String,
        commit: String,
        message: String,
    },

    #[error("Unable to hard reset to revision {commit} in {url}: {message}")]
    Reset {
        url: String,
        commit: String,
        message: String,
    },

    #[error("Unable to resolve HEAD in {dir}: {source}")]
    ResolveHead {
        dir: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Git operation cancelled")]
    Cancelled,
}

/// Errors from cutting code snippets around highlights.
#[derive(Debug, Error)]
pub enum SnippetError {
    #[error(
        "Invalid highlight lines {start_line}-{end_line} in {path} ({line_count} lines)"
    )]
    InvalidRange {
        path: String,
        start_line: usize,
        end_line: usize,
        line_count: usize,
    },

    #[error("Unable to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Highlight path {path} escapes the repository")]
    PathOutsideRepo { path: String },
}

/// Classified outcome of a failed or declined lint run.
#[derive(Debug, Error)]
pub enum LintError {
    /// The tool declined to run against this repository.
    #[error("Lint skipped")]
    Skipped,

    /// Infrastructure failure; the task goes back to pending.
    #[error("Lint failed with temporary error: {0:#}")]
    Temporary(#[source] anyhow::Error),

    /// Tool failure; the task is recorded as failed.
    #[error("Lint failed: {0:#}")]
    Fatal(#[source] anyhow::Error),
}

/// Errors surfaced by the pipeline framework itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Trigger dropped before completion")]
    Dropped,

    #[error("{}", join_messages(.0))]
    Joined(Vec<anyhow::Error>),
}

fn join_messages(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Combine independent failures: none is success, one is itself, many are joined.
pub fn join_errors(mut errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(PipelineError::Joined(errors).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fingerprint;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            commit_hash: "c0ffee".to_string(),
            linter_id: "govanish".to_string(),
            image_digest: "d1".to_string(),
        }
    }

    #[test]
    fn store_error_expected_outcomes() {
        assert!(StoreError::NoTasksAvailable.is_expected());
        assert!(
            StoreError::DuplicateTask {
                fingerprint: fingerprint()
            }
            .is_expected()
        );
        assert!(!StoreError::Database(anyhow::anyhow!("disk full")).is_expected());
        assert!(
            !StoreError::NotPending {
                task_id: "t".into()
            }
            .is_expected()
        );
    }

    #[test]
    fn duplicate_task_message_carries_fingerprint() {
        let err = StoreError::DuplicateTask {
            fingerprint: fingerprint(),
        };
        assert!(err.to_string().contains("c0ffee/govanish@d1"));
    }

    #[test]
    fn sandbox_non_zero_exit_is_matchable_through_anyhow() {
        let err: anyhow::Error = SandboxError::NonZeroExitCode(2).into();
        let err = err.context("exec of linter failed");
        match err.downcast_ref::<SandboxError>() {
            Some(SandboxError::NonZeroExitCode(code)) => assert_eq!(*code, 2),
            _ => panic!("Expected NonZeroExitCode"),
        }
    }

    #[test]
    fn snippet_invalid_range_carries_location() {
        let err = SnippetError::InvalidRange {
            path: "a.go".to_string(),
            start_line: 10,
            end_line: 12,
            line_count: 5,
        };
        let message = err.to_string();
        assert!(message.contains("a.go"));
        assert!(message.contains("10-12"));
    }

    #[test]
    fn join_errors_cases() {
        assert!(join_errors(vec![]).is_ok());

        let single = join_errors(vec![anyhow::anyhow!("one")]).unwrap_err();
        assert_eq!(single.to_string(), "one");

        let many = join_errors(vec![anyhow::anyhow!("one"), anyhow::anyhow!("two")]).unwrap_err();
        assert_eq!(many.to_string(), "one; two");
        assert!(matches!(
            many.downcast_ref::<PipelineError>(),
            Some(PipelineError::Joined(errors)) if errors.len() == 2
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NoTasksAvailable);
        assert_std_error(&SandboxError::Cancelled);
        assert_std_error(&GitError::Cancelled);
        assert_std_error(&SnippetError::PathOutsideRepo { path: "/etc".into() });
        assert_std_error(&LintError::Skipped);
        assert_std_error(&PipelineError::Dropped);
    }
}
