//! Resource-bounded container execution for linters.
//!
//! [`Sandbox`] is the seam the worker depends on; [`DockerSandbox`] is the
//! production backend. Output comes back as decoded text lines: the attach
//! stream is demultiplexed by [`FrameReader`] and split by [`read_lines`].

mod attach;
mod docker;
mod frame;

pub use attach::attach_output;
pub use docker::DockerSandbox;
pub use frame::{FrameReader, HEADER_LEN, read_lines};

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::SandboxError;
use crate::pipeline::Scope;

/// Bytes reclaimed by one [`Sandbox::cleanup`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub containers: u64,
    pub build_cache: u64,
    pub volumes: u64,
    pub images: u64,
    /// Prune steps that failed; they are logged and otherwise ignored.
    pub failed_steps: Vec<String>,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.containers + self.build_cache + self.volumes + self.images
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `image` with `host_dir` bind-mounted at `mount_path` and return its
    /// combined stdout/stderr lines.
    ///
    /// A non-zero exit surfaces as [`SandboxError::NonZeroExitCode`]; expiry of
    /// `scope` kills the container and yields [`SandboxError::Cancelled`].
    async fn exec(
        &self,
        scope: &Scope,
        image: &str,
        mount_path: &str,
        host_dir: &Path,
    ) -> Result<Vec<String>, SandboxError>;

    /// Best-effort reclamation of stopped containers, build cache, unused
    /// volumes and dangling images. Fails only if the runtime is unreachable.
    async fn cleanup(&self, scope: &Scope) -> Result<CleanupReport, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_report_total() {
        let report = CleanupReport {
            containers: 10,
            build_cache: 20,
            volumes: 0,
            images: 5,
            failed_steps: vec!["volumes".to_string()],
        };
        assert_eq!(report.total(), 35);
        assert_eq!(CleanupReport::default().total(), 0);
    }
}
