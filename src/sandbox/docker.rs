use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, KillContainerOptions,
    PruneBuildOptionsBuilder, PruneContainersOptions, PruneImagesOptions, PruneVolumesOptions,
    StartContainerOptions, WaitContainerOptions,
};
use futures_util::StreamExt;
use tokio::io::BufReader;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::attach::attach_output;
use super::frame::read_lines;
use super::{CleanupReport, Sandbox};
use crate::config::{CPU_PERIOD_MICROS, SandboxConfig};
use crate::errors::SandboxError;
use crate::pipeline::Scope;

/// Seconds bollard waits on a single API request.
const API_TIMEOUT_SECS: u64 = 120;

/// Runs linters as Docker containers through the local daemon socket.
pub struct DockerSandbox {
    client: OnceCell<Docker>,
    socket: PathBuf,
    memory_bytes: i64,
    cpu_quota: i64,
    pids_limit: i64,
    kill_timeout: Duration,
    max_output_bytes: usize,
}

impl DockerSandbox {
    /// A sandbox for the daemon at `config.docker_socket`. The connection is
    /// made on first use, so a daemon that is down only fails that call.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let max_output_bytes = config
            .max_output_bytes()
            .context("Invalid sandbox max_output")?;
        Ok(Self {
            client: OnceCell::new(),
            socket: config.docker_socket.clone(),
            memory_bytes: config.memory_bytes().context("Invalid sandbox memory")?,
            cpu_quota: config.cpu_quota(),
            pids_limit: config.pids_limit,
            kill_timeout: config.kill_timeout(),
            max_output_bytes: usize::try_from(max_output_bytes).unwrap_or(usize::MAX),
        })
    }

    /// The shared client. A failed connect is not cached and is retried on
    /// the next call.
    async fn docker(&self) -> Result<&Docker, SandboxError> {
        self.client
            .get_or_try_init(|| async {
                Docker::connect_with_unix(
                    &self.socket.to_string_lossy(),
                    API_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )
                .map_err(|source| SandboxError::Connect {
                    socket: self.socket.clone(),
                    source,
                })
            })
            .await
    }

    async fn pull(&self, image: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut progress = self.docker().await?.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            item.map_err(|source| SandboxError::Pull {
                image: image.to_string(),
                source,
            })?;
        }
        debug!(image, "Image pulled");
        Ok(())
    }

    async fn create(
        &self,
        image: &str,
        mount_path: &str,
        host_dir: &Path,
    ) -> Result<String, SandboxError> {
        let host_config = HostConfig {
            binds: Some(vec![format!("{}:{}", host_dir.display(), mount_path)]),
            memory: Some(self.memory_bytes),
            cpu_period: Some(CPU_PERIOD_MICROS),
            cpu_quota: Some(self.cpu_quota),
            pids_limit: Some(self.pids_limit),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(vec![mount_path.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker()
            .await?
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|source| SandboxError::Create {
                image: image.to_string(),
                source,
            })?;
        for warning in &created.warnings {
            warn!(container = %created.id, "Docker: {}", warning);
        }
        Ok(created.id)
    }

    /// Attach, start, then drain output while waiting for exit.
    async fn run_container(&self, container: &str) -> Result<Vec<String>, SandboxError> {
        let output = attach_output(&self.socket, container)
            .await
            .map_err(|source| SandboxError::Attach {
                container: container.to_string(),
                source,
            })?;
        self.docker()
            .await?
            .start_container(container, None::<StartContainerOptions>)
            .await
            .map_err(|source| SandboxError::Start {
                container: container.to_string(),
                source,
            })?;

        let (lines, exit_code) = tokio::join!(
            read_lines(BufReader::new(output), self.max_output_bytes),
            self.wait(container)
        );
        let exit_code = exit_code?;
        if exit_code != 0 {
            return Err(SandboxError::NonZeroExitCode(exit_code));
        }
        lines.map_err(|source| match source.kind() {
            io::ErrorKind::InvalidData => SandboxError::OutputRejected {
                container: container.to_string(),
                source,
            },
            _ => SandboxError::Stream {
                container: container.to_string(),
                source,
            },
        })
    }

    async fn wait(&self, container: &str) -> Result<i64, SandboxError> {
        let mut statuses = self
            .docker()
            .await?
            .wait_container(container, None::<WaitContainerOptions>);
        match statuses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero status as an error of its own
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Wait {
                container: container.to_string(),
                message: e.to_string(),
            }),
            None => Err(SandboxError::Wait {
                container: container.to_string(),
                message: "wait stream ended without an exit status".to_string(),
            }),
        }
    }

    /// Always called after a run; errors are expected when the container
    /// already exited.
    async fn kill(&self, container: &str) {
        let docker = match self.docker().await {
            Ok(docker) => docker,
            Err(e) => {
                warn!(container, error = %e, "Cannot kill container");
                return;
            }
        };
        let kill = docker.kill_container(container, None::<KillContainerOptions>);
        match tokio::time::timeout(self.kill_timeout, kill).await {
            Ok(Ok(())) => debug!(container, "Container killed"),
            Ok(Err(e)) => debug!(container, error = %e, "Container kill skipped"),
            Err(_) => warn!(container, timeout = ?self.kill_timeout, "Timed out killing container"),
        }
    }
}

fn reclaimed(bytes: Option<i64>) -> u64 {
    bytes.and_then(|b| u64::try_from(b).ok()).unwrap_or(0)
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn exec(
        &self,
        scope: &Scope,
        image: &str,
        mount_path: &str,
        host_dir: &Path,
    ) -> Result<Vec<String>, SandboxError> {
        info!(image, host_dir = %host_dir.display(), "Running linter container");
        scope
            .run(self.pull(image))
            .await
            .map_err(|_| SandboxError::Cancelled)??;
        let container = scope
            .run(self.create(image, mount_path, host_dir))
            .await
            .map_err(|_| SandboxError::Cancelled)??;

        let outcome = scope.run(self.run_container(&container)).await;
        self.kill(&container).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(container = %container, "Container run cancelled");
                Err(SandboxError::Cancelled)
            }
        }
    }

    async fn cleanup(&self, scope: &Scope) -> Result<CleanupReport, SandboxError> {
        let docker = self.docker().await?;
        scope
            .run(docker.ping())
            .await
            .map_err(|_| SandboxError::Cancelled)?
            .map_err(|source| SandboxError::Connect {
                socket: self.socket.clone(),
                source,
            })?;

        let mut report = CleanupReport::default();

        match scope
            .run(docker.prune_containers(None::<PruneContainersOptions>))
            .await
            .map_err(|_| SandboxError::Cancelled)?
        {
            Ok(pruned) => report.containers = reclaimed(pruned.space_reclaimed),
            Err(e) => {
                warn!(error = %e, "Failed to prune containers");
                report.failed_steps.push("containers".to_string());
            }
        }

        let build_options = PruneBuildOptionsBuilder::default().all(true).build();
        match scope
            .run(docker.prune_build(Some(build_options)))
            .await
            .map_err(|_| SandboxError::Cancelled)?
        {
            Ok(pruned) => report.build_cache = reclaimed(pruned.space_reclaimed),
            Err(e) => {
                warn!(error = %e, "Failed to prune build cache");
                report.failed_steps.push("build_cache".to_string());
            }
        }

        match scope
            .run(docker.prune_volumes(None::<PruneVolumesOptions>))
            .await
            .map_err(|_| SandboxError::Cancelled)?
        {
            Ok(pruned) => report.volumes = reclaimed(pruned.space_reclaimed),
            Err(e) => {
                warn!(error = %e, "Failed to prune volumes");
                report.failed_steps.push("volumes".to_string());
            }
        }

        match scope
            .run(docker.prune_images(None::<PruneImagesOptions>))
            .await
            .map_err(|_| SandboxError::Cancelled)?
        {
            Ok(pruned) => report.images = reclaimed(pruned.space_reclaimed),
            Err(e) => {
                warn!(error = %e, "Failed to prune images");
                report.failed_steps.push("images".to_string());
            }
        }

        info!(
            containers = report.containers,
            build_cache = report.build_cache,
            volumes = report.volumes,
            images = report.images,
            "Docker resources pruned"
        );
        Ok(report)
    }
}
