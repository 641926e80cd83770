//! Process configuration for the scheduler and worker roles.
//!
//! Read once at startup from `bughunt.toml` (or the file named by
//! `--config`/`BUGHUNT_CONFIG`) and passed down by value. A missing file yields
//! the defaults below.
//!
//! ```toml
//! [storage]
//! path = "bughunt.db"
//! busy_timeout_secs = 5
//!
//! [scheduler]
//! fail_delay_secs = 30
//! success_delay_secs = 300
//! fetch_timeout_secs = 10
//! refresh_timeout_secs = 120
//! schedule_timeout_secs = 30
//!
//! [worker]
//! fail_delay_secs = 10
//! success_delay_secs = 5
//! cleanup_timeout_secs = 300
//! take_timeout_secs = 10
//! lint_timeout_secs = 1800
//! update_timeout_secs = 10
//! lock_duration_secs = 3600
//! mount_path = "/src"
//!
//! [sandbox]
//! docker_socket = "/var/run/docker.sock"
//! memory = "4g"
//! cpus = 4.0
//! pids_limit = 1024
//! kill_timeout_secs = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// CFS scheduling period the container CPU quota is expressed against.
pub const CPU_PERIOD_MICROS: i64 = 1_000_000;

pub const DEFAULT_CONFIG_FILE: &str = "bughunt.toml";

/// Upper bound for every `*_secs` timeout: one year.
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BughuntConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("bughunt.db"),
            busy_timeout_secs: 5,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

/// Timings of the repo scheduler pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub fail_delay_secs: u64,
    pub success_delay_secs: u64,
    pub fetch_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub schedule_timeout_secs: u64,
    /// Parent of the per-fetch scratch directories; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fail_delay_secs: 30,
            success_delay_secs: 300,
            fetch_timeout_secs: 10,
            refresh_timeout_secs: 120,
            schedule_timeout_secs: 30,
            scratch_dir: None,
        }
    }
}

impl SchedulerConfig {
    pub fn fail_delay(&self) -> Duration {
        Duration::from_secs(self.fail_delay_secs)
    }

    pub fn success_delay(&self) -> Duration {
        Duration::from_secs(self.success_delay_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn schedule_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule_timeout_secs)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Timings and lease of the worker pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub fail_delay_secs: u64,
    pub success_delay_secs: u64,
    pub cleanup_timeout_secs: u64,
    pub take_timeout_secs: u64,
    pub lint_timeout_secs: u64,
    pub update_timeout_secs: u64,
    /// A leased task becomes claimable again this long after it was taken.
    pub lock_duration_secs: u64,
    /// Where the checkout is mounted inside the linter container.
    pub mount_path: String,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fail_delay_secs: 10,
            success_delay_secs: 5,
            cleanup_timeout_secs: 300,
            take_timeout_secs: 10,
            lint_timeout_secs: 1800,
            update_timeout_secs: 10,
            lock_duration_secs: 3600,
            mount_path: "/src".to_string(),
            scratch_dir: None,
        }
    }
}

impl WorkerConfig {
    pub fn fail_delay(&self) -> Duration {
        Duration::from_secs(self.fail_delay_secs)
    }

    pub fn success_delay(&self) -> Duration {
        Duration::from_secs(self.success_delay_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn take_timeout(&self) -> Duration {
        Duration::from_secs(self.take_timeout_secs)
    }

    pub fn lint_timeout(&self) -> Duration {
        Duration::from_secs(self.lint_timeout_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Resource ceilings for linter containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path of the daemon's unix socket. Only unix sockets are supported;
    /// output is read from a raw attach over this socket, so a
    /// `tcp://` daemon address cannot be used.
    pub docker_socket: PathBuf,
    /// Memory ceiling: bytes, or a number with a `k`/`m`/`g` suffix.
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: i64,
    pub kill_timeout_secs: u64,
    /// Most output one linter run may produce, in the same format as `memory`.
    pub max_output: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            memory: "4g".to_string(),
            cpus: 4.0,
            pids_limit: 1024,
            kill_timeout_secs: 10,
            max_output: "64m".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory(&self.memory)
    }

    /// CPU quota in microseconds per [`CPU_PERIOD_MICROS`].
    pub fn cpu_quota(&self) -> i64 {
        (self.cpus * CPU_PERIOD_MICROS as f64).round() as i64
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn max_output_bytes(&self) -> Result<i64> {
        parse_memory(&self.max_output)
    }
}

/// Parse a human memory size (`"4g"`, `"512m"`, `"1024k"`, `"1048576"`).
pub fn parse_memory(value: &str) -> Result<i64> {
    let trimmed = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some('b') => (&trimmed[..trimmed.len() - 1], 1),
        _ => (trimmed.as_str(), 1),
    };
    let amount: i64 = digits
        .trim()
        .parse()
        .with_context(|| format!("Invalid memory size '{}'", value))?;
    amount
        .checked_mul(multiplier)
        .filter(|bytes| *bytes > 0)
        .with_context(|| format!("Memory size '{}' out of range", value))
}

impl BughuntConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bughunt.toml")
    }

    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize for `bughunt init`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize bughunt.toml")
    }

    /// Reject settings the pipelines cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let timeouts = [
            ("storage.busy_timeout_secs", self.storage.busy_timeout_secs),
            ("scheduler.fetch_timeout_secs", self.scheduler.fetch_timeout_secs),
            ("scheduler.refresh_timeout_secs", self.scheduler.refresh_timeout_secs),
            ("scheduler.schedule_timeout_secs", self.scheduler.schedule_timeout_secs),
            ("worker.cleanup_timeout_secs", self.worker.cleanup_timeout_secs),
            ("worker.take_timeout_secs", self.worker.take_timeout_secs),
            ("worker.lint_timeout_secs", self.worker.lint_timeout_secs),
            ("worker.update_timeout_secs", self.worker.update_timeout_secs),
            ("worker.lock_duration_secs", self.worker.lock_duration_secs),
            ("sandbox.kill_timeout_secs", self.sandbox.kill_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", name));
            } else if value > MAX_TIMEOUT_SECS {
                problems.push(format!(
                    "{} must be at most {}, got {}",
                    name, MAX_TIMEOUT_SECS, value
                ));
            }
        }

        if !(self.sandbox.cpus > 0.0) {
            problems.push(format!(
                "sandbox.cpus must be positive, got {}",
                self.sandbox.cpus
            ));
        }
        if self.sandbox.pids_limit <= 0 {
            problems.push(format!(
                "sandbox.pids_limit must be positive, got {}",
                self.sandbox.pids_limit
            ));
        }
        if let Err(e) = self.sandbox.memory_bytes() {
            problems.push(format!("sandbox.memory: {:#}", e));
        }
        if let Err(e) = self.sandbox.max_output_bytes() {
            problems.push(format!("sandbox.max_output: {:#}", e));
        }
        if !self.worker.mount_path.starts_with('/') {
            problems.push(format!(
                "worker.mount_path must be absolute, got '{}'",
                self.worker.mount_path
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "))
        }
    }
}
