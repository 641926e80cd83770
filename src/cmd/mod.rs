//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                    |
//! |--------------|-------------------------------------|
//! | `init`       | `Init`                              |
//! | `run`        | `Scheduler`, `Worker`               |
//! | `registry`   | `Repo`, `Linter`                    |
//! | `highlights` | `Highlights`, `Tasks`, `Stats`      |

pub mod highlights;
pub mod init;
pub mod registry;
pub mod run;

pub use highlights::{cmd_highlights, cmd_stats, cmd_tasks};
pub use init::cmd_init;
pub use registry::{cmd_linter, cmd_repo};
pub use run::{run_scheduler, run_worker};

use anyhow::{Context, Result};
use bughunt::config::BughuntConfig;
use bughunt::storage::BugHuntDb;

use super::Cli;

/// Effective configuration: the file (or defaults), with `--db` applied and validated.
pub fn load_config(cli: &Cli) -> Result<BughuntConfig> {
    let mut config = BughuntConfig::load_or_default(&cli.config)?;
    if let Some(db) = &cli.db {
        config.storage.path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

pub fn open_db(config: &BughuntConfig) -> Result<BugHuntDb> {
    BugHuntDb::open(&config.storage.path, config.storage.busy_timeout()).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.storage.path.display()
        )
    })
}
