//! Database and config bootstrap — `bughunt init`.

use anyhow::{Context, Result};

use super::{load_config, open_db};
use crate::Cli;

pub fn cmd_init(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    if let Some(parent) = config.storage.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    open_db(&config)?;
    println!("Database initialized at {}", config.storage.path.display());

    if cli.config.exists() {
        println!("Using existing config {}", cli.config.display());
    } else {
        std::fs::write(&cli.config, config.to_toml()?)
            .with_context(|| format!("Failed to write {}", cli.config.display()))?;
        println!("Wrote default config to {}", cli.config.display());
    }
    Ok(())
}
