//! Repository and linter registry commands — `bughunt repo`, `bughunt linter`.

use anyhow::{Result, bail};
use chrono::Utc;

use bughunt::models::{Linter, LinterInstance, LinterMeta, Repo, RepoMeta};

use super::{load_config, open_db};
use crate::{Cli, LinterCommands, RepoCommands};

pub fn cmd_repo(cli: &Cli, command: &RepoCommands) -> Result<()> {
    let db = open_db(&load_config(cli)?)?;

    match command {
        RepoCommands::Add { id, url, branch } => {
            let repo = Repo::MetaOnly(RepoMeta {
                id: id.clone(),
                git_url: url.clone(),
                git_branch: branch.clone(),
            });
            db.add_or_update_repo(&repo, Utc::now())?;
            println!("Tracking repo {} ({} @ {})", id, url, branch);
        }
        RepoCommands::List => {
            let repos = db.list_repos()?;
            if repos.is_empty() {
                println!("No repos tracked.");
                return Ok(());
            }
            println!("{:<20} {:<50} {:<16} COMMIT", "ID", "URL", "BRANCH");
            for repo in &repos {
                let meta = repo.meta();
                let commit = repo
                    .instance()
                    .map(|i| i.git_commit_hash.as_str())
                    .unwrap_or("-");
                println!(
                    "{:<20} {:<50} {:<16} {}",
                    meta.id, meta.git_url, meta.git_branch, commit
                );
            }
        }
        RepoCommands::Remove { id } => {
            if !db.delete_repo(id)? {
                bail!("Repo '{}' not found", id);
            }
            println!("Removed repo {}", id);
        }
    }
    Ok(())
}

pub fn cmd_linter(cli: &Cli, command: &LinterCommands) -> Result<()> {
    let db = open_db(&load_config(cli)?)?;

    match command {
        LinterCommands::Add {
            id,
            url,
            branch,
            image,
            digest,
        } => {
            let meta = LinterMeta {
                id: id.clone(),
                git_url: url.clone(),
                git_branch: branch.clone(),
            };
            let linter = match (image, digest) {
                (Some(image), Some(digest)) => Linter::Resolved {
                    instance: LinterInstance {
                        id: id.clone(),
                        docker_image: image.clone(),
                        docker_image_sha_hash: digest.clone(),
                    },
                    meta,
                },
                _ => Linter::MetaOnly(meta),
            };
            db.add_or_update_linter(&linter, Utc::now())?;
            match linter.instance() {
                Some(instance) => println!("Registered linter {} ({})", id, instance.image_reference()),
                None => println!("Registered linter {} (no image yet)", id),
            }
        }
        LinterCommands::List => {
            let linters = db.list_linters()?;
            if linters.is_empty() {
                println!("No linters registered.");
                return Ok(());
            }
            println!("{:<20} {:<50} IMAGE", "ID", "URL");
            for linter in &linters {
                let image = linter
                    .instance()
                    .map(LinterInstance::image_reference)
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<50} {}", linter.meta().id, linter.meta().git_url, image);
            }
        }
        LinterCommands::Remove { id } => {
            if !db.delete_linter(id)? {
                bail!("Linter '{}' not found", id);
            }
            println!("Removed linter {}", id);
        }
    }
    Ok(())
}
