//! Moderation and inspection commands — `bughunt highlights`, `bughunt tasks`,
//! `bughunt stats`.

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;

use bughunt::models::LintStatus;
use bughunt::storage::{HighlightFilter, moderation_now};

use super::{load_config, open_db};
use crate::{Cli, HighlightsCommands};

pub fn cmd_highlights(cli: &Cli, command: &HighlightsCommands) -> Result<()> {
    let db = open_db(&load_config(cli)?)?;

    match command {
        HighlightsCommands::List {
            task,
            linter,
            repo,
            status,
        } => {
            let filter = HighlightFilter {
                task_id: task.clone(),
                linter_id: linter.clone(),
                repo_id: repo.clone(),
                status: *status,
            };
            let highlights = db.list_highlights(&filter)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&highlights).context("Failed to encode highlights")?
            );
        }
        HighlightsCommands::Moderate {
            task_id,
            path,
            start_line,
            end_line,
            status,
            moderator,
            comment,
        } => {
            let record = moderation_now(*status, moderator.clone(), comment.clone(), Utc::now());
            let updated = db.moderate_highlight(task_id, path, *start_line, *end_line, &record)?;
            if updated == 0 {
                bail!(
                    "No highlight at {}:{}-{} in task {}",
                    path,
                    start_line,
                    end_line,
                    task_id
                );
            }
            println!(
                "Marked {}:{}-{} as {}",
                path,
                start_line,
                end_line,
                status.as_str()
            );
        }
    }
    Ok(())
}

pub fn cmd_tasks(cli: &Cli, status: Option<&str>, limit: usize) -> Result<()> {
    let status = status
        .map(|s| s.parse::<LintStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let db = open_db(&load_config(cli)?)?;
    let tasks = db.list_tasks(status, limit)?;
    if tasks.is_empty() {
        println!("No lint tasks.");
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:<16} {:<16} {:<12} {:>10}",
        "ID", "STATUS", "REPO", "LINTER", "COMMIT", "DURATION"
    );
    for task in &tasks {
        let commit: String = task.repo.git_commit_hash.chars().take(12).collect();
        let duration = task
            .duration
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36} {:<10} {:<16} {:<16} {:<12} {:>10}",
            task.id,
            task.status.as_str(),
            task.repo.id,
            task.linter.id,
            commit,
            duration
        );
        if let Some(comment) = &task.status_comment {
            println!("    {}", comment);
        }
    }
    Ok(())
}

pub fn cmd_stats(cli: &Cli) -> Result<()> {
    let db = open_db(&load_config(cli)?)?;
    let stats = db.linter_stats()?;
    if stats.is_empty() {
        println!("No linters registered.");
        return Ok(());
    }
    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8}",
        "LINTER", "TOTAL", "ACCEPTED", "PENDING", "REJECTED"
    );
    for s in &stats {
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8}",
            s.linter_id, s.total, s.accepted, s.pending, s.rejected
        );
    }
    Ok(())
}
