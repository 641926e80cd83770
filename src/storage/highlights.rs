use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::Serialize;

use super::db::{BugHuntDb, conversion_error, from_millis, to_millis};
use crate::models::*;

/// Restricts [`BugHuntDb::list_highlights`]; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HighlightFilter {
    pub task_id: Option<String>,
    pub linter_id: Option<String>,
    pub repo_id: Option<String>,
    pub status: Option<ModerationStatus>,
}

/// Distinct highlight locations per moderation status for one linter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinterStats {
    pub linter_id: String,
    pub total: usize,
    pub pending: usize,
    pub accepted: usize,
    pub rejected: usize,
}

type LocationKey = (String, String, usize, usize);

impl BugHuntDb {
    // ── Highlights ───────────────────────────────────────────────────

    /// Highlights visible to moderators.
    ///
    /// The same location (repo, path, start line, end line) is reported by
    /// every run that still finds it; only one entry per location is returned,
    /// carrying the highest moderation status any of the copies has. Ties go
    /// to the most recent run.
    pub fn list_highlights(&self, filter: &HighlightFilter) -> Result<Vec<StoredHighlight>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT h.lint_id, t.repo_id, t.linter_id, t.repo_git_commit_hash,
                        h.path, h.start_line, h.end_line, h.explanation,
                        h.snippet_start_line, h.snippet_end_line, h.snippet_code,
                        h.moderation_status, h.moderator, h.moderated_at, h.moderation_comment
                 FROM lint_highlights h
                 JOIN lint_tasks t ON t.lint_id = h.lint_id
                 WHERE (?1 IS NULL OR h.lint_id = ?1)
                   AND (?2 IS NULL OR t.linter_id = ?2)
                   AND (?3 IS NULL OR t.repo_id = ?3)
                 ORDER BY t.created_at, h.rowid",
            )
            .context("Failed to prepare list_highlights")?;
        let rows = stmt
            .query_map(
                params![filter.task_id, filter.linter_id, filter.repo_id],
                stored_highlight_from_row,
            )
            .context("Failed to query highlights")?;

        let mut by_location: BTreeMap<LocationKey, StoredHighlight> = BTreeMap::new();
        for row in rows {
            let stored = row.context("Failed to read highlight row")?;
            let key = location_key(&stored);
            match by_location.get(&key) {
                Some(prev) if prev.moderation.status > stored.moderation.status => {}
                _ => {
                    by_location.insert(key, stored);
                }
            }
        }

        Ok(by_location
            .into_values()
            .filter(|h| filter.status.is_none_or(|s| h.moderation.status == s))
            .collect())
    }

    /// Record a verdict for one highlight location of one task.
    /// Returns the number of rows updated.
    pub fn moderate_highlight(
        &self,
        task_id: &str,
        path: &str,
        start_line: usize,
        end_line: usize,
        record: &ModerationRecord,
    ) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE lint_highlights
                 SET moderation_status = ?5, moderator = ?6, moderated_at = ?7, moderation_comment = ?8
                 WHERE lint_id = ?1 AND path = ?2 AND start_line = ?3 AND end_line = ?4",
                params![
                    task_id,
                    path,
                    start_line as i64,
                    end_line as i64,
                    record.status.as_str(),
                    record.moderator,
                    record.moderated_at.map(to_millis),
                    record.comment
                ],
            )
            .context("Failed to moderate highlight")?;
        Ok(updated)
    }

    /// Per-linter counts over deduplicated highlight locations, best
    /// performing linters first.
    pub fn linter_stats(&self) -> Result<Vec<LinterStats>> {
        let mut stats: BTreeMap<String, LinterStats> = BTreeMap::new();
        for linter in self.list_linters()? {
            let id = linter.meta().id.clone();
            stats.insert(id.clone(), empty_stats(id));
        }

        // Locations are deduplicated per linter, not across linters.
        let mut by_location: BTreeMap<(String, LocationKey), ModerationStatus> = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.linter_id, t.repo_id, h.path, h.start_line, h.end_line, h.moderation_status
                 FROM lint_highlights h
                 JOIN lint_tasks t ON t.lint_id = h.lint_id",
            )
            .context("Failed to prepare linter_stats")?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(5)?;
                let status: ModerationStatus =
                    status.parse().map_err(|e| conversion_error(5, e))?;
                let key: LocationKey = (
                    row.get(1)?,
                    row.get(2)?,
                    row.get::<_, i64>(3)? as usize,
                    row.get::<_, i64>(4)? as usize,
                );
                Ok((row.get::<_, String>(0)?, key, status))
            })
            .context("Failed to query linter stats")?;
        for row in rows {
            let (linter_id, key, status) = row.context("Failed to read linter stats row")?;
            let entry = by_location
                .entry((linter_id, key))
                .or_insert(ModerationStatus::Rejected);
            *entry = (*entry).max(status);
        }

        for ((linter_id, _), status) in by_location {
            let entry = stats
                .entry(linter_id.clone())
                .or_insert_with(|| empty_stats(linter_id));
            entry.total += 1;
            match status {
                ModerationStatus::Pending => entry.pending += 1,
                ModerationStatus::Accepted => entry.accepted += 1,
                ModerationStatus::Rejected => entry.rejected += 1,
            }
        }

        let mut stats: Vec<LinterStats> = stats.into_values().collect();
        stats.sort_by(|a, b| {
            b.accepted
                .cmp(&a.accepted)
                .then(b.pending.cmp(&a.pending))
                .then(a.rejected.cmp(&b.rejected))
                .then(a.linter_id.cmp(&b.linter_id))
        });
        Ok(stats)
    }
}

fn empty_stats(linter_id: String) -> LinterStats {
    LinterStats {
        linter_id,
        total: 0,
        pending: 0,
        accepted: 0,
        rejected: 0,
    }
}

fn location_key(stored: &StoredHighlight) -> LocationKey {
    (
        stored.repo_id.clone(),
        stored.highlight.highlight.path.clone(),
        stored.highlight.highlight.start_line,
        stored.highlight.highlight.end_line,
    )
}

fn stored_highlight_from_row(row: &Row<'_>) -> rusqlite::Result<StoredHighlight> {
    let status: String = row.get(11)?;
    let moderated_at: Option<i64> = row.get(13)?;
    Ok(StoredHighlight {
        task_id: row.get(0)?,
        repo_id: row.get(1)?,
        linter_id: row.get(2)?,
        commit_hash: row.get(3)?,
        highlight: LintHighlightSnippet {
            highlight: LintHighlight {
                path: row.get(4)?,
                start_line: row.get::<_, i64>(5)? as usize,
                end_line: row.get::<_, i64>(6)? as usize,
                explanation: row.get(7)?,
            },
            snippet: HighlightSnippet {
                start_line: row.get::<_, i64>(8)? as usize,
                end_line: row.get::<_, i64>(9)? as usize,
                code: row.get(10)?,
            },
        },
        moderation: ModerationRecord {
            status: status.parse().map_err(|e| conversion_error(11, e))?,
            moderator: row.get(12)?,
            moderated_at: moderated_at.map(from_millis),
            comment: row.get(14)?,
        },
    })
}

/// Verdict stamped now, for the CLI.
pub fn moderation_now(
    status: ModerationStatus,
    moderator: Option<String>,
    comment: Option<String>,
    now: DateTime<Utc>,
) -> ModerationRecord {
    ModerationRecord {
        status,
        moderator,
        moderated_at: Some(now),
        comment,
    }
}
