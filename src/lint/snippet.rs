use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::errors::SnippetError;
use crate::models::{HighlightSnippet, LintHighlight, LintHighlightSnippet};

/// Lines of context kept on each side of a highlight.
pub const SNIPPET_MARGIN: usize = 2;

/// Cut a snippet for every highlight of a single file.
///
/// Highlighted lines must lie within the file; anything else means the tool
/// broke its output contract and is an error.
pub fn extract_highlight_snippets_for_file(
    content: &str,
    highlights: &[LintHighlight],
) -> Result<Vec<LintHighlightSnippet>, SnippetError> {
    let lines: Vec<&str> = content.lines().collect();
    highlights
        .iter()
        .map(|highlight| {
            let valid = 1 <= highlight.start_line
                && highlight.start_line <= highlight.end_line
                && highlight.end_line <= lines.len();
            if !valid {
                return Err(SnippetError::InvalidRange {
                    path: highlight.path.clone(),
                    start_line: highlight.start_line,
                    end_line: highlight.end_line,
                    line_count: lines.len(),
                });
            }
            let start_line = highlight.start_line.saturating_sub(SNIPPET_MARGIN).max(1);
            let end_line = (highlight.end_line + SNIPPET_MARGIN).min(lines.len());
            Ok(LintHighlightSnippet {
                highlight: highlight.clone(),
                snippet: HighlightSnippet {
                    start_line,
                    end_line,
                    code: dedent(&lines[start_line - 1..end_line]),
                },
            })
        })
        .collect()
}

/// Read each highlighted file under `dir` once and cut its snippets.
pub fn extract_highlight_snippets(
    dir: &Path,
    highlights: &[LintHighlight],
) -> Result<Vec<LintHighlightSnippet>, SnippetError> {
    let mut files: BTreeMap<&str, Vec<LintHighlight>> = BTreeMap::new();
    for highlight in highlights {
        files
            .entry(highlight.path.as_str())
            .or_default()
            .push(highlight.clone());
    }

    let mut snippets = Vec::with_capacity(highlights.len());
    for (path, file_highlights) in files {
        if !is_contained(path) {
            return Err(SnippetError::PathOutsideRepo {
                path: path.to_string(),
            });
        }
        let full_path = dir.join(path);
        let bytes = std::fs::read(&full_path).map_err(|source| SnippetError::ReadFile {
            path: full_path.clone(),
            source,
        })?;
        let content = String::from_utf8_lossy(&bytes);
        snippets.extend(extract_highlight_snippets_for_file(&content, &file_highlights)?);
    }
    Ok(snippets)
}

/// Relative and free of `..`: the path cannot leave the checkout.
fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Join `lines`, stripping the whitespace prefix they all share.
fn dedent(lines: &[&str]) -> String {
    let prefix = common_whitespace_prefix(lines);
    lines
        .iter()
        .map(|line| &line[prefix..])
        .collect::<Vec<_>>()
        .join("\n")
}

fn common_whitespace_prefix(lines: &[&str]) -> usize {
    let Some(first) = lines.first() else {
        return 0;
    };
    let mut prefix = leading_whitespace(first);
    for pair in lines.windows(2) {
        let shared = pair[0]
            .char_indices()
            .zip(pair[1].chars())
            .take_while(|((_, a), b)| a == b && a.is_whitespace())
            .last()
            .map_or(0, |((i, c), _)| i + c.len_utf8());
        prefix = prefix.min(shared);
    }
    prefix
}

fn leading_whitespace(line: &str) -> usize {
    line.len() - line.trim_start().len()
}
