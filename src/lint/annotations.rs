//! Decoder for annotation lines in linter output.
//!
//! Linters report findings as GitHub workflow commands:
//!
//! ```text
//! ::warning file=a.go,line=10,endLine=12,title=Bug::code vanished from binary
//! ::error file=b.go,line=3::unchecked error
//! ::skip
//! ```
//!
//! A `::skip` line anywhere in the output means the tool declined to run.

use std::collections::HashMap;

use tracing::debug;

use crate::models::LintHighlight;

pub const SKIP_MARKER: &str = "::skip";
pub const ANNOTATION_PREFIXES: [&str; 2] = ["::warning ", "::error "];
const DELIMITER: &str = "::";

const FILE_PROP: &str = "file";
const START_LINE_PROP: &str = "line";
const END_LINE_PROP: &str = "endLine";
const TITLE_PROP: &str = "title";
const MESSAGE_PROP: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The tool declined to run against this repository.
    Skipped,
    Highlights(Vec<LintHighlight>),
}

impl Extraction {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Scan `lines` for annotations. Lines that are not annotations, or that lack
/// a file or a parsable start line, are ignored.
pub fn extract_highlights(lines: &[String]) -> Extraction {
    let mut highlights = Vec::new();
    for line in lines {
        if line.starts_with(SKIP_MARKER) {
            return Extraction::Skipped;
        }
        let Some(rest) = ANNOTATION_PREFIXES
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
        else {
            continue;
        };
        if let Some(highlight) = parse_annotation(line, rest) {
            highlights.push(highlight);
        }
    }
    Extraction::Highlights(highlights)
}

fn parse_annotation(line: &str, rest: &str) -> Option<LintHighlight> {
    let (attributes, message) = match rest.split_once(DELIMITER) {
        Some((attributes, message)) => (attributes, Some(unescape_data(message))),
        None => (rest, None),
    };

    let properties: HashMap<&str, String> = attributes
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim(), unescape_property(value)))
        .collect();

    let Some(start_line) = properties
        .get(START_LINE_PROP)
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        debug!(line, "Annotation without a parsable line attribute");
        return None;
    };
    let end_line = properties
        .get(END_LINE_PROP)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(start_line);

    let path = match properties.get(FILE_PROP) {
        Some(path) if !path.is_empty() => path.clone(),
        _ => {
            debug!(line, "Annotation without a file attribute");
            return None;
        }
    };

    let title = properties.get(TITLE_PROP).filter(|t| !t.is_empty());
    // A `message=` property stands in for an absent or empty trailing message
    let message = message
        .filter(|m| !m.is_empty())
        .or_else(|| properties.get(MESSAGE_PROP).filter(|m| !m.is_empty()).cloned());
    let explanation = match (title, message) {
        (Some(title), Some(message)) => format!("{}: {}", title, message),
        (Some(title), None) => title.clone(),
        (None, Some(message)) => message,
        (None, None) => String::new(),
    };

    Some(LintHighlight {
        path,
        start_line,
        end_line,
        explanation,
    })
}

/// Decode a message: `%25`, `%0D` and `%0A`.
fn unescape_data(value: &str) -> String {
    unescape(value, false)
}

/// Decode a property value: the message escapes plus `%3A` and `%2C`.
fn unescape_property(value: &str) -> String {
    unescape(value, true)
}

fn unescape(value: &str, property: bool) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(i) = rest.find('%') {
        out.push_str(&rest[..i]);
        let escape = rest.get(i..i + 3).map(str::to_ascii_uppercase);
        let decoded = match escape.as_deref() {
            Some("%25") => Some('%'),
            Some("%0D") => Some('\r'),
            Some("%0A") => Some('\n'),
            Some("%3A") if property => Some(':'),
            Some("%2C") if property => Some(','),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[i + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[i + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}
