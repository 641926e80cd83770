//! Turning linter output into located findings with code context.

pub mod annotations;
mod runner;
pub mod snippet;

pub use annotations::{Extraction, extract_highlights};
pub use runner::Linting;
pub use snippet::{SNIPPET_MARGIN, extract_highlight_snippets, extract_highlight_snippets_for_file};

#[cfg(test)]
pub(crate) use runner::tests as fakes;
