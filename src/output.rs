//! Rendering transferred paths for pasting into documents.
//!
//! # Output Format
//!
//! ```text
//! markdown   ![3f2a….png](/assets/images/3f2a….png)
//! html       <img src="/assets/images/3f2a….png" alt="3f2a….png">
//! text       /assets/images/3f2a….png
//! ```
//!
//! Inside a git repository paths are shown relative to the repository root
//! with a leading `/`, so the link works from any document in the repo.
//! Elsewhere the absolute path is printed.
//!
//! # Architecture
//!
//! [`format_paths`] returns `Vec<String>` for testability; the binary does
//! the printing. Format functions are pure: no I/O, no side effects.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// How transferred files are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputStyle {
    #[default]
    Markdown,
    Html,
    Text,
}

impl OutputStyle {
    pub const ALL: [OutputStyle; 3] = [Self::Markdown, Self::Html, Self::Text];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for OutputStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid output style: {input} (valid options: markdown, html, text){}", suffix(.suggestion))]
pub struct UnknownStyle {
    pub input: String,
    pub suggestion: String,
}

fn suffix(suggestion: &str) -> String {
    if suggestion.is_empty() {
        String::new()
    } else {
        format!(". {suggestion}")
    }
}

impl FromStr for OutputStyle {
    type Err = UnknownStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|style| style.as_str() == lower)
            .ok_or_else(|| UnknownStyle {
                input: s.to_string(),
                suggestion: suggest_format(s),
            })
    }
}

/// Suggest valid styles close to `input`.
///
/// Substring matches win; otherwise the styles sharing the most character
/// bigrams with the input are offered. Empty input lists every style;
/// whitespace and punctuation never match anything.
pub fn suggest_format(input: &str) -> String {
    let all: Vec<&str> = OutputStyle::ALL.iter().map(|s| s.as_str()).collect();
    if input.is_empty() {
        return did_you_mean(&all);
    }
    let needle = input.trim().to_lowercase();
    if !needle.chars().any(char::is_alphanumeric) {
        return String::new();
    }

    let substring: Vec<&str> = all
        .iter()
        .copied()
        .filter(|c| c.contains(needle.as_str()) || needle.contains(c))
        .collect();
    if !substring.is_empty() {
        return did_you_mean(&substring);
    }

    let wanted = bigrams(&needle);
    let scored: Vec<(&str, usize)> = all
        .iter()
        .map(|c| (*c, bigrams(c).intersection(&wanted).count()))
        .collect();
    let best = scored.iter().map(|(_, n)| *n).max().unwrap_or(0);
    if best == 0 {
        return String::new();
    }
    let closest: Vec<&str> = scored
        .into_iter()
        .filter(|(_, n)| *n == best)
        .map(|(c, _)| c)
        .collect();
    did_you_mean(&closest)
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

fn did_you_mean(options: &[&str]) -> String {
    format!("Did you mean: {}?", options.join(", "))
}

/// Path as it should appear in the rendered link.
pub fn display_path(path: &Path, repo_root: Option<&Path>) -> String {
    if let Some(relative) = repo_root.and_then(|root| path.strip_prefix(root).ok()) {
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        return format!("/{}", parts.join("/"));
    }
    path.display().to_string()
}

/// One rendered line for `path`.
pub fn render(style: OutputStyle, path: &Path, repo_root: Option<&Path>) -> String {
    let shown = display_path(path, repo_root);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match style {
        OutputStyle::Markdown => format!("![{name}]({shown})"),
        OutputStyle::Html => format!("<img src=\"{shown}\" alt=\"{name}\">"),
        OutputStyle::Text => shown,
    }
}

pub fn format_paths<P: AsRef<Path>>(
    style: OutputStyle,
    paths: &[P],
    repo_root: Option<&Path>,
) -> Vec<String> {
    paths
        .iter()
        .map(|p| render(style, p.as_ref(), repo_root))
        .collect()
}
