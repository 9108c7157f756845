//! Path redaction for every user-facing message.
//!
//! Error text that echoes a full path leaks usernames and directory layout,
//! and an attacker who controls the shared folder can provoke descriptive
//! errors on purpose. Anything printed to the user goes through
//! [`sanitize_message`] (or [`user_message`] for error chains), which keeps
//! the final path component and replaces the rest with `<...>`:
//!
//! ```text
//! Symlinks are not allowed: /home/alice/.ssh/id_rsa
//! Symlinks are not allowed: <...>/id_rsa
//! ```

use regex::Regex;
use std::error::Error;
use std::path::Path;
use std::sync::LazyLock;

/// Placeholder for a path with no usable final component.
const HIDDEN_PATH: &str = "<path>";

/// An absolute path token: `/…`, `~/…`, or `X:\…`, preceded by start of text,
/// whitespace, a quote, or an opening bracket. Group 1 keeps the delimiter.
///
/// Space-separated words stay part of the path while a later word still
/// contains a separator (`/mnt/c/Users/John Doe/Pictures`).
static ABSOLUTE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(^|[\s'"`(\[=])"#,
        r#"((?:[A-Za-z]:\\|~/|/)[^\s'"`<>|\])]*"#,
        r#"(?:(?: [^\s/\\'"`<>|\])]+)+[/\\][^\s'"`<>|\])]*)*)"#,
    ))
    .expect("path pattern must compile")
});

/// Redact a single path to `<...>/<basename>`.
///
/// Both `/` and `\` count as separators, so Windows paths coming back from the
/// host are handled as well. Paths with no final component (`/`, `.`, empty)
/// render as `<path>`, as does every path when `show_basename` is false.
pub fn sanitize_path(path: impl AsRef<Path>, show_basename: bool) -> String {
    let text = path.as_ref().to_string_lossy();
    if !show_basename {
        return HIDDEN_PATH.to_string();
    }
    let trimmed = text.trim_end_matches(['/', '\\']);
    let basename = trimmed.rsplit(['/', '\\']).next().unwrap_or("");
    if basename.is_empty() || basename == "." {
        return HIDDEN_PATH.to_string();
    }
    format!("<...>/{basename}")
}

/// Shorthand for log fields: `sanitize_path(path, true)`.
pub fn redact(path: impl AsRef<Path>) -> String {
    sanitize_path(path, true)
}

/// Rewrite every absolute path in `message`. Text without paths is returned
/// unchanged.
pub fn sanitize_message(message: &str) -> String {
    ABSOLUTE_PATH
        .replace_all(message, |caps: &regex::Captures<'_>| {
            format!("{}{}", &caps[1], sanitize_path(&caps[2], true))
        })
        .into_owned()
}

/// Replace every occurrence of the given paths in `message` with their
/// redacted form, then sanitize whatever absolute paths remain.
///
/// Known paths are matched literally, so spaces and other separators inside
/// them do not matter. Longer paths are replaced first so a directory never
/// clips a file path beneath it.
pub fn sanitize_error_message<P: AsRef<Path>>(message: &str, paths: &[P]) -> String {
    let mut known: Vec<(String, String)> = paths
        .iter()
        .map(|p| (p.as_ref().to_string_lossy().into_owned(), redact(p)))
        .filter(|(raw, _)| !raw.is_empty())
        .collect();
    known.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut text = message.to_string();
    for (raw, redacted) in &known {
        text = text.replace(raw.as_str(), redacted);
    }
    sanitize_message(&text)
}

/// Render an error and its whole `source()` chain as one sanitized line.
pub fn user_message(err: &dyn Error) -> String {
    user_message_with(err, &[] as &[&Path])
}

/// [`user_message`] for errors whose text may contain paths the caller knows
/// about, such as the source and target of a failed copy.
pub fn user_message_with<P: AsRef<Path>>(err: &dyn Error, paths: &[P]) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        // thiserror's `{0}` wrappers already include the cause's text.
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    sanitize_error_message(&text, paths)
}
