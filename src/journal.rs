use std::fs;
use std::io;
use std::path::Path;

use crate::challenge::ChallengeSpec;
use crate::error::{io_context, ForgeError};
use crate::persist::write_atomic;

pub(crate) const MIN_CONTENT_CHARS: usize = 50;

const PLACEHOLDERS: [&str; 5] = [
    "<!-- Write your analysis of the root cause here -->",
    "<!-- Describe how the bug shows up -->",
    "<!-- Describe your approach -->",
    "<!-- List the edge cases you can think of -->",
    "<!-- List the files you expect to change -->",
];

pub(crate) fn render_template(spec: &ChallengeSpec) -> String {
    format!(
        "# Thinking journal: {title}\n\
         \n\
         > Fill this in before submitting. Writing down your reasoning is the most valuable part of the exercise.\n\
         \n\
         ## Problem analysis\n\
         \n\
         ### What is the root cause?\n\
         \n\
         {p0}\n\
         \n\
         \n\
         ### Which symptoms did you observe?\n\
         \n\
         {p1}\n\
         \n\
         \n\
         ## Solution\n\
         \n\
         ### How do you plan to fix it, and why?\n\
         \n\
         {p2}\n\
         \n\
         \n\
         ### Which edge cases matter?\n\
         \n\
         {p3}\n\
         \n\
         \n\
         ### Which files do you expect to change?\n\
         \n\
         {p4}\n\
         \n\
         \n\
         ## Retrospective (after submitting)\n\
         \n\
         ### How did the actual change differ from the plan?\n\
         \n\
         <!-- If it did -->\n\
         \n\
         \n\
         ### What did you learn?\n\
         \n\
         <!-- Summary -->\n",
        title = spec.title,
        p0 = PLACEHOLDERS[0],
        p1 = PLACEHOLDERS[1],
        p2 = PLACEHOLDERS[2],
        p3 = PLACEHOLDERS[3],
        p4 = PLACEHOLDERS[4],
    )
}

pub(crate) fn write_template(path: &Path, spec: &ChallengeSpec) -> Result<(), ForgeError> {
    write_atomic(path, render_template(spec).as_bytes())
}

/// Journal text, or an empty string when the file is missing.
pub(crate) fn read_journal(path: &Path) -> Result<String, ForgeError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(io_context(format!("Failed to read {}", path.display()))(err)),
    }
}

/// The text a reader would count as written by the user: headings, quotes,
/// rules, comments and blank lines removed.
pub(crate) fn substantive_text(content: &str) -> String {
    let mut stripped = content.to_string();
    for marker in PLACEHOLDERS {
        stripped = stripped.replace(marker, "");
    }
    stripped
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with('#')
                && !line.starts_with('>')
                && !line.starts_with("---")
                && !line.starts_with("<!--")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `Ok(())` when the journal counts as filled in, otherwise the failed rule.
pub(crate) fn check_content(content: &str) -> Result<(), String> {
    let written = substantive_text(content).chars().count();
    if written < MIN_CONTENT_CHARS {
        return Err(format!(
            "only {} characters of your own writing, at least {} required",
            written, MIN_CONTENT_CHARS
        ));
    }
    let untouched = PLACEHOLDERS
        .iter()
        .filter(|marker| content.contains(*marker))
        .count();
    if untouched == PLACEHOLDERS.len() {
        return Err("every template placeholder is still in place".to_string());
    }
    Ok(())
}

pub(crate) fn validate_journal(path: &Path) -> Result<(), ForgeError> {
    if !path.exists() {
        return Err(ForgeError::JournalEmpty {
            path: path.to_path_buf(),
            reason: "journal file does not exist".to_string(),
        });
    }
    let content = read_journal(path)?;
    check_content(&content).map_err(|reason| ForgeError::JournalEmpty {
        path: path.to_path_buf(),
        reason,
    })
}
