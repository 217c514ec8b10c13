use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::error::ForgeError;
use crate::persist::write_atomic;
use crate::vcs::RevisionControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum FileChange {
    Added,
    Deleted,
    Modified,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LineKind {
    Context,
    Removed,
    Added,
    NoNewline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HunkLine {
    pub(crate) kind: LineKind,
    pub(crate) text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hunk {
    pub(crate) old_start: u32,
    pub(crate) old_len: u32,
    pub(crate) new_start: u32,
    pub(crate) new_len: u32,
    pub(crate) section: String,
    pub(crate) lines: Vec<HunkLine>,
}

impl Hunk {
    /// Half-open range of old-side lines; pure insertions still occupy one line.
    fn old_range(&self) -> (u32, u32) {
        (self.old_start, self.old_start + self.old_len.max(1))
    }

    fn overlaps(&self, other: &Hunk) -> bool {
        let (a_start, a_end) = self.old_range();
        let (b_start, b_end) = other.old_range();
        a_start < b_end && b_start < a_end
    }

    fn changed_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line.kind, LineKind::Added | LineKind::Removed))
            .count()
    }

    fn change_keys(&self) -> Vec<ChangeKey> {
        let mut old_line = if self.old_len == 0 {
            self.old_start + 1
        } else {
            self.old_start
        };
        let mut keys = Vec::new();
        for line in &self.lines {
            match line.kind {
                LineKind::Context => old_line += 1,
                LineKind::Removed => {
                    keys.push((old_line, LineKind::Removed, line.text.clone()));
                    old_line += 1;
                }
                LineKind::Added => keys.push((old_line, LineKind::Added, line.text.clone())),
                LineKind::NoNewline => {}
            }
        }
        keys
    }
}

type ChangeKey = (u32, LineKind, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilePatch {
    pub(crate) path: String,
    pub(crate) change: FileChange,
    pub(crate) header: Vec<String>,
    pub(crate) hunks: Vec<Hunk>,
}

impl FilePatch {
    fn change_keys(&self) -> BTreeSet<ChangeKey> {
        self.hunks.iter().flat_map(Hunk::change_keys).collect()
    }

    fn changed_lines(&self) -> usize {
        self.hunks.iter().map(Hunk::changed_lines).sum()
    }

    fn index_line(&self) -> Option<&str> {
        self.header
            .iter()
            .find(|line| line.starts_with("index "))
            .map(String::as_str)
    }
}

/// A parsed unified diff with files sorted by path and hunks by old start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Patch {
    pub(crate) files: Vec<FilePatch>,
}

impl Patch {
    pub(crate) fn parse(text: &str) -> Self {
        let mut files: Vec<FilePatch> = Vec::new();
        let mut old_remaining = 0u32;
        let mut new_remaining = 0u32;

        for line in text.lines() {
            let in_hunk_body = old_remaining > 0 || new_remaining > 0;
            if !in_hunk_body {
                if let Some(rest) = line.strip_prefix("diff --git ") {
                    files.push(FilePatch {
                        path: path_from_git_header(rest),
                        change: FileChange::Modified,
                        header: vec![line.to_string()],
                        hunks: Vec::new(),
                    });
                    continue;
                }
            }
            let Some(file) = files.last_mut() else {
                continue;
            };

            if in_hunk_body {
                let Some(hunk) = file.hunks.last_mut() else {
                    continue;
                };
                let (kind, text) = match line.as_bytes().first() {
                    Some(b'+') => (LineKind::Added, &line[1..]),
                    Some(b'-') => (LineKind::Removed, &line[1..]),
                    Some(b'\\') => (LineKind::NoNewline, line),
                    Some(b' ') => (LineKind::Context, &line[1..]),
                    _ => (LineKind::Context, line),
                };
                match kind {
                    LineKind::Added => new_remaining = new_remaining.saturating_sub(1),
                    LineKind::Removed => old_remaining = old_remaining.saturating_sub(1),
                    LineKind::Context => {
                        old_remaining = old_remaining.saturating_sub(1);
                        new_remaining = new_remaining.saturating_sub(1);
                    }
                    LineKind::NoNewline => {}
                }
                hunk.lines.push(HunkLine {
                    kind,
                    text: text.to_string(),
                });
                continue;
            }

            if let Some(hunk) = parse_hunk_header(line) {
                old_remaining = hunk.old_len;
                new_remaining = hunk.new_len;
                file.hunks.push(hunk);
                continue;
            }
            if line.starts_with('\\') {
                if let Some(hunk) = file.hunks.last_mut() {
                    hunk.lines.push(HunkLine {
                        kind: LineKind::NoNewline,
                        text: line.to_string(),
                    });
                }
                continue;
            }

            if line.starts_with("new file mode") {
                file.change = FileChange::Added;
            } else if line.starts_with("deleted file mode") {
                file.change = FileChange::Deleted;
            } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                file.change = FileChange::Binary;
            } else if let Some(target) = line.strip_prefix("+++ ") {
                if let Some(path) = strip_side_prefix(target) {
                    file.path = path;
                }
            } else if let Some(source) = line.strip_prefix("--- ") {
                if file.change == FileChange::Deleted {
                    if let Some(path) = strip_side_prefix(source) {
                        file.path = path;
                    }
                }
            }
            file.header.push(line.to_string());
        }

        for file in &mut files {
            file.hunks
                .sort_by_key(|hunk| (hunk.old_start, hunk.new_start));
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self { files }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub(crate) fn file(&self, path: &str) -> Option<&FilePatch> {
        self.files.iter().find(|file| file.path == path)
    }

    pub(crate) fn changed_lines(&self) -> usize {
        self.files.iter().map(FilePatch::changed_lines).sum()
    }

    /// Canonical text form; identical trees render byte-identical patches.
    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            for line in &file.header {
                out.push_str(line);
                out.push('\n');
            }
            for hunk in &file.hunks {
                out.push_str(&format!(
                    "@@ -{} +{} @@",
                    render_range(hunk.old_start, hunk.old_len),
                    render_range(hunk.new_start, hunk.new_len)
                ));
                if !hunk.section.is_empty() {
                    out.push(' ');
                    out.push_str(&hunk.section);
                }
                out.push('\n');
                for line in &hunk.lines {
                    let prefix = match line.kind {
                        LineKind::Context => " ",
                        LineKind::Removed => "-",
                        LineKind::Added => "+",
                        LineKind::NoNewline => "",
                    };
                    out.push_str(prefix);
                    out.push_str(&line.text);
                    out.push('\n');
                }
            }
        }
        out
    }
}

fn render_range(start: u32, len: u32) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{},{}", start, len)
    }
}

fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, section) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;
    Some(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        section: section.trim_start().to_string(),
        lines: Vec::new(),
    })
}

fn parse_range(range: &str) -> Option<(u32, u32)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// `a/path b/path` with identical halves (renames are disabled).
fn path_from_git_header(rest: &str) -> String {
    let rest = rest.trim();
    if rest.len() >= 3 && (rest.len() - 1) % 2 == 0 {
        let half = (rest.len() - 1) / 2;
        if rest.is_char_boundary(half) && rest.is_char_boundary(half + 1) {
            let (left, right) = (&rest[..half], &rest[half + 1..]);
            if let (Some(left), Some(right)) = (left.strip_prefix("a/"), right.strip_prefix("b/")) {
                if left == right {
                    return left.to_string();
                }
            }
        }
    }
    rest.split_whitespace()
        .last()
        .map(|part| part.strip_prefix("b/").unwrap_or(part).to_string())
        .unwrap_or_default()
}

fn strip_side_prefix(value: &str) -> Option<String> {
    let value = value.trim_end_matches('\t');
    if value == "/dev/null" {
        return None;
    }
    Some(
        value
            .strip_prefix("a/")
            .or_else(|| value.strip_prefix("b/"))
            .unwrap_or(value)
            .to_string(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum FileClass {
    Identical,
    Overlapping { regions: usize },
    Missing,
    Extraneous,
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileClass::Identical => f.write_str("identical"),
            FileClass::Overlapping { regions: 0 } => f.write_str("overlapping-region: none"),
            FileClass::Overlapping { regions } => write!(f, "overlapping-region: {}", regions),
            FileClass::Missing => f.write_str("missing"),
            FileClass::Extraneous => f.write_str("extraneous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PatchSide {
    Submission,
    Solution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HunkClass {
    Identical,
    Overlapping,
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HunkAnnotation {
    pub(crate) side: PatchSide,
    pub(crate) old_start: u32,
    pub(crate) old_len: u32,
    pub(crate) class: HunkClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileComparison {
    pub(crate) path: String,
    pub(crate) class: FileClass,
    pub(crate) hunks: Vec<HunkAnnotation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Verdict {
    Identical,
    Partial,
    Disjoint,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Identical => "identical",
            Verdict::Partial => "partial",
            Verdict::Disjoint => "disjoint",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ComparisonResult {
    pub(crate) verdict: Verdict,
    pub(crate) files: Vec<FileComparison>,
    pub(crate) submission_files: usize,
    pub(crate) solution_files: usize,
    pub(crate) submission_changed_lines: usize,
    pub(crate) solution_changed_lines: usize,
}

impl ComparisonResult {
    pub(crate) fn count(&self, wanted: FileClass) -> usize {
        self.files.iter().filter(|file| file.class == wanted).count()
    }

    pub(crate) fn missing(&self) -> usize {
        self.count(FileClass::Missing)
    }

    pub(crate) fn extraneous(&self) -> usize {
        self.count(FileClass::Extraneous)
    }

    pub(crate) fn class_of(&self, path: &str) -> Option<FileClass> {
        self.files
            .iter()
            .find(|file| file.path == path)
            .map(|file| file.class)
    }
}

pub(crate) fn compare(submission: &Patch, solution: &Patch) -> ComparisonResult {
    let paths: BTreeSet<&str> = submission
        .files
        .iter()
        .chain(solution.files.iter())
        .map(|file| file.path.as_str())
        .collect();

    let mut files = Vec::with_capacity(paths.len());
    let mut shared = 0usize;
    for path in paths {
        let comparison = match (submission.file(path), solution.file(path)) {
            (Some(mine), Some(theirs)) => {
                shared += 1;
                compare_file(mine, theirs)
            }
            (None, Some(theirs)) => FileComparison {
                path: path.to_string(),
                class: FileClass::Missing,
                hunks: annotate_all(theirs, PatchSide::Solution, HunkClass::Unmatched),
            },
            (Some(mine), None) => FileComparison {
                path: path.to_string(),
                class: FileClass::Extraneous,
                hunks: annotate_all(mine, PatchSide::Submission, HunkClass::Unmatched),
            },
            (None, None) => continue,
        };
        files.push(comparison);
    }

    let verdict = if !files.is_empty() && files.iter().all(|file| file.class == FileClass::Identical)
    {
        Verdict::Identical
    } else if shared == 0 {
        Verdict::Disjoint
    } else {
        Verdict::Partial
    };

    ComparisonResult {
        verdict,
        files,
        submission_files: submission.files.len(),
        solution_files: solution.files.len(),
        submission_changed_lines: submission.changed_lines(),
        solution_changed_lines: solution.changed_lines(),
    }
}

fn compare_file(mine: &FilePatch, theirs: &FilePatch) -> FileComparison {
    let identical = if mine.change == FileChange::Binary || theirs.change == FileChange::Binary {
        mine.change == theirs.change && mine.index_line() == theirs.index_line()
    } else {
        mine.change == theirs.change && mine.change_keys() == theirs.change_keys()
    };
    if identical {
        let mut hunks = annotate_all(mine, PatchSide::Submission, HunkClass::Identical);
        hunks.extend(annotate_all(theirs, PatchSide::Solution, HunkClass::Identical));
        return FileComparison {
            path: mine.path.clone(),
            class: FileClass::Identical,
            hunks,
        };
    }

    let their_keys = theirs.change_keys();
    let my_keys = mine.change_keys();
    let mut regions = 0usize;
    for a in &mine.hunks {
        for b in &theirs.hunks {
            if a.overlaps(b) {
                regions += 1;
            }
        }
    }

    let mut hunks = Vec::new();
    for hunk in &mine.hunks {
        hunks.push(annotate(hunk, PatchSide::Submission, &their_keys, &theirs.hunks));
    }
    for hunk in &theirs.hunks {
        hunks.push(annotate(hunk, PatchSide::Solution, &my_keys, &mine.hunks));
    }

    FileComparison {
        path: mine.path.clone(),
        class: FileClass::Overlapping { regions },
        hunks,
    }
}

fn annotate(
    hunk: &Hunk,
    side: PatchSide,
    other_keys: &BTreeSet<ChangeKey>,
    other_hunks: &[Hunk],
) -> HunkAnnotation {
    let keys = hunk.change_keys();
    let class = if !keys.is_empty() && keys.iter().all(|key| other_keys.contains(key)) {
        HunkClass::Identical
    } else if other_hunks.iter().any(|other| hunk.overlaps(other)) {
        HunkClass::Overlapping
    } else {
        HunkClass::Unmatched
    };
    HunkAnnotation {
        side,
        old_start: hunk.old_start,
        old_len: hunk.old_len,
        class,
    }
}

fn annotate_all(file: &FilePatch, side: PatchSide, class: HunkClass) -> Vec<HunkAnnotation> {
    file.hunks
        .iter()
        .map(|hunk| HunkAnnotation {
            side,
            old_start: hunk.old_start,
            old_len: hunk.old_len,
            class,
        })
        .collect()
}

/// Captures the working tree of `repo_dir` against `base`.
pub(crate) fn capture(
    vcs: &dyn RevisionControl,
    repo_dir: &Path,
    base: &str,
) -> Result<Patch, ForgeError> {
    Ok(Patch::parse(&vcs.diff_worktree(repo_dir, base)?))
}

fn solution_cache_header(base: &str, solution: &str) -> String {
    format!("# solution {}..{}", base, solution)
}

/// Canonical base→solution patch, cached in `cache_path` under a header
/// naming both revisions.
pub(crate) fn solution_patch(
    vcs: &dyn RevisionControl,
    repo_dir: &Path,
    base: &str,
    solution: &str,
    cache_path: &Path,
) -> Result<Patch, ForgeError> {
    let header = solution_cache_header(base, solution);
    if let Ok(cached) = std::fs::read_to_string(cache_path) {
        if let Some(body) = cached.strip_prefix(&header) {
            if body.starts_with('\n') {
                return Ok(Patch::parse(body));
            }
        }
    }
    let patch = Patch::parse(&vcs.diff_revisions(repo_dir, base, solution)?);
    let rendered = format!("{}\n{}", header, patch.render());
    write_atomic(cache_path, rendered.as_bytes())?;
    Ok(patch)
}
