use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::ForgeError;

const DEFAULT_TIME_LIMIT_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub(crate) const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(format!(
                "Invalid difficulty '{}'; expected easy, medium or hard",
                value
            )),
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChallengeSetup {
    pub(crate) base_commit: String,
    pub(crate) solution_commit: String,
    #[serde(default)]
    pub(crate) test_command: String,
    #[serde(default)]
    pub(crate) files_of_interest: Vec<String>,
}

/// One challenge definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChallengeSpec {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) repo: String,
    pub(crate) difficulty: Difficulty,
    #[serde(default = "default_time_limit")]
    pub(crate) time_limit: u32,
    #[serde(default)]
    pub(crate) description: String,
    pub(crate) setup: ChallengeSetup,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    #[serde(default)]
    pub(crate) hints: Vec<String>,
}

fn default_time_limit() -> u32 {
    DEFAULT_TIME_LIMIT_MINUTES
}

/// Parses and validates one definition; `path` is only used for diagnostics.
pub(crate) fn parse_challenge(path: &Path, text: &str) -> Result<ChallengeSpec, ForgeError> {
    let invalid = |reason: String| ForgeError::InvalidChallengeDefinition {
        path: path.to_path_buf(),
        reason,
    };
    let deserializer = serde_yaml::Deserializer::from_str(text);
    let spec: ChallengeSpec =
        serde_path_to_error::deserialize(deserializer).map_err(|err| invalid(err.to_string()))?;
    validate_challenge(&spec).map_err(invalid)?;
    Ok(spec)
}

fn validate_challenge(spec: &ChallengeSpec) -> Result<(), String> {
    for (label, value) in [
        ("id", &spec.id),
        ("title", &spec.title),
        ("repo", &spec.repo),
        ("setup.base_commit", &spec.setup.base_commit),
        ("setup.solution_commit", &spec.setup.solution_commit),
    ] {
        if value.trim().is_empty() {
            return Err(format!("{} must not be empty", label));
        }
    }
    if !is_safe_id(&spec.id) {
        return Err(format!(
            "id '{}' may only contain letters, digits, '.', '_' and '-'",
            spec.id
        ));
    }
    if !is_repo_reference(&spec.repo) {
        return Err(format!("repo '{}' must look like owner/name", spec.repo));
    }
    if spec.setup.base_commit.trim() == spec.setup.solution_commit.trim() {
        return Err("setup.base_commit and setup.solution_commit must differ".to_string());
    }
    if spec.time_limit == 0 {
        return Err("time_limit must be at least 1 minute".to_string());
    }
    Ok(())
}

pub(crate) fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

fn is_repo_reference(repo: &str) -> bool {
    match repo.split_once('/') {
        Some((owner, name)) => {
            !name.contains('/') && is_safe_id(owner) && is_safe_id(name.trim_end_matches(".git"))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
id: demo-001
title: Off-by-one in pagination
repo: octo/widgets
difficulty: medium
description: |
  Page two repeats the last item of page one.
setup:
  base_commit: aaaa111
  solution_commit: bbbb222
  test_command: cargo test
  files_of_interest:
    - src/page.rs
tags: [pagination, boundaries]
hints:
  - Look at how the offset is computed.
"#;

    #[test]
    fn parses_full_definition() {
        let spec = parse_challenge(Path::new("demo.yaml"), VALID).expect("valid definition");
        assert_eq!(spec.id, "demo-001");
        assert_eq!(spec.difficulty, Difficulty::Medium);
        assert_eq!(spec.time_limit, 30);
        assert_eq!(spec.setup.files_of_interest, vec!["src/page.rs".to_string()]);
        assert_eq!(spec.hints.len(), 1);
    }

    #[test]
    fn missing_nested_field_reports_path() {
        let text = VALID.replace("  solution_commit: bbbb222\n", "");
        let err = parse_challenge(Path::new("demo.yaml"), &text).expect_err("missing field");
        let message = err.to_string();
        assert!(message.contains("demo.yaml"), "got: {message}");
        assert!(message.contains("setup"), "got: {message}");
        assert!(message.contains("solution_commit"), "got: {message}");
    }

    #[test]
    fn identical_revisions_rejected() {
        let text = VALID.replace("bbbb222", "aaaa111");
        let err = parse_challenge(Path::new("demo.yaml"), &text).expect_err("same revisions");
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn unknown_difficulty_rejected() {
        let text = VALID.replace("difficulty: medium", "difficulty: brutal");
        let err = parse_challenge(Path::new("demo.yaml"), &text).expect_err("difficulty");
        assert!(err.to_string().contains("difficulty"), "got: {err}");
    }

    #[test]
    fn unsafe_ids_and_repos_rejected() {
        let text = VALID.replace("id: demo-001", "id: ../escape");
        assert!(parse_challenge(Path::new("demo.yaml"), &text).is_err());
        let text = VALID.replace("repo: octo/widgets", "repo: widgets");
        assert!(parse_challenge(Path::new("demo.yaml"), &text).is_err());
        assert!(is_safe_id("fix_1.2-rc"));
        assert!(!is_safe_id(".."));
    }

    #[test]
    fn difficulty_parses_case_insensitively() {
        assert_eq!("HARD".parse::<Difficulty>(), Ok(Difficulty::Hard));
        assert!("extreme".parse::<Difficulty>().is_err());
    }
}
