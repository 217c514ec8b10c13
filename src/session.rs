use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::diff::ComparisonResult;
use crate::error::ForgeError;
use crate::persist::{read_json_opt, write_json_atomic};
use crate::review::ReviewResult;

/// Progress of one challenge attempt, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LifecycleState {
    NotStarted,
    Started,
    JournalLogged,
    Submitted,
    Compared,
    Reviewed,
    Completed,
}

impl LifecycleState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Started => "started",
            LifecycleState::JournalLogged => "journal_logged",
            LifecycleState::Submitted => "submitted",
            LifecycleState::Compared => "compared",
            LifecycleState::Reviewed => "reviewed",
            LifecycleState::Completed => "completed",
        }
    }

    pub(crate) fn is_in_progress(self) -> bool {
        self > LifecycleState::NotStarted && self < LifecycleState::Completed
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Session {
    pub(crate) challenge_id: String,
    pub(crate) state: LifecycleState,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) hints_consumed: u32,
    pub(crate) journal_path: PathBuf,
    pub(crate) workspace_root: PathBuf,
    #[serde(default)]
    pub(crate) submission_path: Option<PathBuf>,
    #[serde(default)]
    pub(crate) test_passed: Option<bool>,
    #[serde(default)]
    pub(crate) last_comparison: Option<ComparisonResult>,
    #[serde(default)]
    pub(crate) last_review: Option<ReviewResult>,
    #[serde(default)]
    pub(crate) last_export: Option<PathBuf>,
}

impl Session {
    pub(crate) fn new(challenge_id: &str, workspace_root: &Path, journal_path: &Path) -> Self {
        let now = Utc::now();
        Self {
            challenge_id: challenge_id.to_string(),
            state: LifecycleState::Started,
            started_at: now,
            updated_at: now,
            submitted_at: None,
            completed_at: None,
            hints_consumed: 0,
            journal_path: journal_path.to_path_buf(),
            workspace_root: workspace_root.to_path_buf(),
            submission_path: None,
            test_passed: None,
            last_comparison: None,
            last_review: None,
            last_export: None,
        }
    }

    /// Minutes from start to submission, or to now while unsubmitted.
    pub(crate) fn elapsed_minutes(&self) -> f64 {
        let end = self.submitted_at.unwrap_or_else(Utc::now);
        let seconds = (end - self.started_at).num_seconds().max(0);
        (seconds as f64 / 60.0 * 10.0).round() / 10.0
    }
}

pub(crate) fn load_session(path: &Path) -> Result<Option<Session>, ForgeError> {
    read_json_opt(path)
}

pub(crate) fn save_session(path: &Path, session: &Session) -> Result<(), ForgeError> {
    write_json_atomic(path, session)
}
