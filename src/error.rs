use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::LifecycleState;

/// Broad error classes; each one has its own recovery story at the CLI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Definition,
    Lookup,
    State,
    Resource,
    Backend,
    Config,
    Interrupted,
}

#[derive(Debug, Error)]
pub(crate) enum ForgeError {
    #[error("Invalid challenge definition {}: {reason}", path.display())]
    InvalidChallengeDefinition { path: PathBuf, reason: String },

    #[error(
        "Duplicate challenge id '{id}' in {} (already defined in {}); entry skipped",
        path.display(),
        first.display()
    )]
    DuplicateChallenge {
        id: String,
        path: PathBuf,
        first: PathBuf,
    },

    #[error("Challenge not found: {0}")]
    ChallengeNotFound(String),

    #[error("No active challenge session. Run `forge start --id <ID>` first.")]
    NoActiveSession,

    #[error("Cannot {op}: session is {state}, requires {expected}")]
    InvalidTransition {
        op: &'static str,
        state: LifecycleState,
        expected: &'static str,
    },

    #[error(
        "Journal is empty ({}): {reason}\nRun `forge think` and write down your analysis before submitting.",
        path.display()
    )]
    JournalEmpty { path: PathBuf, reason: String },

    #[error("Challenge {0} is already completed; only `reset` and `stats` remain available")]
    SessionCompleted(String),

    #[error("No code changes detected in the workspace; edit the repository before submitting")]
    NoChanges,

    #[error("Score for {dimension} must be between 1 and 10 (got {value})")]
    InvalidScore { dimension: &'static str, value: i64 },

    #[error("Failed to fetch {repo} at {revision}: {cause}")]
    FetchFailed {
        repo: String,
        revision: String,
        cause: String,
    },

    #[error("git {op} failed: {cause}")]
    Vcs { op: String, cause: String },

    #[error("{id} is locked by another forge process ({holder}); retry once it finishes")]
    LockContention { id: String, holder: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Review backend unavailable: {0}")]
    ReviewBackendUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Interrupted")]
    Interrupted,
}

impl ForgeError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidChallengeDefinition { .. } | Self::DuplicateChallenge { .. } => {
                ErrorKind::Definition
            }
            Self::ChallengeNotFound(_) | Self::NoActiveSession => ErrorKind::Lookup,
            Self::InvalidTransition { .. }
            | Self::JournalEmpty { .. }
            | Self::SessionCompleted(_)
            | Self::NoChanges
            | Self::InvalidScore { .. } => ErrorKind::State,
            Self::FetchFailed { .. }
            | Self::Vcs { .. }
            | Self::LockContention { .. }
            | Self::Io { .. } => ErrorKind::Resource,
            Self::ReviewBackendUnavailable(_) => ErrorKind::Backend,
            Self::Config(_) => ErrorKind::Config,
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Short machine-friendly tag used in the transition log.
    pub(crate) fn reason_tag(&self) -> &'static str {
        match self {
            Self::InvalidChallengeDefinition { .. } => "invalid_challenge_definition",
            Self::DuplicateChallenge { .. } => "duplicate_challenge",
            Self::ChallengeNotFound(_) => "challenge_not_found",
            Self::NoActiveSession => "no_active_session",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::JournalEmpty { .. } => "journal_empty",
            Self::SessionCompleted(_) => "session_completed",
            Self::NoChanges => "no_changes",
            Self::InvalidScore { .. } => "invalid_score",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::Vcs { .. } => "vcs_failed",
            Self::LockContention { .. } => "lock_contention",
            Self::Io { .. } => "io",
            Self::ReviewBackendUnavailable(_) => "review_backend_unavailable",
            Self::Config(_) => "config",
            Self::Interrupted => "interrupted",
        }
    }
}

pub(crate) fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> ForgeError {
    let context = context.into();
    move |source| ForgeError::Io { context, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_empty_names_the_precondition() {
        let err = ForgeError::JournalEmpty {
            path: PathBuf::from("/tmp/ws/journal.md"),
            reason: "only 3 characters written".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("Journal is empty"), "got: {message}");
        assert!(message.contains("forge think"), "got: {message}");
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn invalid_transition_reports_state_and_expectation() {
        let err = ForgeError::InvalidTransition {
            op: "compare",
            state: LifecycleState::Started,
            expected: "submitted or later",
        };
        assert_eq!(
            err.to_string(),
            "Cannot compare: session is started, requires submitted or later"
        );
        assert_eq!(err.reason_tag(), "invalid_transition");
    }

    #[test]
    fn io_context_wraps_source() {
        let err = io_context("Failed to read session")(io::Error::new(
            io::ErrorKind::NotFound,
            "gone",
        ));
        assert_eq!(err.to_string(), "Failed to read session: gone");
        assert_eq!(err.kind(), ErrorKind::Resource);
    }
}
