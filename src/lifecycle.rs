use chrono::Utc;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::ChallengeCatalog;
use crate::challenge::ChallengeSpec;
use crate::config::{Config, ForgePaths};
use crate::diff::{self, ComparisonResult, Patch};
use crate::error::{io_context, ForgeError};
use crate::history::{self, Completion, HistoryRecord};
use crate::journal;
use crate::lock::{self, LockGuard};
use crate::logger::Logger;
use crate::persist::write_atomic;
use crate::review::{
    hint_penalty, request_review, DimensionScores, ReviewBackend, ReviewOutcome, ReviewPayload,
    ReviewResult,
};
use crate::session::{load_session, save_session, LifecycleState, Session};
use crate::shell::run_shell_with_timeout;
use crate::vcs::RevisionControl;
use crate::workspace::{WorkspaceLayout, WorkspaceManager};

use LifecycleState::*;

const JOURNAL_STATES: &[LifecycleState] = &[Started, JournalLogged, Submitted, Compared, Reviewed];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JournalOutcome {
    Recorded,
    AlreadyRecorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TestRun {
    pub(crate) command: String,
    pub(crate) passed: bool,
    pub(crate) timed_out: bool,
    pub(crate) exit_code: i32,
    pub(crate) output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub(crate) struct SubmitReport {
    pub(crate) files: Vec<String>,
    pub(crate) changed_lines: usize,
    pub(crate) diff_path: PathBuf,
    pub(crate) test: Option<TestRun>,
    pub(crate) elapsed_minutes: f64,
    pub(crate) time_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HintReport {
    pub(crate) number: u32,
    pub(crate) available: usize,
    pub(crate) text: Option<String>,
}

impl HintReport {
    pub(crate) fn penalty(&self) -> f64 {
        hint_penalty(self.number)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResetReport {
    pub(crate) previous: LifecycleState,
    pub(crate) removed_workspace: bool,
    pub(crate) abandoned_recorded: bool,
    pub(crate) restarted: Option<Session>,
}

/// Drives one challenge attempt through its lifecycle. Every mutating
/// operation holds the challenge lock across load, validate, mutate and persist.
pub(crate) struct SessionMachine<'a> {
    paths: &'a ForgePaths,
    config: &'a Config,
    catalog: &'a ChallengeCatalog,
    vcs: &'a dyn RevisionControl,
    backend: &'a dyn ReviewBackend,
    logger: &'a Logger,
}

impl<'a> SessionMachine<'a> {
    pub(crate) fn new(
        paths: &'a ForgePaths,
        config: &'a Config,
        catalog: &'a ChallengeCatalog,
        vcs: &'a dyn RevisionControl,
        backend: &'a dyn ReviewBackend,
        logger: &'a Logger,
    ) -> Self {
        Self {
            paths,
            config,
            catalog,
            vcs,
            backend,
            logger,
        }
    }

    fn workspaces(&self) -> WorkspaceManager<'a> {
        WorkspaceManager::new(
            self.paths,
            self.vcs,
            Duration::from_secs(self.config.lock_timeout_secs),
            self.logger,
        )
    }

    pub(crate) fn layout(&self, challenge_id: &str) -> WorkspaceLayout {
        self.workspaces().layout(challenge_id)
    }

    fn lock(&self, challenge_id: &str) -> Result<LockGuard, ForgeError> {
        lock::acquire(
            &self.paths.challenge_lock_path(challenge_id),
            challenge_id,
            Duration::from_secs(self.config.lock_timeout_secs),
            self.logger,
        )
    }

    fn load(&self, challenge_id: &str) -> Result<Option<Session>, ForgeError> {
        load_session(&self.layout(challenge_id).session)
    }

    /// Loads the session and checks that `op` is legal in its state.
    fn require(
        &self,
        challenge_id: &str,
        op: &'static str,
        allowed: &[LifecycleState],
        expected: &'static str,
    ) -> Result<Session, ForgeError> {
        let session = self.load(challenge_id)?;
        let state = session.as_ref().map_or(NotStarted, |session| session.state);
        let rejection = match session {
            Some(session) if allowed.contains(&session.state) => return Ok(session),
            _ if state == Completed => ForgeError::SessionCompleted(challenge_id.to_string()),
            _ => ForgeError::InvalidTransition {
                op,
                state,
                expected,
            },
        };
        self.logger
            .log_rejected(op, challenge_id, rejection.reason_tag());
        Err(rejection)
    }

    fn persist(
        &self,
        op: &str,
        session: &mut Session,
        from: LifecycleState,
    ) -> Result<(), ForgeError> {
        session.updated_at = Utc::now();
        save_session(&self.layout(&session.challenge_id).session, session)?;
        if from != session.state {
            self.logger
                .log_transition(op, &session.challenge_id, from, session.state);
        }
        Ok(())
    }

    pub(crate) fn status(&self, challenge_id: &str) -> Result<Option<Session>, ForgeError> {
        self.load(challenge_id)
    }

    /// Current state for display; unreadable sessions count as not started.
    pub(crate) fn state_of(&self, challenge_id: &str) -> LifecycleState {
        self.load(challenge_id)
            .ok()
            .flatten()
            .map_or(NotStarted, |session| session.state)
    }

    /// The explicit id, or the most recently updated unfinished session.
    pub(crate) fn resolve(&self, explicit: Option<&str>) -> Result<String, ForgeError> {
        if let Some(id) = explicit {
            return Ok(id.to_string());
        }
        let listing = match fs::read_dir(self.paths.workspaces_dir()) {
            Ok(listing) => listing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ForgeError::NoActiveSession)
            }
            Err(err) => {
                return Err(io_context("Failed to list workspaces")(err));
            }
        };
        let mut best: Option<Session> = None;
        for entry in listing.flatten() {
            let path = entry.path().join("session.json");
            let Ok(Some(session)) = load_session(&path) else {
                continue;
            };
            if !session.state.is_in_progress() {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |current| session.updated_at > current.updated_at)
            {
                best = Some(session);
            }
        }
        best.map(|session| session.challenge_id)
            .ok_or(ForgeError::NoActiveSession)
    }

    pub(crate) fn start(&self, challenge_id: &str) -> Result<Session, ForgeError> {
        let spec = self.catalog.get(challenge_id)?;
        let _lock = self.lock(challenge_id)?;
        if let Some(existing) = self.load(challenge_id)? {
            let rejection = match existing.state {
                NotStarted => None,
                Completed => Some(ForgeError::SessionCompleted(challenge_id.to_string())),
                state => Some(ForgeError::InvalidTransition {
                    op: "start",
                    state,
                    expected: "not_started (reset the challenge first)",
                }),
            };
            if let Some(rejection) = rejection {
                self.logger
                    .log_rejected("start", challenge_id, rejection.reason_tag());
                return Err(rejection);
            }
        }
        self.begin(spec)
    }

    fn begin(&self, spec: &ChallengeSpec) -> Result<Session, ForgeError> {
        let layout = self.workspaces().start(spec)?;
        let mut session = Session::new(&spec.id, &layout.root, &layout.journal);
        self.persist("start", &mut session, NotStarted)?;
        Ok(session)
    }

    /// Journal path of a session that still accepts journal edits. Checked
    /// without the lock so the editor never runs while holding it;
    /// `record_journal` checks again.
    pub(crate) fn editable_journal(&self, challenge_id: &str) -> Result<PathBuf, ForgeError> {
        self.require(challenge_id, "record journal", JOURNAL_STATES, "started or later")
            .map(|session| session.journal_path)
    }

    pub(crate) fn record_journal(&self, challenge_id: &str) -> Result<JournalOutcome, ForgeError> {
        let _lock = self.lock(challenge_id)?;
        let mut session = self.require(
            challenge_id,
            "record journal",
            JOURNAL_STATES,
            "started or later",
        )?;
        journal::validate_journal(&session.journal_path)?;
        if session.state != Started {
            return Ok(JournalOutcome::AlreadyRecorded);
        }
        session.state = JournalLogged;
        self.persist("think", &mut session, Started)?;
        Ok(JournalOutcome::Recorded)
    }

    pub(crate) fn submit(&self, challenge_id: &str) -> Result<SubmitReport, ForgeError> {
        let spec = self.catalog.get(challenge_id)?;
        let _lock = self.lock(challenge_id)?;
        let mut session = self.require(
            challenge_id,
            "submit",
            &[Started, JournalLogged, Submitted, Compared],
            "journal_logged through compared (reset to resubmit after review)",
        )?;
        let from = session.state;
        journal::validate_journal(&session.journal_path).inspect_err(|err| {
            self.logger
                .log_rejected("submit", challenge_id, err.reason_tag());
        })?;
        if from == Started {
            self.logger
                .log_transition("submit", challenge_id, Started, JournalLogged);
        }

        let layout = self.layout(challenge_id);
        let patch = diff::capture(self.vcs, &layout.repo, &spec.setup.base_commit)?;
        if patch.is_empty() {
            self.logger
                .log_rejected("submit", challenge_id, ForgeError::NoChanges.reason_tag());
            return Err(ForgeError::NoChanges);
        }
        write_atomic(&layout.user_diff, patch.render().as_bytes())?;
        let test = self.run_tests(spec, &layout)?;

        session.state = Submitted;
        session.submitted_at = Some(Utc::now());
        session.submission_path = Some(layout.user_diff.clone());
        session.test_passed = test.as_ref().map(|run| run.passed);
        session.last_comparison = None;
        session.last_review = None;
        session.last_export = None;
        let from = if from == Started { JournalLogged } else { from };
        self.persist("submit", &mut session, from)?;

        Ok(SubmitReport {
            files: patch.files.iter().map(|file| file.path.clone()).collect(),
            changed_lines: patch.changed_lines(),
            diff_path: layout.user_diff,
            test,
            elapsed_minutes: session.elapsed_minutes(),
            time_limit: spec.time_limit,
        })
    }

    fn run_tests(
        &self,
        spec: &ChallengeSpec,
        layout: &WorkspaceLayout,
    ) -> Result<Option<TestRun>, ForgeError> {
        let command = spec.setup.test_command.trim();
        if command.is_empty() {
            return Ok(None);
        }
        let timeout = Duration::from_secs(self.config.test_timeout_secs);
        let (report, passed, timed_out, exit_code) =
            match run_shell_with_timeout(command, &layout.repo, timeout, "test", self.logger) {
                Ok(output) => {
                    let mut report = format!("$ {}\n{}", command, output.stdout);
                    if !output.stderr.is_empty() {
                        report.push_str("\n--- stderr ---\n");
                        report.push_str(&output.stderr);
                    }
                    if output.timed_out {
                        report.push_str(&format!(
                            "\n--- timed out after {}s ---\n",
                            timeout.as_secs()
                        ));
                    } else {
                        report.push_str(&format!("\n--- exit code {} ---\n", output.exit_code));
                    }
                    (report, output.success(), output.timed_out, output.exit_code)
                }
                Err(ForgeError::Interrupted) => return Err(ForgeError::Interrupted),
                Err(err) => (format!("$ {}\nfailed to run: {}\n", command, err), false, false, -1),
            };
        write_atomic(&layout.test_output, report.as_bytes())?;
        Ok(Some(TestRun {
            command: command.to_string(),
            passed,
            timed_out,
            exit_code,
            output_path: layout.test_output.clone(),
        }))
    }

    fn solution(&self, spec: &ChallengeSpec, layout: &WorkspaceLayout) -> Result<Patch, ForgeError> {
        diff::solution_patch(
            self.vcs,
            &layout.repo,
            &spec.setup.base_commit,
            &spec.setup.solution_commit,
            &layout.solution_diff,
        )
    }

    fn submission(&self, layout: &WorkspaceLayout) -> Result<Patch, ForgeError> {
        let text = fs::read_to_string(&layout.user_diff)
            .map_err(io_context(format!("Failed to read {}", layout.user_diff.display())))?;
        Ok(Patch::parse(&text))
    }

    pub(crate) fn compare(&self, challenge_id: &str) -> Result<ComparisonResult, ForgeError> {
        let spec = self.catalog.get(challenge_id)?;
        let _lock = self.lock(challenge_id)?;
        let mut session = self.require(
            challenge_id,
            "compare",
            &[Submitted, Compared, Reviewed],
            "submitted or later",
        )?;
        let layout = self.layout(challenge_id);
        let result = diff::compare(&self.submission(&layout)?, &self.solution(spec, &layout)?);

        let from = session.state;
        if from == Submitted {
            session.state = Compared;
        }
        session.last_comparison = Some(result.clone());
        self.persist("compare", &mut session, from)?;
        Ok(result)
    }

    pub(crate) fn review(
        &self,
        challenge_id: &str,
        force_export: bool,
    ) -> Result<ReviewOutcome, ForgeError> {
        let spec = self.catalog.get(challenge_id)?;
        let _lock = self.lock(challenge_id)?;
        let mut session = self.require(
            challenge_id,
            "review",
            &[Compared, Reviewed],
            "compared or reviewed",
        )?;
        let layout = self.layout(challenge_id);
        let journal_text = journal::read_journal(&session.journal_path)?;
        let user_diff = self.submission(&layout)?.render();
        let solution_diff = self.solution(spec, &layout)?.render();
        let payload = ReviewPayload::new(
            spec,
            &journal_text,
            &user_diff,
            &solution_diff,
            session.hints_consumed,
            session.test_passed,
        );
        let outcome = request_review(
            &payload,
            self.backend,
            force_export,
            &layout.review_export,
            self.logger,
        )?;

        let from = session.state;
        match &outcome {
            ReviewOutcome::Scored(result) => {
                session.state = Reviewed;
                session.last_review = Some(result.clone());
            }
            ReviewOutcome::Exported { path, .. } => {
                session.last_export = Some(path.clone());
            }
        }
        self.persist("review", &mut session, from)?;
        Ok(outcome)
    }

    pub(crate) fn record_manual_score(
        &self,
        challenge_id: &str,
        scores: DimensionScores,
        rationale: Option<String>,
    ) -> Result<ReviewResult, ForgeError> {
        let _lock = self.lock(challenge_id)?;
        let mut session = self.require(
            challenge_id,
            "record score",
            &[Compared, Reviewed],
            "compared or reviewed",
        )?;
        let result = ReviewResult::new(scores, rationale, session.hints_consumed, "manual");
        let from = session.state;
        session.state = Reviewed;
        session.last_review = Some(result.clone());
        self.persist("score", &mut session, from)?;
        Ok(result)
    }

    pub(crate) fn hint(&self, challenge_id: &str) -> Result<HintReport, ForgeError> {
        let spec = self.catalog.get(challenge_id)?;
        let _lock = self.lock(challenge_id)?;
        let mut session = self.require(
            challenge_id,
            "hint",
            &[Started, JournalLogged, Submitted, Compared],
            "started through compared",
        )?;
        session.hints_consumed += 1;
        let number = session.hints_consumed;
        let from = session.state;
        self.persist("hint", &mut session, from)?;
        self.logger.log(&format!(
            "hint challenge={} consumed={}",
            challenge_id, number
        ));
        Ok(HintReport {
            number,
            available: spec.hints.len(),
            text: spec.hints.get(number as usize - 1).cloned(),
        })
    }

    pub(crate) fn complete(&self, challenge_id: &str) -> Result<HistoryRecord, ForgeError> {
        let spec = self.catalog.get(challenge_id)?;
        let _lock = self.lock(challenge_id)?;
        let mut session =
            self.require(challenge_id, "complete", &[Reviewed], "reviewed")?;
        let Some(review) = session.last_review.clone() else {
            return Err(ForgeError::InvalidTransition {
                op: "complete",
                state: session.state,
                expected: "a recorded review score",
            });
        };
        let now = Utc::now();
        let record = HistoryRecord {
            challenge_id: spec.id.clone(),
            title: spec.title.clone(),
            difficulty: spec.difficulty,
            started_at: session.started_at,
            completed_at: now,
            elapsed_minutes: session.elapsed_minutes(),
            hints_consumed: session.hints_consumed,
            scores: Some(review.scores),
            penalty: review.penalty,
            final_score: Some(review.final_score),
            test_passed: session.test_passed,
            completion: Completion::Completed,
        };
        self.append_history(&record)?;

        session.state = Completed;
        session.completed_at = Some(now);
        self.persist("complete", &mut session, Reviewed)?;
        Ok(record)
    }

    /// Destroys the attempt and returns it to `NotStarted`; with `restart`
    /// a fresh workspace is created right away. Unfinished attempts are
    /// recorded as abandoned.
    pub(crate) fn reset(&self, challenge_id: &str, restart: bool) -> Result<ResetReport, ForgeError> {
        let spec = self.catalog.get(challenge_id).ok();
        if restart && spec.is_none() {
            return Err(ForgeError::ChallengeNotFound(challenge_id.to_string()));
        }
        let _lock = self.lock(challenge_id)?;
        // A corrupt session file must not block a reset.
        let session = self.load(challenge_id).ok().flatten();
        let previous = session.as_ref().map_or(NotStarted, |session| session.state);

        let mut abandoned_recorded = false;
        if let (Some(session), Some(spec)) = (&session, spec) {
            if session.state.is_in_progress() {
                self.append_history(&HistoryRecord {
                    challenge_id: spec.id.clone(),
                    title: spec.title.clone(),
                    difficulty: spec.difficulty,
                    started_at: session.started_at,
                    completed_at: Utc::now(),
                    elapsed_minutes: session.elapsed_minutes(),
                    hints_consumed: session.hints_consumed,
                    scores: session.last_review.as_ref().map(|review| review.scores),
                    penalty: hint_penalty(session.hints_consumed),
                    final_score: None,
                    test_passed: session.test_passed,
                    completion: Completion::Abandoned,
                })?;
                abandoned_recorded = true;
            }
        }

        let removed_workspace = self.workspaces().destroy(challenge_id)?;
        self.logger
            .log_transition("reset", challenge_id, previous, NotStarted);

        let restarted = match (restart, spec) {
            (true, Some(spec)) => Some(self.begin(spec)?),
            _ => None,
        };
        Ok(ResetReport {
            previous,
            removed_workspace,
            abandoned_recorded,
            restarted,
        })
    }

    fn append_history(&self, record: &HistoryRecord) -> Result<(), ForgeError> {
        history::append(
            &self.paths.history_path(),
            &self.paths.history_lock_path(),
            record,
            Duration::from_secs(self.config.lock_timeout_secs),
            self.logger,
        )
    }
}
