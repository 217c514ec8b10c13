use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::challenge::ChallengeSpec;
use crate::config::ForgePaths;
use crate::error::{io_context, ForgeError};
use crate::journal;
use crate::lock;
use crate::logger::Logger;
use crate::vcs::RevisionControl;

/// File locations inside `workspaces/<id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkspaceLayout {
    pub(crate) root: PathBuf,
    pub(crate) repo: PathBuf,
    pub(crate) journal: PathBuf,
    pub(crate) session: PathBuf,
    pub(crate) solution_diff: PathBuf,
    pub(crate) submission_dir: PathBuf,
    pub(crate) user_diff: PathBuf,
    pub(crate) test_output: PathBuf,
    pub(crate) review_export: PathBuf,
}

impl WorkspaceLayout {
    pub(crate) fn new(root: PathBuf) -> Self {
        let submission_dir = root.join("submission");
        Self {
            repo: root.join("repo"),
            journal: root.join("journal.md"),
            session: root.join("session.json"),
            solution_diff: root.join("solution.diff"),
            user_diff: submission_dir.join("user.diff"),
            test_output: submission_dir.join("test_output.txt"),
            review_export: submission_dir.join("review_export.md"),
            submission_dir,
            root,
        }
    }
}

pub(crate) struct WorkspaceManager<'a> {
    paths: &'a ForgePaths,
    vcs: &'a dyn RevisionControl,
    lock_timeout: Duration,
    logger: &'a Logger,
}

impl<'a> WorkspaceManager<'a> {
    pub(crate) fn new(
        paths: &'a ForgePaths,
        vcs: &'a dyn RevisionControl,
        lock_timeout: Duration,
        logger: &'a Logger,
    ) -> Self {
        Self {
            paths,
            vcs,
            lock_timeout,
            logger,
        }
    }

    pub(crate) fn layout(&self, challenge_id: &str) -> WorkspaceLayout {
        WorkspaceLayout::new(self.paths.workspace_dir(challenge_id))
    }

    /// Fetches the source repository and lays out a fresh workspace at the
    /// base revision. Any leftover directory for the id is replaced; on
    /// failure nothing is left behind. The shared repository cache is only
    /// touched under its own lock.
    pub(crate) fn start(&self, spec: &ChallengeSpec) -> Result<WorkspaceLayout, ForgeError> {
        let cache = self.paths.repo_cache_dir(&spec.repo);
        let _cache_lock = lock::acquire(
            &self.paths.repo_lock_path(&spec.repo),
            &format!("repository {}", spec.repo),
            self.lock_timeout,
            self.logger,
        )?;
        self.vcs.ensure_clone(&spec.repo, &cache)?;
        for revision in [&spec.setup.base_commit, &spec.setup.solution_commit] {
            self.vcs.ensure_revision(&spec.repo, &cache, revision)?;
        }

        let layout = self.layout(&spec.id);
        remove_tree(&layout.root)?;
        fs::create_dir_all(&layout.submission_dir)
            .map_err(io_context(format!("Failed to create {}", layout.root.display())))?;

        let populated = self
            .vcs
            .materialize(&cache, &layout.repo, &spec.setup.base_commit)
            .and_then(|_| journal::write_template(&layout.journal, spec));
        if let Err(err) = populated {
            let _ = fs::remove_dir_all(&layout.root);
            return Err(err);
        }

        self.logger.log(&format!(
            "workspace created challenge={} repo={} base={} path={}",
            spec.id,
            spec.repo,
            spec.setup.base_commit,
            layout.root.display()
        ));
        Ok(layout)
    }

    /// Removes the workspace tree; returns whether anything existed.
    pub(crate) fn destroy(&self, challenge_id: &str) -> Result<bool, ForgeError> {
        let layout = self.layout(challenge_id);
        let existed = layout.root.exists();
        remove_tree(&layout.root)?;
        if existed {
            self.logger.log(&format!(
                "workspace destroyed challenge={} path={}",
                challenge_id,
                layout.root.display()
            ));
        }
        Ok(existed)
    }
}

fn remove_tree(path: &Path) -> Result<(), ForgeError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ForgeError::Io {
            context: format!("Failed to remove {}", path.display()),
            source: err,
        }),
    }
}
