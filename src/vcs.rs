use std::env;
use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::error::{io_context, ForgeError};
use crate::logger::Logger;
use crate::shell::{command_exists, run_capture, CommandOutput};

/// Overrides the clone source (`<base>/<owner>/<name>`), mainly for local mirrors.
pub(crate) const REMOTE_BASE_ENV: &str = "FORGE_GIT_BASE_URL";

/// Flags that make diff output independent of user git configuration.
const DIFF_FLAGS: [&str; 4] = ["--no-color", "--no-ext-diff", "--no-renames", "--full-index"];

/// Revision-control capability used by workspaces and the diff engine.
pub(crate) trait RevisionControl {
    /// Clones `repo` (owner/name) into `dest` unless a clone already exists there.
    fn ensure_clone(&self, repo: &str, dest: &Path) -> Result<(), ForgeError>;

    /// Makes `revision` available in `repo_dir`, fetching it when missing.
    fn ensure_revision(&self, repo: &str, repo_dir: &Path, revision: &str)
        -> Result<(), ForgeError>;

    /// Creates a working copy of `cache` at `dest`, checked out at `revision`.
    fn materialize(&self, cache: &Path, dest: &Path, revision: &str) -> Result<(), ForgeError>;

    /// Unified diff between two committed revisions.
    fn diff_revisions(&self, repo_dir: &Path, from: &str, to: &str)
        -> Result<String, ForgeError>;

    /// Unified diff from `base` to the current working tree, untracked files included.
    fn diff_worktree(&self, repo_dir: &Path, base: &str) -> Result<String, ForgeError>;
}

pub(crate) struct GitCli<'a> {
    logger: &'a Logger,
    remote_base: Option<String>,
}

impl<'a> GitCli<'a> {
    pub(crate) fn new(logger: &'a Logger) -> Self {
        Self {
            logger,
            remote_base: env::var(REMOTE_BASE_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }

    pub(crate) fn remote_url(&self, repo: &str) -> String {
        match &self.remote_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), repo),
            None => format!("https://github.com/{}.git", repo),
        }
    }

    fn git(
        &self,
        op: &str,
        cwd: Option<&Path>,
        index: Option<&Path>,
        args: &[&str],
    ) -> Result<CommandOutput, ForgeError> {
        if !command_exists("git") {
            return Err(ForgeError::Vcs {
                op: op.to_string(),
                cause: "git executable not found on PATH".to_string(),
            });
        }
        let mut argv: Vec<String> = vec!["-c".to_string(), "core.quotepath=false".to_string()];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        let envs: Vec<(&str, &Path)> = index
            .map(|index| vec![("GIT_INDEX_FILE", index)])
            .unwrap_or_default();
        run_capture("git", &argv, cwd, &envs, &format!("git_{}", op), self.logger)
    }

    fn git_ok(
        &self,
        op: &str,
        cwd: Option<&Path>,
        index: Option<&Path>,
        args: &[&str],
    ) -> Result<String, ForgeError> {
        let output = self.git(op, cwd, index, args)?;
        if !output.success() {
            return Err(ForgeError::Vcs {
                op: op.to_string(),
                cause: failure_cause(&output),
            });
        }
        Ok(output.stdout)
    }

    fn has_commit(&self, repo_dir: &Path, revision: &str) -> Result<bool, ForgeError> {
        let spec = format!("{}^{{commit}}", revision);
        let output = self.git("cat-file", Some(repo_dir), None, &["cat-file", "-e", &spec])?;
        Ok(output.success())
    }
}

impl RevisionControl for GitCli<'_> {
    fn ensure_clone(&self, repo: &str, dest: &Path) -> Result<(), ForgeError> {
        if dest.join(".git").exists() {
            return Ok(());
        }
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(io_context(format!("Failed to create {}", parent.display())))?;
        // Clone beside the cache and rename, so `dest` only ever holds a complete clone.
        let staging = tempfile::Builder::new()
            .prefix(".clone-")
            .tempdir_in(parent)
            .map_err(io_context(format!("Failed to stage clone in {}", parent.display())))?;
        let url = self.remote_url(repo);
        let staging_arg = staging.path().to_string_lossy().to_string();
        let output = self.git(
            "clone",
            None,
            None,
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--no-single-branch",
                &url,
                &staging_arg,
            ],
        )?;
        if !output.success() {
            return Err(ForgeError::FetchFailed {
                repo: repo.to_string(),
                revision: "HEAD".to_string(),
                cause: failure_cause(&output),
            });
        }
        if dest.exists() {
            fs::remove_dir_all(dest)
                .map_err(io_context(format!("Failed to clear {}", dest.display())))?;
        }
        fs::rename(staging.path(), dest)
            .map_err(io_context(format!("Failed to move clone into {}", dest.display())))?;
        Ok(())
    }

    fn ensure_revision(
        &self,
        repo: &str,
        repo_dir: &Path,
        revision: &str,
    ) -> Result<(), ForgeError> {
        if self.has_commit(repo_dir, revision)? {
            return Ok(());
        }
        let fetched = self.git(
            "fetch",
            Some(repo_dir),
            None,
            &["fetch", "--quiet", "origin", revision],
        )?;
        if !fetched.success() || !self.has_commit(repo_dir, revision)? {
            // Some servers refuse fetching by object id; fall back to full history.
            let unshallow = self.git(
                "fetch",
                Some(repo_dir),
                None,
                &["fetch", "--quiet", "--unshallow", "origin"],
            )?;
            if !self.has_commit(repo_dir, revision)? {
                let cause = if unshallow.success() {
                    failure_cause(&fetched)
                } else {
                    failure_cause(&unshallow)
                };
                return Err(ForgeError::FetchFailed {
                    repo: repo.to_string(),
                    revision: revision.to_string(),
                    cause,
                });
            }
        }
        Ok(())
    }

    fn materialize(&self, cache: &Path, dest: &Path, revision: &str) -> Result<(), ForgeError> {
        // A full copy keeps fetched-by-id commits that a clone of a shallow cache would drop.
        let copy = run_capture(
            "cp",
            &[
                "-a".to_string(),
                cache.to_string_lossy().to_string(),
                dest.to_string_lossy().to_string(),
            ],
            None,
            &[],
            "copy_cache",
            self.logger,
        )?;
        if !copy.success() {
            return Err(ForgeError::Vcs {
                op: "copy".to_string(),
                cause: failure_cause(&copy),
            });
        }
        self.git_ok(
            "checkout",
            Some(dest),
            None,
            &["checkout", "--quiet", "--force", "--detach", revision],
        )?;
        self.git_ok("clean", Some(dest), None, &["clean", "-q", "-fdx"])?;
        Ok(())
    }

    fn diff_revisions(&self, repo_dir: &Path, from: &str, to: &str) -> Result<String, ForgeError> {
        let mut args = vec!["diff"];
        args.extend(DIFF_FLAGS);
        args.extend([from, to]);
        self.git_ok("diff", Some(repo_dir), None, &args)
    }

    fn diff_worktree(&self, repo_dir: &Path, base: &str) -> Result<String, ForgeError> {
        // A throwaway index keeps the user's staging area untouched.
        let scratch = TempDir::new().map_err(io_context("Failed to create scratch index dir"))?;
        let index = scratch.path().join("index");
        self.git_ok("read-tree", Some(repo_dir), Some(&index), &["read-tree", base])?;
        self.git_ok("add", Some(repo_dir), Some(&index), &["add", "-A", "."])?;
        let mut args = vec!["diff", "--cached"];
        args.extend(DIFF_FLAGS);
        args.push(base);
        self.git_ok("diff", Some(repo_dir), Some(&index), &args)
    }
}

fn failure_cause(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {}", output.exit_code)
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_url_defaults_to_github() {
        let logger = Logger::discard();
        let git = GitCli {
            logger: &logger,
            remote_base: None,
        };
        assert_eq!(
            git.remote_url("octo/widgets"),
            "https://github.com/octo/widgets.git"
        );
    }

    #[test]
    fn remote_url_honours_local_base() {
        let logger = Logger::discard();
        let git = GitCli {
            logger: &logger,
            remote_base: Some("/srv/mirrors/".to_string()),
        };
        assert_eq!(git.remote_url("octo/widgets"), "/srv/mirrors/octo/widgets");
    }

    fn git_in(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args([
                "-c",
                "user.name=Forge Tests",
                "-c",
                "user.email=forge@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?}");
    }

    #[test]
    fn clone_replaces_a_partial_cache_and_leaves_no_staging() {
        if !command_exists("git") {
            eprintln!("git not available; skipping");
            return;
        }
        let remotes = TempDir::new().expect("remotes");
        let origin = remotes.path().join("octo").join("widgets");
        fs::create_dir_all(&origin).expect("origin dir");
        git_in(&origin, &["init", "--quiet"]);
        fs::write(origin.join("lib.rs"), "fn main() {}\n").expect("write");
        git_in(&origin, &["add", "-A"]);
        git_in(&origin, &["commit", "--quiet", "-m", "initial"]);

        let home = TempDir::new().expect("home");
        let cache = home.path().join("repos").join("octo__widgets");
        fs::create_dir_all(&cache).expect("cache dir");
        fs::write(cache.join("half-written"), "").expect("leftover");

        let logger = Logger::discard();
        let git = GitCli {
            logger: &logger,
            remote_base: Some(remotes.path().to_string_lossy().to_string()),
        };
        git.ensure_clone("octo/widgets", &cache).expect("clone");
        assert!(cache.join(".git").exists());
        assert!(cache.join("lib.rs").is_file());
        assert!(!cache.join("half-written").exists());
        let leftovers: Vec<_> = fs::read_dir(home.path().join("repos"))
            .expect("list repos")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".clone-"))
            .collect();
        assert!(leftovers.is_empty());

        let err = git
            .ensure_clone("octo/missing", &home.path().join("repos").join("octo__missing"))
            .expect_err("missing remote");
        assert!(matches!(err, ForgeError::FetchFailed { .. }));
        assert!(!home.path().join("repos").join("octo__missing").exists());
    }

    #[test]
    fn failure_cause_prefers_stderr() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "fatal: bad revision\n".to_string(),
            exit_code: 128,
            timed_out: false,
        };
        assert_eq!(failure_cause(&output), "fatal: bad revision");
        let silent = CommandOutput {
            stderr: String::new(),
            ..output
        };
        assert_eq!(failure_cause(&silent), "exit code 128");
    }
}
