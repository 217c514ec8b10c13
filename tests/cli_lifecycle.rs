use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

const JOURNAL: &str = "\
# Thinking journal

The helper subtracts one where every caller expects an increment, so the
result is off by two. Flip the operator and rerun the check script.
";

fn forge(home: &Path, args: &[&str]) -> Output {
    forge_with_env(home, args, &[])
}

fn forge_with_env(home: &Path, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_forge"));
    command
        .args(args)
        .env("FORGE_HOME", home)
        .env_remove("FORGE_GIT_BASE_URL")
        .env_remove("EDITOR")
        // Never a terminal, whatever runs the tests.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("run forge")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "expected success, got {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        stdout(output),
        stderr(output)
    );
}

fn assert_fails_with(output: &Output, needle: &str) {
    assert_eq!(
        output.status.code(),
        Some(1),
        "stdout: {}\nstderr: {}",
        stdout(output),
        stderr(output)
    );
    assert!(
        stderr(output).contains(needle),
        "expected {needle:?} in stderr: {}",
        stderr(output)
    );
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Forge Tests",
            "-c",
            "user.email=forge@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "init.defaultBranch=main",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Creates `<remotes>/acme/widgets` with a buggy commit and its fix.
fn seed_remote(remotes: &Path) -> (String, String) {
    let repo = remotes.join("acme").join("widgets");
    fs::create_dir_all(&repo).expect("remote dir");
    git(&repo, &["init", "--quiet"]);
    fs::write(repo.join("calc.py"), "def bump(a):\n    return a - 1\n").expect("write");
    fs::write(repo.join("README.md"), "# widgets\n").expect("write");
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "--quiet", "-m", "buggy"]);
    let base = git(&repo, &["rev-parse", "HEAD"]);
    fs::write(repo.join("calc.py"), "def bump(a):\n    return a + 1\n").expect("write");
    git(&repo, &["commit", "--quiet", "-am", "fix bump"]);
    let solution = git(&repo, &["rev-parse", "HEAD"]);
    (base, solution)
}

fn write_challenge(home: &Path, base: &str, solution: &str) {
    let yaml = format!(
        "id: demo-001\n\
title: Bump goes the wrong way\n\
repo: acme/widgets\n\
difficulty: easy\n\
time_limit: 15\n\
description: bump(1) should be 2.\n\
setup:\n  base_commit: {base}\n  solution_commit: {solution}\n  test_command: \"grep -q 'a + 1' calc.py\"\n  files_of_interest: [calc.py]\n\
tags: [arithmetic]\n\
hints:\n  - Read the operator.\n"
    );
    let dir = home.join("challenges");
    fs::create_dir_all(&dir).expect("challenges dir");
    fs::write(dir.join("demo-001.yaml"), yaml).expect("write challenge");
}

#[test]
fn version_prints_package_version() {
    let home = TempDir::new().expect("temp dir");
    let output = forge(home.path(), &["version"]);
    assert_ok(&output);
    assert_eq!(
        stdout(&output).trim(),
        format!("forge {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    let home = TempDir::new().expect("temp dir");
    let output = forge(home.path(), &["frobnicate"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn init_creates_layout_and_default_config() {
    let home = TempDir::new().expect("temp dir");
    let output = forge(home.path(), &["init"]);
    assert_ok(&output);
    for dir in ["challenges", "repos", "workspaces", "locks"] {
        assert!(home.path().join(dir).is_dir(), "missing {dir}");
    }
    let config = fs::read_to_string(home.path().join("config.yaml")).expect("config");
    assert!(config.contains("editor: vim"));

    let again = forge(home.path(), &["init"]);
    assert_ok(&again);
    assert!(stdout(&again).contains("Config already present"));
}

#[test]
fn config_set_get_and_mask_api_key() {
    let home = TempDir::new().expect("temp dir");
    assert_ok(&forge(home.path(), &["config", "api_provider", "openai"]));
    assert_ok(&forge(home.path(), &["config", "api_key", "sk-test-1234567890"]));

    let key = forge(home.path(), &["config", "api_key"]);
    assert_ok(&key);
    assert_eq!(stdout(&key).trim(), "sk-t...7890");

    let all = forge(home.path(), &["config"]);
    assert_ok(&all);
    let listing = stdout(&all);
    assert!(listing.contains("api_provider = openai"));
    assert!(listing.contains("api_model = (not set)"));
    assert!(!listing.contains("1234567890"));

    assert_ok(&forge(home.path(), &["config", "api_provider", "none"]));
    let cleared = forge(home.path(), &["config", "api_provider"]);
    assert_eq!(stdout(&cleared).trim(), "(not set)");
}

#[test]
fn config_rejects_unknown_provider_and_key() {
    let home = TempDir::new().expect("temp dir");
    assert_fails_with(
        &forge(home.path(), &["config", "api_provider", "skynet"]),
        "Unknown api_provider",
    );
    assert_fails_with(
        &forge(home.path(), &["config", "colour", "blue"]),
        "Unknown config key",
    );
    assert!(!home.path().join("config.yaml").exists());
}

#[test]
fn session_commands_without_session_explain_what_is_missing() {
    let home = TempDir::new().expect("temp dir");
    assert_fails_with(&forge(home.path(), &["submit"]), "No active challenge session");
    assert_fails_with(
        &forge(home.path(), &["start", "--id", "ghost"]),
        "Challenge not found: ghost",
    );
}

#[test]
fn list_skips_broken_definitions_with_warning() {
    let home = TempDir::new().expect("temp dir");
    write_challenge(home.path(), "aaaa111", "bbbb222");
    fs::write(
        home.path().join("challenges").join("broken.yaml"),
        "id: broken\ntitle: no setup\n",
    )
    .expect("write broken");

    let output = forge(home.path(), &["list"]);
    assert_ok(&output);
    assert!(stdout(&output).contains("demo-001"));
    assert!(stdout(&output).contains("not_started"));
    assert!(stderr(&output).contains("broken.yaml"));
}

#[test]
fn think_on_unstarted_challenge_fails_before_opening_editor() {
    let home = TempDir::new().expect("temp dir");
    write_challenge(home.path(), "aaaa111", "bbbb222");
    let marker = home.path().join("editor-ran");
    let editor = format!("touch {}", marker.display());
    let output = forge_with_env(
        home.path(),
        &["think", "--id", "demo-001"],
        &[("EDITOR", editor.as_str())],
    );
    assert_fails_with(&output, "Cannot record journal");
    assert!(!marker.exists(), "editor must not run");
}

#[test]
fn reset_refuses_without_confirmation_when_not_interactive() {
    let home = TempDir::new().expect("temp dir");
    write_challenge(home.path(), "aaaa111", "bbbb222");
    let output = forge(home.path(), &["reset", "--id", "demo-001"]);
    assert_fails_with(&output, "permanently deletes");
}

#[test]
fn full_lifecycle_against_local_git_remote() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let home = TempDir::new().expect("temp dir");
    let remotes = TempDir::new().expect("remotes dir");
    let (base, solution) = seed_remote(remotes.path());
    write_challenge(home.path(), &base, &solution);
    let remote_base = remotes.path().to_string_lossy().to_string();
    let envs = [("FORGE_GIT_BASE_URL", remote_base.as_str())];
    let run = |args: &[&str]| forge_with_env(home.path(), args, &envs);

    assert_ok(&run(&["start", "--id", "demo-001"]));
    let workspace = home.path().join("workspaces").join("demo-001");
    let repo = workspace.join("repo");
    assert_eq!(
        fs::read_to_string(repo.join("calc.py")).expect("checkout"),
        "def bump(a):\n    return a - 1\n"
    );
    assert_fails_with(&run(&["start", "--id", "demo-001"]), "Cannot start");

    // The template journal is not enough.
    assert_fails_with(&run(&["submit"]), "Journal is empty");

    fs::write(workspace.join("journal.md"), JOURNAL).expect("journal");
    let think = run(&["think", "--no-edit"]);
    assert_ok(&think);
    assert!(stdout(&think).contains("Journal recorded for demo-001"));

    let hint = run(&["hint"]);
    assert_ok(&hint);
    assert!(stdout(&hint).contains("Read the operator."));

    fs::write(repo.join("calc.py"), "def bump(a):\n    return a + 1\n").expect("edit");
    fs::write(repo.join("NOTES.txt"), "scratch\n").expect("untracked");
    let submit = run(&["submit"]);
    assert_ok(&submit);
    let submitted = stdout(&submit);
    assert!(submitted.contains("2 file(s)"), "{submitted}");
    assert!(submitted.contains("Tests passed"), "{submitted}");
    let user_diff = fs::read_to_string(workspace.join("submission").join("user.diff"))
        .expect("user diff");
    assert!(user_diff.contains("+    return a + 1"));
    assert!(user_diff.contains("NOTES.txt"));

    let compare = run(&["compare"]);
    assert_ok(&compare);
    let compared = stdout(&compare);
    assert!(compared.contains("Verdict: partial"), "{compared}");
    assert!(compared.contains("calc.py"), "{compared}");
    assert!(compared.contains("identical"), "{compared}");
    assert!(compared.contains("extraneous"), "{compared}");

    let review = run(&["review"]);
    assert_ok(&review);
    assert!(stdout(&review).contains("Review exported"));
    assert!(workspace.join("submission").join("review_export.md").is_file());
    let status = run(&["status"]);
    assert!(stdout(&status).contains("state:      compared"));

    assert_fails_with(
        &run(&[
            "review", "--score", "--correctness", "11", "--approach", "8", "--code-quality", "8",
            "--edge-cases", "8", "--thinking-depth", "8",
        ]),
        "between 1 and 10",
    );
    let scored = run(&[
        "review", "--score", "--correctness", "9", "--approach", "8", "--code-quality", "8",
        "--edge-cases", "7", "--thinking-depth", "8",
    ]);
    assert_ok(&scored);
    assert!(stdout(&scored).contains("final 7.5"), "{}", stdout(&scored));

    let complete = run(&["complete", "--id", "demo-001"]);
    assert_ok(&complete);
    assert!(stdout(&complete).contains("final score 7.5"));

    assert_fails_with(&run(&["hint", "--id", "demo-001"]), "already completed");

    let stats = run(&["stats"]);
    assert_ok(&stats);
    let stats_text = stdout(&stats);
    assert!(stats_text.contains("Attempts: 1 (1 completed, 0 abandoned)"), "{stats_text}");
    assert!(stats_text.contains("Level: Novice"), "{stats_text}");

    let reset = run(&["reset", "--id", "demo-001", "--yes"]);
    assert_ok(&reset);
    assert!(!workspace.exists());
    let list = run(&["list"]);
    assert!(stdout(&list).contains("not_started"));

    let log = fs::read_to_string(home.path().join("forge.log")).expect("log");
    assert!(log.contains("transition op=complete challenge=demo-001 from=reviewed to=completed"));
}
