use shell_escape::unix::escape;
use std::env;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{io_context, ForgeError};
use crate::logger::{sanitize_log_value, Logger};

/// Set by the Ctrl-C handler; checked after child processes, backend calls
/// and between lock polls.
pub(crate) static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn check_interrupted() -> Result<(), ForgeError> {
    check_flag(&INTERRUPTED)
}

pub(crate) fn check_flag(flag: &AtomicBool) -> Result<(), ForgeError> {
    if flag.load(Ordering::SeqCst) {
        return Err(ForgeError::Interrupted);
    }
    Ok(())
}

pub(crate) fn render_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
    pub(crate) timed_out: bool,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs `program args...` in `cwd` and captures both streams.
pub(crate) fn run_capture(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    envs: &[(&str, &Path)],
    log_label: &str,
    logger: &Logger,
) -> Result<CommandOutput, ForgeError> {
    logger.log(&format!(
        "cmd start label={} mode=argv command={} args={}",
        log_label,
        program,
        sanitize_log_value(&render_args(args))
    ));

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let output = cmd
        .output()
        .map_err(io_context(format!("Failed to run {}", program)))?;

    let exit_code = output.status.code().unwrap_or(1);
    logger.log(&format!("cmd exit label={} exit={}", log_label, exit_code));
    check_interrupted()?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code,
        timed_out: false,
    })
}

/// Runs `command` through `bash -lc` in `cwd`, killing it once `timeout`
/// elapses. Output is spooled to temp files so large test logs cannot
/// block the child on a full pipe.
pub(crate) fn run_shell_with_timeout(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    log_label: &str,
    logger: &Logger,
) -> Result<CommandOutput, ForgeError> {
    logger.log(&format!(
        "cmd start label={} mode=bash_lc command={} timeout_secs={}",
        log_label,
        sanitize_log_value(command),
        timeout.as_secs()
    ));

    let mut stdout_file = tempfile::tempfile().map_err(io_context("Failed to spool stdout"))?;
    let mut stderr_file = tempfile::tempfile().map_err(io_context("Failed to spool stderr"))?;
    let mut child = Command::new("bash")
        .arg("-lc")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            stdout_file
                .try_clone()
                .map_err(io_context("Failed to spool stdout"))?,
        ))
        .stderr(Stdio::from(
            stderr_file
                .try_clone()
                .map_err(io_context("Failed to spool stderr"))?,
        ))
        .spawn()
        .map_err(io_context(format!("Failed to run command '{}'", command)))?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(io_context("Failed to wait for command"))?
        {
            break Some(status);
        }
        if Instant::now() >= deadline || INTERRUPTED.load(Ordering::SeqCst) {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(Duration::from_millis(50));
    };

    let exit_code = status.and_then(|status| status.code()).unwrap_or(-1);
    let timed_out = status.is_none();
    logger.log(&format!(
        "cmd exit label={} exit={} timed_out={}",
        log_label, exit_code, timed_out
    ));
    check_interrupted()?;

    Ok(CommandOutput {
        stdout: read_spool(&mut stdout_file)?,
        stderr: read_spool(&mut stderr_file)?,
        exit_code,
        timed_out,
    })
}

fn read_spool(file: &mut File) -> Result<String, ForgeError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut bytes))
        .map_err(io_context("Failed to read command output"))?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Runs an interactive command (editor) with inherited stdio; `args` are
/// passed as positional parameters to `bash -lc`. The child shares the
/// terminal, so a Ctrl-C typed inside it belongs to it and is not treated
/// as an interrupt of forge.
pub(crate) fn run_shell_command_status(
    command: &str,
    args: &[String],
    log_label: &str,
    logger: &Logger,
) -> Result<i32, ForgeError> {
    run_interactive(command, args, &INTERRUPTED, log_label, logger)
}

fn run_interactive(
    command: &str,
    args: &[String],
    interrupted: &AtomicBool,
    log_label: &str,
    logger: &Logger,
) -> Result<i32, ForgeError> {
    interrupted.store(false, Ordering::SeqCst);
    logger.log(&format!(
        "cmd start label={} mode=bash_lc command={} args={}",
        log_label,
        sanitize_log_value(command),
        sanitize_log_value(&render_args(args))
    ));

    let status = Command::new("bash")
        .arg("-lc")
        .arg(command)
        .arg("--")
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(io_context(format!("Failed to run command '{}'", command)))?;

    let exit_code = status.code().unwrap_or(1);
    if interrupted.swap(false, Ordering::SeqCst) {
        logger.log(&format!("cmd interrupt ignored label={}", log_label));
    }
    logger.log(&format!("cmd exit label={} exit={}", log_label, exit_code));
    Ok(exit_code)
}

pub(crate) fn command_exists(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|path| {
        let full = path.join(name);
        full.is_file() || full.is_symlink()
    })
}
